//! Curing profile: the fixed, ordered table of four stages the barn moves
//! through (yellowing → leaf drying → midrib drying → ordering).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of stages in a curing run.
pub const STAGE_COUNT: usize = 4;

const HOUR: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub target_temperature: f32,
    pub max_temperature: f32,
    pub target_humidity: f32,
    pub duration_secs: u64,
    /// Run the fans for the whole stage regardless of humidity.
    #[serde(default)]
    pub always_ventilate: bool,
}

impl Stage {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Immutable stage sequence. Indices are always clamped into `0..STAGE_COUNT`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTable {
    stages: Vec<Stage>,
}

impl StageTable {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        if stages.len() != STAGE_COUNT {
            bail!(
                "a curing profile needs exactly {STAGE_COUNT} stages, got {}",
                stages.len()
            );
        }
        Ok(Self { stages })
    }

    /// Flue-curing profile used when the config file defines no stages.
    pub fn flue_cured() -> Self {
        Self {
            stages: vec![
                Stage {
                    name: "YELLOWING".into(),
                    target_temperature: 35.0,
                    max_temperature: 42.0,
                    target_humidity: 85.0,
                    duration_secs: 48 * HOUR,
                    always_ventilate: false,
                },
                Stage {
                    name: "LEAF_DRYING".into(),
                    target_temperature: 46.0,
                    max_temperature: 55.0,
                    target_humidity: 70.0,
                    duration_secs: 24 * HOUR,
                    always_ventilate: true,
                },
                Stage {
                    name: "MIDRIB_DRYING".into(),
                    target_temperature: 65.0,
                    max_temperature: 70.0,
                    target_humidity: 50.0,
                    duration_secs: 24 * HOUR,
                    always_ventilate: false,
                },
                Stage {
                    name: "ORDERING".into(),
                    target_temperature: 25.0,
                    max_temperature: 30.0,
                    target_humidity: 80.0,
                    duration_secs: 12 * HOUR,
                    always_ventilate: false,
                },
            ],
        }
    }

    pub fn get(&self, index: usize) -> &Stage {
        &self.stages[index.min(self.last_index())]
    }

    pub fn last_index(&self) -> usize {
        self.stages.len() - 1
    }

    /// Index after `index`, holding at the final stage.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1).min(self.last_index())
    }

    pub fn is_last(&self, index: usize) -> bool {
        index >= self.last_index()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flue_cured_has_four_stages_in_order() {
        let table = StageTable::flue_cured();
        let names: Vec<_> = table.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["YELLOWING", "LEAF_DRYING", "MIDRIB_DRYING", "ORDERING"]
        );
        assert_eq!(table.last_index(), 3);
    }

    #[test]
    fn only_leaf_drying_forces_ventilation() {
        let table = StageTable::flue_cured();
        let forced: Vec<_> = table
            .iter()
            .filter(|s| s.always_ventilate)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(forced, ["LEAF_DRYING"]);
    }

    #[test]
    fn next_index_holds_at_last_stage() {
        let table = StageTable::flue_cured();
        assert_eq!(table.next_index(0), 1);
        assert_eq!(table.next_index(2), 3);
        assert_eq!(table.next_index(3), 3);
    }

    #[test]
    fn get_clamps_out_of_range_index() {
        let table = StageTable::flue_cured();
        assert_eq!(table.get(99).name, "ORDERING");
    }

    #[test]
    fn new_rejects_wrong_stage_count() {
        let mut stages: Vec<Stage> = StageTable::flue_cured().iter().cloned().collect();
        stages.pop();
        let err = StageTable::new(stages).unwrap_err();
        assert!(err.to_string().contains("exactly 4 stages"));
    }

    #[test]
    fn duration_converts_seconds() {
        let table = StageTable::flue_cured();
        assert_eq!(table.get(3).duration(), Duration::from_secs(12 * 3600));
    }
}
