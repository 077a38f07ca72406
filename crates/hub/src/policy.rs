//! Control policy for the curing barn as a pure state machine over
//! `Mode × Stage`.
//!
//! [`step`] takes the current [`ControlState`] plus one tick's inputs (time
//! and sensor sample) and returns the next state together with the actuator
//! changes it implies. Nothing here touches hardware, locks, or clocks, so
//! the whole policy is testable with plain values.
//!
//! ```text
//!            toggle_mode                    duration elapsed
//!   AUTO ◀──────────────▶ MANUAL     stage n ───────────────▶ stage n+1
//!   (loop drives outputs)  (operator)          (AUTO only, holds at last)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use time::OffsetDateTime;

use crate::stage::{Stage, StageTable};

/// Allowed deviation from the stage target before the alarm sounds (°C).
pub const ALARM_BAND_C: f32 = 2.0;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Auto,
    Manual,
}

impl Mode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Auto => Self::Manual,
            Self::Manual => Self::Auto,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "AUTO"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actuator {
    Heater,
    Fan1,
    Fan2,
    Dehumidifier1,
    Dehumidifier2,
    Buzzer,
}

impl Actuator {
    pub const ALL: [Actuator; 6] = [
        Actuator::Heater,
        Actuator::Fan1,
        Actuator::Fan2,
        Actuator::Dehumidifier1,
        Actuator::Dehumidifier2,
        Actuator::Buzzer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Heater => "heater",
            Self::Fan1 => "fan-1",
            Self::Fan2 => "fan-2",
            Self::Dehumidifier1 => "dehumidifier-1",
            Self::Dehumidifier2 => "dehumidifier-2",
            Self::Buzzer => "buzzer",
        }
    }

    /// Outputs the control loop owns while in AUTO. The buzzer is owned by
    /// the alarm in every mode and is handled separately.
    pub fn is_governed(self) -> bool {
        !matches!(self, Self::Buzzer)
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a toggle request addresses: one output or a paired group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorTarget {
    One(Actuator),
    Fans,
    Dehumidifiers,
}

impl ActuatorTarget {
    /// Parse a request name (`heater`, `fan-1`, `fan`, `dehumidifier`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "fan" | "fans" => Some(Self::Fans),
            "dehumidifier" | "dehumidifiers" => Some(Self::Dehumidifiers),
            _ => Actuator::ALL
                .into_iter()
                .find(|a| a.name() == name)
                .map(Self::One),
        }
    }

    pub fn members(self) -> &'static [Actuator] {
        match self {
            Self::One(Actuator::Heater) => &[Actuator::Heater],
            Self::One(Actuator::Fan1) => &[Actuator::Fan1],
            Self::One(Actuator::Fan2) => &[Actuator::Fan2],
            Self::One(Actuator::Dehumidifier1) => &[Actuator::Dehumidifier1],
            Self::One(Actuator::Dehumidifier2) => &[Actuator::Dehumidifier2],
            Self::One(Actuator::Buzzer) => &[Actuator::Buzzer],
            Self::Fans => &[Actuator::Fan1, Actuator::Fan2],
            Self::Dehumidifiers => &[Actuator::Dehumidifier1, Actuator::Dehumidifier2],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::One(a) => a.name(),
            Self::Fans => "fan",
            Self::Dehumidifiers => "dehumidifier",
        }
    }
}

/// Commanded on/off state of every output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorStates {
    pub heater: bool,
    #[serde(rename = "fan-1")]
    pub fan_1: bool,
    #[serde(rename = "fan-2")]
    pub fan_2: bool,
    #[serde(rename = "dehumidifier-1")]
    pub dehumidifier_1: bool,
    #[serde(rename = "dehumidifier-2")]
    pub dehumidifier_2: bool,
    pub buzzer: bool,
}

impl ActuatorStates {
    pub fn get(&self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Heater => self.heater,
            Actuator::Fan1 => self.fan_1,
            Actuator::Fan2 => self.fan_2,
            Actuator::Dehumidifier1 => self.dehumidifier_1,
            Actuator::Dehumidifier2 => self.dehumidifier_2,
            Actuator::Buzzer => self.buzzer,
        }
    }

    pub fn set(&mut self, actuator: Actuator, on: bool) {
        let slot = match actuator {
            Actuator::Heater => &mut self.heater,
            Actuator::Fan1 => &mut self.fan_1,
            Actuator::Fan2 => &mut self.fan_2,
            Actuator::Dehumidifier1 => &mut self.dehumidifier_1,
            Actuator::Dehumidifier2 => &mut self.dehumidifier_2,
            Actuator::Buzzer => &mut self.buzzer,
        };
        *slot = on;
    }

    /// Outputs whose value in `other` differs from `self`, with the new value.
    pub fn changes_to(&self, other: &ActuatorStates) -> Vec<(Actuator, bool)> {
        Actuator::ALL
            .into_iter()
            .filter(|a| self.get(*a) != other.get(*a))
            .map(|a| (a, other.get(a)))
            .collect()
    }

    /// Compact `HFFDDB`-style flags for log lines, `-` for off.
    pub fn flags(&self) -> String {
        const LETTERS: [char; 6] = ['H', 'F', 'F', 'D', 'D', 'B'];
        Actuator::ALL
            .into_iter()
            .zip(LETTERS)
            .map(|(a, c)| if self.get(a) { c } else { '-' })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One successful sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature: f32,
    pub humidity: f32,
}

/// Last known reading. Failed polls keep the previous values and clear
/// `valid`; `read_at` is when the values were actually taken.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatestReading {
    pub temperature: f32,
    pub humidity: f32,
    pub valid: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
}

impl LatestReading {
    /// Placeholder before the first successful poll.
    pub fn missing() -> Self {
        Self {
            temperature: 0.0,
            humidity: 0.0,
            valid: false,
            read_at: None,
        }
    }

    pub fn fresh(m: Measurement, at: OffsetDateTime) -> Self {
        Self {
            temperature: m.temperature,
            humidity: m.humidity,
            valid: true,
            read_at: Some(at),
        }
    }
}

// ---------------------------------------------------------------------------
// Alarm
// ---------------------------------------------------------------------------

/// Alarm is raised iff the reading is valid and strictly more than
/// [`ALARM_BAND_C`] away from the stage target.
pub fn alarm_active(reading: &LatestReading, target_temperature: f32) -> bool {
    reading.valid && (reading.temperature - target_temperature).abs() > ALARM_BAND_C
}

// ---------------------------------------------------------------------------
// State + transition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlState {
    pub mode: Mode,
    pub stage_index: usize,
    pub stage_started_at: Instant,
    pub reading: LatestReading,
    pub actuators: ActuatorStates,
    pub alarm_active: bool,
}

impl ControlState {
    /// Fresh run: AUTO, first stage, everything off.
    pub fn new(now: Instant) -> Self {
        Self {
            mode: Mode::Auto,
            stage_index: 0,
            stage_started_at: now,
            reading: LatestReading::missing(),
            actuators: ActuatorStates::default(),
            alarm_active: false,
        }
    }

    /// Re-derive the alarm (and the buzzer that mirrors it) from the current
    /// reading and active stage.
    pub fn refresh_alarm(&mut self, stages: &StageTable) {
        let target = stages.get(self.stage_index).target_temperature;
        self.alarm_active = alarm_active(&self.reading, target);
        self.actuators.buzzer = self.alarm_active;
    }
}

/// Inputs for one control tick.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub now: Instant,
    pub wall: OffsetDateTime,
    /// `None` when the sensor poll failed or timed out.
    pub sample: Option<Measurement>,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub next: ControlState,
    pub changes: Vec<(Actuator, bool)>,
    pub advanced_to: Option<usize>,
    pub alarm_changed: bool,
}

/// AUTO outputs for a valid sample: heater below target, dehumidifiers above
/// target humidity, fans with the dehumidifiers or when the stage forces
/// ventilation.
pub fn auto_outputs(m: &Measurement, stage: &Stage, current: ActuatorStates) -> ActuatorStates {
    let heat = m.temperature < stage.target_temperature;
    let dry = m.humidity > stage.target_humidity;
    let ventilate = dry || stage.always_ventilate;

    let mut out = current;
    out.heater = heat;
    out.dehumidifier_1 = dry;
    out.dehumidifier_2 = dry;
    out.fan_1 = ventilate;
    out.fan_2 = ventilate;
    out
}

/// One control tick.
///
/// A failed sample leaves every governed output untouched (no acting on an
/// unknown state) but stage timing is still evaluated. Stage timing is
/// settled first, so outputs and the alarm always follow the stage the tick
/// ends in.
pub fn step(current: &ControlState, stages: &StageTable, input: &TickInput) -> Transition {
    let mut next = *current;

    let mut advanced_to = None;
    if next.mode == Mode::Auto && !stages.is_last(next.stage_index) {
        let elapsed = input.now.saturating_duration_since(next.stage_started_at);
        if elapsed >= stages.get(next.stage_index).duration() {
            next.stage_index = stages.next_index(next.stage_index);
            next.stage_started_at = input.now;
            advanced_to = Some(next.stage_index);
        }
    }

    match input.sample {
        Some(m) => {
            next.reading = LatestReading::fresh(m, input.wall);
            if next.mode == Mode::Auto {
                next.actuators = auto_outputs(&m, stages.get(next.stage_index), next.actuators);
            }
        }
        None => next.reading.valid = false,
    }
    next.refresh_alarm(stages);

    Transition {
        changes: current.actuators.changes_to(&next.actuators),
        alarm_changed: current.alarm_active != next.alarm_active,
        advanced_to,
        next,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn profile() -> StageTable {
        StageTable::new(vec![
            Stage {
                name: "S0".into(),
                target_temperature: 30.0,
                max_temperature: 35.0,
                target_humidity: 70.0,
                duration_secs: 3600,
                always_ventilate: false,
            },
            Stage {
                name: "S1".into(),
                target_temperature: 40.0,
                max_temperature: 45.0,
                target_humidity: 60.0,
                duration_secs: 3600,
                always_ventilate: true,
            },
            Stage {
                name: "S2".into(),
                target_temperature: 50.0,
                max_temperature: 55.0,
                target_humidity: 50.0,
                duration_secs: 3600,
                always_ventilate: false,
            },
            Stage {
                name: "S3".into(),
                target_temperature: 25.0,
                max_temperature: 30.0,
                target_humidity: 80.0,
                duration_secs: 3600,
                always_ventilate: false,
            },
        ])
        .unwrap()
    }

    fn input(now: Instant, t: f32, h: f32) -> TickInput {
        TickInput {
            now,
            wall: OffsetDateTime::now_utc(),
            sample: Some(Measurement {
                temperature: t,
                humidity: h,
            }),
        }
    }

    fn failed(now: Instant) -> TickInput {
        TickInput {
            now,
            wall: OffsetDateTime::now_utc(),
            sample: None,
        }
    }

    // -- Mode / actuator names -------------------------------------------

    #[test]
    fn mode_toggle_is_involutive() {
        assert_eq!(Mode::Auto.toggled().toggled(), Mode::Auto);
        assert_eq!(Mode::Manual.toggled(), Mode::Auto);
    }

    #[test]
    fn mode_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Mode::Manual).unwrap(), "\"MANUAL\"");
    }

    #[test]
    fn actuator_target_parses_singles_and_groups() {
        assert_eq!(
            ActuatorTarget::parse("fan-2"),
            Some(ActuatorTarget::One(Actuator::Fan2))
        );
        assert_eq!(ActuatorTarget::parse(" FAN "), Some(ActuatorTarget::Fans));
        assert_eq!(
            ActuatorTarget::parse("dehumidifier"),
            Some(ActuatorTarget::Dehumidifiers)
        );
        assert_eq!(ActuatorTarget::parse("sprinkler"), None);
    }

    #[test]
    fn actuator_states_serialize_with_output_names() {
        let json = serde_json::to_value(ActuatorStates::default()).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        for a in Actuator::ALL {
            assert!(keys.contains(&a.name().to_string()), "missing {a}");
        }
    }

    #[test]
    fn changes_to_lists_only_differences() {
        let before = ActuatorStates::default();
        let mut after = before;
        after.set(Actuator::Heater, true);
        after.set(Actuator::Fan2, true);
        assert_eq!(
            before.changes_to(&after),
            vec![(Actuator::Heater, true), (Actuator::Fan2, true)]
        );
        assert!(after.changes_to(&after).is_empty());
    }

    #[test]
    fn flags_render_off_as_dash() {
        let mut s = ActuatorStates::default();
        s.heater = true;
        s.buzzer = true;
        assert_eq!(s.flags(), "H----B");
    }

    // -- Alarm -----------------------------------------------------------

    #[test]
    fn alarm_boundary_is_exclusive() {
        let at = |t| LatestReading::fresh(
            Measurement {
                temperature: t,
                humidity: 50.0,
            },
            OffsetDateTime::now_utc(),
        );
        assert!(!alarm_active(&at(28.0), 30.0));
        assert!(!alarm_active(&at(32.0), 30.0));
        assert!(alarm_active(&at(27.9), 30.0));
        assert!(alarm_active(&at(32.1), 30.0));
    }

    #[test]
    fn alarm_never_fires_on_invalid_reading() {
        let mut r = LatestReading::missing();
        r.temperature = 100.0;
        assert!(!alarm_active(&r, 30.0));
    }

    // -- Heater / dehumidifier properties ---------------------------------

    #[test]
    fn heater_follows_target_in_auto() {
        let stages = profile();
        let t0 = Instant::now();
        let state = ControlState::new(t0);
        for tenth in 150..450 {
            let t = tenth as f32 / 10.0;
            let tr = step(&state, &stages, &input(t0, t, 60.0));
            assert_eq!(tr.next.actuators.heater, t < 30.0, "T={t}");
        }
    }

    #[test]
    fn dehumidifier_follows_humidity_in_auto() {
        let stages = profile();
        let t0 = Instant::now();
        let state = ControlState::new(t0);
        for h in 40..100 {
            let h = h as f32;
            let tr = step(&state, &stages, &input(t0, 30.0, h));
            let dry = h > 70.0;
            assert_eq!(tr.next.actuators.dehumidifier_1, dry, "H={h}");
            assert_eq!(tr.next.actuators.dehumidifier_2, dry, "H={h}");
            assert_eq!(tr.next.actuators.fan_1, dry, "H={h}");
        }
    }

    #[test]
    fn always_ventilate_stage_keeps_fans_on() {
        let stages = profile();
        let t0 = Instant::now();
        let mut state = ControlState::new(t0);
        state.stage_index = 1;
        let tr = step(&state, &stages, &input(t0, 40.0, 10.0));
        assert!(tr.next.actuators.fan_1 && tr.next.actuators.fan_2);
        assert!(!tr.next.actuators.dehumidifier_1);
    }

    #[test]
    fn manual_mode_never_changes_governed_outputs() {
        let stages = profile();
        let t0 = Instant::now();
        let mut state = ControlState::new(t0);
        state.mode = Mode::Manual;
        state.actuators.fan_1 = true;
        let tr = step(&state, &stages, &input(t0, 10.0, 99.0));
        assert!(!tr.next.actuators.heater);
        assert!(!tr.next.actuators.dehumidifier_1);
        assert!(tr.next.actuators.fan_1);
        // Alarm still tracks the sensor.
        assert!(tr.next.alarm_active);
        assert_eq!(tr.changes, vec![(Actuator::Buzzer, true)]);
    }

    // -- Scenarios -------------------------------------------------------

    #[test]
    fn cold_dry_start_heats_and_alarms() {
        let stages = profile();
        let t0 = Instant::now();
        let state = ControlState::new(t0);
        let tr = step(&state, &stages, &input(t0, 25.0, 60.0));
        assert!(tr.next.actuators.heater);
        assert!(!tr.next.actuators.dehumidifier_1);
        // 30 - 25 = 5 > 2
        assert!(tr.next.alarm_active);
        assert!(tr.next.actuators.buzzer);
        assert!(tr.alarm_changed);
    }

    #[test]
    fn stage_advances_exactly_at_duration() {
        let stages = profile();
        let t0 = Instant::now();
        let state = ControlState::new(t0);

        let before = step(&state, &stages, &input(t0 + Duration::from_secs(3599), 30.0, 70.0));
        assert_eq!(before.advanced_to, None);
        assert_eq!(before.next.stage_index, 0);

        let at = t0 + Duration::from_secs(3600);
        let tr = step(&state, &stages, &input(at, 30.0, 70.0));
        assert_eq!(tr.advanced_to, Some(1));
        assert_eq!(tr.next.stage_index, 1);
        assert_eq!(tr.next.stage_started_at, at);

        // 30.0 is on target for the first stage but short of the second.
        let active = stages.get(tr.next.stage_index);
        assert_eq!(
            tr.next.alarm_active,
            alarm_active(&tr.next.reading, active.target_temperature)
        );
        assert!(tr.next.alarm_active);
        assert_eq!(tr.next.actuators.heater, 30.0 < active.target_temperature);
        assert!(tr.next.actuators.heater);
    }

    #[test]
    fn timed_advance_applies_new_stage_targets_in_same_tick() {
        let stages = profile();
        let t0 = Instant::now();
        let state = ControlState::new(t0);

        // On target for S0 (30°C, 70%) but cold and wet for S1 (40°C, 60%).
        let tr = step(&state, &stages, &input(t0 + Duration::from_secs(3600), 30.5, 65.0));
        let next = tr.next;
        let active = stages.get(next.stage_index);
        assert_eq!(next.stage_index, 1);
        assert_eq!(
            next.alarm_active,
            alarm_active(&next.reading, active.target_temperature)
        );
        assert!(next.alarm_active);
        assert!(next.actuators.buzzer);
        assert_eq!(next.actuators.heater, 30.5 < active.target_temperature);
        assert!(next.actuators.heater);
        assert_eq!(next.actuators.dehumidifier_1, 65.0 > active.target_humidity);
        assert!(next.actuators.dehumidifier_1);
        assert!(next.actuators.fan_1, "S1 always ventilates");
    }

    #[test]
    fn stage_holds_at_last_index() {
        let stages = profile();
        let t0 = Instant::now();
        let mut state = ControlState::new(t0);
        state.stage_index = 3;
        let tr = step(&state, &stages, &input(t0 + Duration::from_secs(100_000), 25.0, 80.0));
        assert_eq!(tr.advanced_to, None);
        assert_eq!(tr.next.stage_index, 3);
    }

    #[test]
    fn stage_index_monotonic_over_long_auto_run() {
        let stages = profile();
        let t0 = Instant::now();
        let mut state = ControlState::new(t0);
        let mut last = 0;
        for tick in 0..10_000u64 {
            let now = t0 + Duration::from_secs(tick * 2);
            state = step(&state, &stages, &input(now, 30.0, 60.0)).next;
            assert!(state.stage_index >= last);
            assert!(state.stage_index <= 3);
            last = state.stage_index;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn manual_mode_suspends_stage_timing() {
        let stages = profile();
        let t0 = Instant::now();
        let mut state = ControlState::new(t0);
        state.mode = Mode::Manual;
        let tr = step(&state, &stages, &input(t0 + Duration::from_secs(7200), 30.0, 60.0));
        assert_eq!(tr.next.stage_index, 0);
    }

    #[test]
    fn failed_reads_freeze_governed_outputs() {
        let stages = profile();
        let t0 = Instant::now();
        let mut state = step(&ControlState::new(t0), &stages, &input(t0, 25.0, 90.0)).next;
        let frozen = state.actuators;
        assert!(frozen.heater && frozen.dehumidifier_1);

        for i in 1..=5u64 {
            state = step(&state, &stages, &failed(t0 + Duration::from_secs(2 * i))).next;
            assert!(!state.reading.valid);
            assert_eq!(state.actuators.heater, frozen.heater);
            assert_eq!(state.actuators.dehumidifier_1, frozen.dehumidifier_1);
            assert_eq!(state.actuators.dehumidifier_2, frozen.dehumidifier_2);
            // Stale values are retained.
            assert_eq!(state.reading.temperature, 25.0);
            assert!(!state.alarm_active);
        }
    }

    #[test]
    fn failed_read_still_advances_stage() {
        let stages = profile();
        let t0 = Instant::now();
        let state = ControlState::new(t0);
        let tr = step(&state, &stages, &failed(t0 + Duration::from_secs(3600)));
        assert_eq!(tr.advanced_to, Some(1));
    }
}
