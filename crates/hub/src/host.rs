//! Host health for the controller's own Raspberry Pi: load, memory, uptime
//! and SoC temperature. A cooked Pi in a hot barn is a real failure mode.

use serde::Serialize;
use sysinfo::{Components, System};

#[derive(Debug, Clone, Serialize)]
pub struct HostStats {
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
    pub uptime_secs: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// Hottest thermal sensor, `None` when the kernel exposes none.
    pub soc_temperature: Option<f32>,
}

/// Blocking; call from `spawn_blocking`.
pub fn sample() -> HostStats {
    let mut system = System::new();
    system.refresh_memory();
    let load = System::load_average();

    let components = Components::new_with_refreshed_list();
    let soc_temperature = components
        .list()
        .iter()
        .map(|c| c.temperature())
        .filter(|t| t.is_finite())
        .reduce(f32::max);

    HostStats {
        load_one: load.one,
        load_five: load.five,
        load_fifteen: load.fifteen,
        uptime_secs: System::uptime(),
        memory_used_bytes: system.used_memory(),
        memory_total_bytes: system.total_memory(),
        soc_temperature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_sane_memory() {
        let stats = sample();
        assert!(stats.memory_total_bytes >= stats.memory_used_bytes);
    }

    #[test]
    fn stats_serialize_missing_temperature_as_null() {
        let stats = HostStats {
            load_one: 0.5,
            load_five: 0.4,
            load_fifteen: 0.3,
            uptime_secs: 60,
            memory_used_bytes: 1,
            memory_total_bytes: 2,
            soc_temperature: None,
        };
        let json = serde_json::to_value(stats).unwrap();
        assert!(json["soc_temperature"].is_null());
        assert_eq!(json["uptime_secs"], 60);
    }
}
