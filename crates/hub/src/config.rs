//! TOML config file loading, environment overrides and validation.
//!
//! Every section is optional; a missing file runs the barn on built-in
//! defaults. A file that is present but malformed or invalid aborts startup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::buttons::ButtonPins;
use crate::control::LoopSettings;
use crate::policy::Actuator;
use crate::relay::IndicatorPins;
use crate::stage::{Stage, StageTable, STAGE_COUNT};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub sensor: SensorConfig,
    pub relays: RelayConfig,
    pub indicators: Option<IndicatorConfig>,
    pub buttons: Option<ButtonConfig>,
    pub web: WebConfig,
    pub mqtt: Option<MqttConfig>,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_secs: u64,
    pub sensor_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 2,
            sensor_timeout_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Iio,
    Sim,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub iio_device: String,
    /// Ambient air around the simulated barn.
    pub sim_ambient_temperature: f64,
    pub sim_ambient_humidity: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Iio,
            iio_device: "/sys/bus/iio/devices/iio:device0".to_string(),
            sim_ambient_temperature: 24.0,
            sim_ambient_humidity: 70.0,
        }
    }
}

/// BCM pins for the relay outputs and the buzzer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub active_low: bool,
    pub heater: i64,
    pub fan_1: i64,
    pub fan_2: i64,
    pub dehumidifier_1: i64,
    pub dehumidifier_2: i64,
    pub buzzer: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            active_low: true,
            heater: 22,
            fan_1: 17,
            fan_2: 18,
            dehumidifier_1: 27,
            dehumidifier_2: 23,
            buzzer: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorConfig {
    pub stages: [i64; STAGE_COUNT],
    pub auto: i64,
    pub manual: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ButtonConfig {
    pub mode: i64,
    pub stage: i64,
    pub fan: i64,
    pub dehumidifier: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "curing-hub".to_string()
}

fn default_prefix() -> String {
    "curing".to_string()
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Range a DHT22 can measure; stage targets outside it can never be met.
const SENSOR_TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = -40.0..=80.0;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_web(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_stages(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.tick_secs == 0 {
            errors.push("controller: tick_secs must be positive".to_string());
        }
        if c.sensor_timeout_ms == 0 {
            errors.push("controller: sensor_timeout_ms must be positive".to_string());
        } else if c.tick_secs > 0 && c.sensor_timeout_ms >= c.tick_secs.saturating_mul(1000) {
            errors.push(format!(
                "controller: sensor_timeout_ms ({}) must be shorter than the tick ({} s)",
                c.sensor_timeout_ms, c.tick_secs
            ));
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        if self.sensor.kind == SensorKind::Iio && self.sensor.iio_device.trim().is_empty() {
            errors.push("sensor: iio_device is empty".to_string());
        }
    }

    /// Relays, indicator LEDs and buttons share one header: every pin must
    /// be a usable BCM pin and appear once.
    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<i64> = HashSet::new();
        for (label, pin) in self.all_pins() {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{label}: gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("{label}: gpio {pin} is already in use"));
            }
        }
    }

    fn all_pins(&self) -> Vec<(String, i64)> {
        let r = &self.relays;
        let mut pins = vec![
            ("relays.heater".to_string(), r.heater),
            ("relays.fan_1".to_string(), r.fan_1),
            ("relays.fan_2".to_string(), r.fan_2),
            ("relays.dehumidifier_1".to_string(), r.dehumidifier_1),
            ("relays.dehumidifier_2".to_string(), r.dehumidifier_2),
            ("relays.buzzer".to_string(), r.buzzer),
        ];
        if let Some(ind) = &self.indicators {
            for (i, pin) in ind.stages.iter().enumerate() {
                pins.push((format!("indicators.stages[{i}]"), *pin));
            }
            pins.push(("indicators.auto".to_string(), ind.auto));
            pins.push(("indicators.manual".to_string(), ind.manual));
        }
        if let Some(b) = &self.buttons {
            pins.push(("buttons.mode".to_string(), b.mode));
            pins.push(("buttons.stage".to_string(), b.stage));
            pins.push(("buttons.fan".to_string(), b.fan));
            pins.push(("buttons.dehumidifier".to_string(), b.dehumidifier));
        }
        pins
    }

    fn validate_web(&self, errors: &mut Vec<String>) {
        match (&self.web.tls_cert, &self.web.tls_key) {
            (Some(_), None) => errors.push("web: tls_cert is set but tls_key is not".to_string()),
            (None, Some(_)) => errors.push("web: tls_key is set but tls_cert is not".to_string()),
            _ => {}
        }
        if self.web.port == 0 {
            errors.push("web: port must be non-zero".to_string());
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let Some(m) = &self.mqtt else { return };
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".to_string());
        }
        if m.prefix.trim().is_empty() {
            errors.push("mqtt: prefix is empty".to_string());
        } else if m.prefix.contains(['+', '#']) || m.prefix.ends_with('/') {
            errors.push(format!(
                "mqtt: prefix '{}' must not contain wildcards or a trailing '/'",
                m.prefix
            ));
        }
    }

    fn validate_stages(&self, errors: &mut Vec<String>) {
        if self.stages.is_empty() {
            return; // built-in profile
        }
        if self.stages.len() != STAGE_COUNT {
            errors.push(format!(
                "stages: exactly {STAGE_COUNT} stages required, got {}",
                self.stages.len()
            ));
        }

        let mut seen_names: HashSet<&str> = HashSet::new();
        for (i, s) in self.stages.iter().enumerate() {
            let ctx = || {
                if s.name.trim().is_empty() {
                    format!("stages[{i}]")
                } else {
                    format!("stage '{}'", s.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&s.name) {
                errors.push(format!("{}: duplicate stage name", ctx()));
            }

            // ── Setpoints ───────────────────────────────────────
            if !SENSOR_TEMPERATURE_RANGE.contains(&s.target_temperature) {
                errors.push(format!(
                    "{}: target_temperature {} outside sensor range [-40, 80]",
                    ctx(),
                    s.target_temperature
                ));
            }
            if s.max_temperature <= s.target_temperature {
                errors.push(format!(
                    "{}: max_temperature ({}) must be greater than target_temperature ({})",
                    ctx(),
                    s.max_temperature,
                    s.target_temperature
                ));
            }
            if !(0.0..=100.0).contains(&s.target_humidity) {
                errors.push(format!(
                    "{}: target_humidity {} out of range [0, 100]",
                    ctx(),
                    s.target_humidity
                ));
            }

            // ── Timing ──────────────────────────────────────────
            if s.duration_secs == 0 {
                errors.push(format!("{}: duration_secs must be positive", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

impl Config {
    /// Configured profile, or the built-in flue-curing profile.
    pub fn stage_table(&self) -> Result<StageTable> {
        if self.stages.is_empty() {
            Ok(StageTable::flue_cured())
        } else {
            StageTable::new(self.stages.clone())
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            period: Duration::from_secs(self.controller.tick_secs),
            sensor_timeout: Duration::from_millis(self.controller.sensor_timeout_ms),
        }
    }

    /// Output → BCM pin. Only meaningful after `validate`.
    pub fn relay_wiring(&self) -> Vec<(Actuator, u8)> {
        let r = &self.relays;
        [
            (Actuator::Heater, r.heater),
            (Actuator::Fan1, r.fan_1),
            (Actuator::Fan2, r.fan_2),
            (Actuator::Dehumidifier1, r.dehumidifier_1),
            (Actuator::Dehumidifier2, r.dehumidifier_2),
            (Actuator::Buzzer, r.buzzer),
        ]
        .into_iter()
        .filter_map(|(a, pin)| u8::try_from(pin).ok().map(|p| (a, p)))
        .collect()
    }

    pub fn indicator_pins(&self) -> Option<IndicatorPins> {
        let ind = self.indicators.as_ref()?;
        let mut stages = [0u8; STAGE_COUNT];
        for (slot, pin) in stages.iter_mut().zip(ind.stages) {
            *slot = u8::try_from(pin).ok()?;
        }
        Some(IndicatorPins {
            stages,
            auto: u8::try_from(ind.auto).ok()?,
            manual: u8::try_from(ind.manual).ok()?,
        })
    }

    pub fn button_pins(&self) -> Option<ButtonPins> {
        let b = self.buttons.as_ref()?;
        Some(ButtonPins {
            mode: u8::try_from(b.mode).ok()?,
            stage: u8::try_from(b.stage).ok()?,
            fan: u8::try_from(b.fan).ok()?,
            dehumidifier: u8::try_from(b.dehumidifier).ok()?,
        })
    }

    /// `WEB_PORT`, `MQTT_HOST` and `MQTT_PORT` win over the file. Setting
    /// `MQTT_HOST` alone enables MQTT with default settings.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("WEB_PORT") {
            match v.parse() {
                Ok(port) => self.web.port = port,
                Err(_) => warn!("ignoring WEB_PORT={v:?}: not a port number"),
            }
        }

        if let Some(host) = var("MQTT_HOST") {
            match &mut self.mqtt {
                Some(m) => m.host = host,
                None => {
                    self.mqtt = Some(MqttConfig {
                        host,
                        port: default_mqtt_port(),
                        client_id: default_client_id(),
                        prefix: default_prefix(),
                    })
                }
            }
        }

        if let Some(v) = var("MQTT_PORT") {
            match (v.parse(), &mut self.mqtt) {
                (Ok(port), Some(m)) => m.port = port,
                (Ok(_), None) => warn!("ignoring MQTT_PORT: mqtt is not configured"),
                (Err(_), _) => warn!("ignoring MQTT_PORT={v:?}: not a port number"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply env overrides and validate. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        info!(path, "no config file, using defaults");
        Config::default()
    };

    config.apply_env(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    info!(
        tick_secs = config.controller.tick_secs,
        sensor = ?config.sensor.kind,
        stages = if config.stages.is_empty() { "built-in" } else { "custom" },
        mqtt = config.mqtt.is_some(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
