//! Simulated curing barn for development without hardware.
//!
//! Models a closed loop between the outputs and the air:
//! - Heater warms the barn; heat leaks toward ambient, faster with fans on
//! - Curing leaves release moisture; dehumidifiers and fans remove it
//! - Per-sample sensor noise
//! - Occasional failed reads (DHT22s drop a read every so often)

use std::sync::{Arc, Mutex};

use crate::policy::{Actuator, ActuatorStates, Measurement};

pub type PlantHandle = Arc<Mutex<Plant>>;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Plant
// ---------------------------------------------------------------------------

pub struct Plant {
    temperature: f64,
    humidity: f64,
    ambient_temperature: f64,
    ambient_humidity: f64,
    outputs: ActuatorStates,
    failure_rate: f32,
    rng: fastrand::Rng,

    // Per-sample rates
    heat_gain: f64,
    leak: f64,
    fan_leak: f64,
    moisture_release: f64,
    dehumidify_rate: f64,
    fan_dry_rate: f64,
    noise_sigma: f64,
}

impl Plant {
    pub fn new(ambient_temperature: f64, ambient_humidity: f64) -> Self {
        Self::with_rng(ambient_temperature, ambient_humidity, fastrand::Rng::new())
    }

    /// Deterministic plant for tests.
    pub fn with_seed(ambient_temperature: f64, ambient_humidity: f64, seed: u64) -> Self {
        Self::with_rng(
            ambient_temperature,
            ambient_humidity,
            fastrand::Rng::with_seed(seed),
        )
    }

    fn with_rng(ambient_temperature: f64, ambient_humidity: f64, rng: fastrand::Rng) -> Self {
        Self {
            temperature: ambient_temperature,
            humidity: ambient_humidity,
            ambient_temperature,
            ambient_humidity,
            outputs: ActuatorStates::default(),
            failure_rate: 0.03,
            rng,
            heat_gain: 0.35,
            leak: 0.01,
            fan_leak: 0.005,
            moisture_release: 0.12,
            dehumidify_rate: 0.6,
            fan_dry_rate: 0.15,
            noise_sigma: 0.08,
        }
    }

    pub fn shared(self) -> PlantHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn set_failure_rate(&mut self, rate: f32) {
        self.failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Called by the mock relay board whenever an output changes.
    pub fn set_output(&mut self, actuator: Actuator, on: bool) {
        self.outputs.set(actuator, on);
    }

    /// Advance one sample period and read the sensor. `None` models a
    /// dropped read; the barn still evolves.
    pub fn sample(&mut self) -> Option<Measurement> {
        let o = self.outputs;
        let fans = (o.fan_1 as u8 + o.fan_2 as u8) as f64;
        let dehumidifiers = (o.dehumidifier_1 as u8 + o.dehumidifier_2 as u8) as f64;

        let heat = if o.heater { self.heat_gain } else { 0.0 };
        let loss = (self.leak + self.fan_leak * fans) * (self.temperature - self.ambient_temperature);
        self.temperature += heat - loss;

        // Warm leaves give up moisture faster.
        let warmth = ((self.temperature - self.ambient_temperature) / 20.0).clamp(0.0, 2.0);
        let release = self.moisture_release * (1.0 + warmth);
        let removal = self.dehumidify_rate * dehumidifiers / 2.0 + self.fan_dry_rate * fans / 2.0;
        let reversion = 0.005 * (self.ambient_humidity - self.humidity);
        self.humidity = (self.humidity + release - removal + reversion).clamp(5.0, 99.9);

        if self.rng.f32() < self.failure_rate {
            return None;
        }

        let t = self.temperature + self.noise_sigma * approx_std_normal(&mut self.rng);
        let h = self.humidity + self.noise_sigma * 2.0 * approx_std_normal(&mut self.rng);
        Some(Measurement {
            temperature: t as f32,
            humidity: h.clamp(0.0, 100.0) as f32,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
