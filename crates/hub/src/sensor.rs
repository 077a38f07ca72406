//! Temperature/humidity sensor port.
//!
//! Two implementations, picked from config at startup:
//! - [`IioSensor`]: a DHT22 bound to the Linux `dht11` IIO driver
//!   (`dtoverlay=dht11,gpiopin=4`), read through sysfs.
//! - [`SimSensor`]: samples the simulated barn in [`crate::sim`].

use anyhow::{bail, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::Measurement;
use crate::sim::PlantHandle;

/// DHT22 datasheet ranges.
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = -40.0..=80.0;
const HUMIDITY_RANGE: std::ops::RangeInclusive<f32> = 0.0..=100.0;

#[derive(Debug, thiserror::Error)]
pub enum SensorFault {
    #[error("sensor read timed out after {0:?}")]
    Timeout(Duration),
    #[error("sensor i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sensor returned unparsable value {0:?}")]
    Malformed(String),
    #[error("implausible reading {temperature:.1}°C {humidity:.1}%")]
    Implausible { temperature: f32, humidity: f32 },
    #[error("no data from sensor")]
    NoData,
}

/// Read-side port. Callers bound every read with a timeout; an
/// implementation may block for as long as the hardware does.
pub trait SensorPort: Send {
    fn read(&mut self) -> impl Future<Output = Result<Measurement, SensorFault>> + Send;
}

/// Reject values a working DHT22 cannot produce.
pub fn check_plausible(m: Measurement) -> Result<Measurement, SensorFault> {
    if TEMPERATURE_RANGE.contains(&m.temperature) && HUMIDITY_RANGE.contains(&m.humidity) {
        Ok(m)
    } else {
        Err(SensorFault::Implausible {
            temperature: m.temperature,
            humidity: m.humidity,
        })
    }
}

// ---------------------------------------------------------------------------
// IIO sysfs sensor (production)
// ---------------------------------------------------------------------------

pub struct IioSensor {
    temperature_path: PathBuf,
    humidity_path: PathBuf,
}

impl IioSensor {
    /// Bind to an IIO device directory, e.g. `/sys/bus/iio/devices/iio:device0`.
    /// Fails if the device or its channels are missing, so a barn never runs
    /// without a sensor.
    pub fn open(device: impl AsRef<Path>) -> Result<Self> {
        let device = device.as_ref();
        if !device.is_dir() {
            bail!(
                "sensor device {} not found (is the dht11 overlay enabled?)",
                device.display()
            );
        }

        let temperature_path = device.join("in_temp_input");
        let humidity_path = device.join("in_humidityrelative_input");
        for path in [&temperature_path, &humidity_path] {
            if !path.exists() {
                bail!("sensor channel {} not found", path.display());
            }
        }

        Ok(Self {
            temperature_path,
            humidity_path,
        })
    }
}

impl SensorPort for IioSensor {
    async fn read(&mut self) -> Result<Measurement, SensorFault> {
        let temperature = read_milli(&self.temperature_path).await?;
        let humidity = read_milli(&self.humidity_path).await?;
        check_plausible(Measurement {
            temperature,
            humidity,
        })
    }
}

/// IIO reports milli-units as a plain integer.
async fn read_milli(path: &Path) -> Result<f32, SensorFault> {
    let raw = tokio::fs::read_to_string(path).await?;
    let raw = raw.trim();
    raw.parse::<i64>()
        .map(|v| v as f32 / 1000.0)
        .map_err(|_| SensorFault::Malformed(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Simulated sensor (development)
// ---------------------------------------------------------------------------

pub struct SimSensor {
    plant: PlantHandle,
}

impl SimSensor {
    pub fn new(plant: PlantHandle) -> Self {
        Self { plant }
    }
}

impl SensorPort for SimSensor {
    async fn read(&mut self) -> Result<Measurement, SensorFault> {
        let sample = match self.plant.lock() {
            Ok(mut plant) => plant.sample(),
            Err(poisoned) => poisoned.into_inner().sample(),
        };
        sample.ok_or(SensorFault::NoData)
    }
}

/// Startup-selected sensor, so the control loop stays monomorphic.
pub enum AnySensor {
    Iio(IioSensor),
    Sim(SimSensor),
}

impl SensorPort for AnySensor {
    async fn read(&mut self) -> Result<Measurement, SensorFault> {
        match self {
            Self::Iio(s) => s.read().await,
            Self::Sim(s) => s.read().await,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Plant;

    /// Fake IIO device directory under the system temp dir.
    fn fake_device(name: &str, temp: &str, hum: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("curing-hub-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("in_temp_input"), temp).unwrap();
        std::fs::write(dir.join("in_humidityrelative_input"), hum).unwrap();
        dir
    }

    #[tokio::test]
    async fn iio_reads_milli_units() {
        let dir = fake_device("ok", "34500\n", "81200\n");
        let mut sensor = IioSensor::open(&dir).unwrap();
        let m = sensor.read().await.unwrap();
        assert_eq!(m.temperature, 34.5);
        assert_eq!(m.humidity, 81.2);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn iio_malformed_value_is_a_fault() {
        let dir = fake_device("bad", "garbage", "50000");
        let mut sensor = IioSensor::open(&dir).unwrap();
        let err = sensor.read().await.unwrap_err();
        assert!(matches!(err, SensorFault::Malformed(ref s) if s == "garbage"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn iio_implausible_value_is_a_fault() {
        let dir = fake_device("hot", "150000", "50000");
        let mut sensor = IioSensor::open(&dir).unwrap();
        assert!(matches!(
            sensor.read().await,
            Err(SensorFault::Implausible { .. })
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn iio_open_missing_device_fails() {
        let err = IioSensor::open("/nonexistent/iio:device9").err().unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn plausibility_bounds_are_inclusive() {
        let m = |temperature, humidity| Measurement {
            temperature,
            humidity,
        };
        assert!(check_plausible(m(-40.0, 0.0)).is_ok());
        assert!(check_plausible(m(80.0, 100.0)).is_ok());
        assert!(check_plausible(m(80.1, 50.0)).is_err());
        assert!(check_plausible(m(20.0, -0.1)).is_err());
    }

    #[tokio::test]
    async fn sim_sensor_reports_dropped_reads_as_no_data() {
        let mut plant = Plant::with_seed(25.0, 60.0, 9);
        plant.set_failure_rate(1.0);
        let mut sensor = SimSensor::new(plant.shared());
        assert!(matches!(sensor.read().await, Err(SensorFault::NoData)));
    }

    #[tokio::test]
    async fn any_sensor_dispatches_to_variant() {
        let mut plant = Plant::with_seed(25.0, 60.0, 9);
        plant.set_failure_rate(0.0);
        let mut sensor = AnySensor::Sim(SimSensor::new(plant.shared()));
        let m = sensor.read().await.unwrap();
        assert!((m.temperature - 25.0).abs() < 2.0);
    }
}
