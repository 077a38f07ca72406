//! Relay board driving the barn's outputs. The `gpio` feature gates the real
//! rppal driver; without it, a mock board logs state changes and can feed
//! them to the simulated barn.

use anyhow::{anyhow, Result};
use std::collections::HashMap;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(not(feature = "gpio"))]
use tracing::info;
use tracing::debug;

use crate::policy::{Actuator, Mode};
use crate::sim::PlantHandle;
use crate::stage::STAGE_COUNT;

/// Write-side port. `set` may fail; the control loop retries a failed
/// output on its next pass.
pub trait ActuatorPort: Send {
    fn set(&mut self, actuator: Actuator, on: bool) -> Result<()>;

    /// Light the stage and mode LEDs. Boards without indicators ignore it.
    fn show_indicators(&mut self, _stage_index: usize, _mode: Mode) {}

    /// Switch every output off, ignoring failures.
    fn all_off(&mut self) {
        for actuator in Actuator::ALL {
            if let Err(e) = self.set(actuator, false) {
                debug!(%actuator, "all_off: {e:#}");
            }
        }
    }
}

/// BCM pins for the front-panel LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorPins {
    pub stages: [u8; STAGE_COUNT],
    pub auto: u8,
    pub manual: u8,
}

fn mirror(plant: &Option<PlantHandle>, actuator: Actuator, on: bool) {
    if let Some(plant) = plant {
        match plant.lock() {
            Ok(mut p) => p.set_output(actuator, on),
            Err(poisoned) => poisoned.into_inner().set_output(actuator, on),
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
struct IndicatorLeds {
    stages: Vec<OutputPin>,
    auto: OutputPin,
    manual: OutputPin,
}

#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: HashMap<Actuator, OutputPin>,
    active_low: bool, // many relay boards are active-low
    leds: Option<IndicatorLeds>,
    plant: Option<PlantHandle>,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(
        wiring: &[(Actuator, u8)],
        indicators: Option<IndicatorPins>,
        active_low: bool,
    ) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (actuator, pin_num) in wiring {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Fail-safe: everything OFF at startup
            drive(&mut pin, false, active_low && *actuator != Actuator::Buzzer);
            pins.insert(*actuator, pin);
        }

        let leds = match indicators {
            Some(ind) => {
                let mut stages = Vec::with_capacity(STAGE_COUNT);
                for pin_num in ind.stages {
                    let mut pin = gpio.get(pin_num)?.into_output();
                    pin.set_low();
                    stages.push(pin);
                }
                let mut auto = gpio.get(ind.auto)?.into_output();
                let mut manual = gpio.get(ind.manual)?.into_output();
                auto.set_low();
                manual.set_low();
                Some(IndicatorLeds {
                    stages,
                    auto,
                    manual,
                })
            }
            None => None,
        };

        Ok(Self {
            pins,
            active_low,
            leds,
            plant: None,
        })
    }

    /// Also report output changes to the simulated barn.
    pub fn with_plant(mut self, plant: PlantHandle) -> Self {
        self.plant = Some(plant);
        self
    }
}

/// Relay coils honour `active_low`; the buzzer is driven directly.
#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, on: bool, active_low: bool) {
    if on != active_low {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

#[cfg(feature = "gpio")]
impl ActuatorPort for RelayBoard {
    fn set(&mut self, actuator: Actuator, on: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(&actuator)
            .ok_or_else(|| anyhow!("{actuator} is not wired"))?;
        drive(pin, on, self.active_low && actuator != Actuator::Buzzer);
        debug!(%actuator, on, "relay set");
        mirror(&self.plant, actuator, on);
        Ok(())
    }

    fn show_indicators(&mut self, stage_index: usize, mode: Mode) {
        if let Some(leds) = &mut self.leds {
            for (i, pin) in leds.stages.iter_mut().enumerate() {
                drive(pin, i == stage_index, false);
            }
            drive(&mut leds.auto, mode == Mode::Auto, false);
            drive(&mut leds.manual, mode == Mode::Manual, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    pub(super) outputs: HashMap<Actuator, bool>,
    pub(super) indicators: Option<(usize, Mode)>,
    plant: Option<PlantHandle>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(
        wiring: &[(Actuator, u8)],
        _indicators: Option<IndicatorPins>,
        _active_low: bool,
    ) -> Result<Self> {
        let mut outputs = HashMap::new();
        for (actuator, pin_num) in wiring {
            info!("[mock-gpio] registered {actuator} (gpio {pin_num}, not wired)");
            outputs.insert(*actuator, false);
        }
        info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            outputs,
            indicators: None,
            plant: None,
        })
    }

    /// Also report output changes to the simulated barn.
    pub fn with_plant(mut self, plant: PlantHandle) -> Self {
        self.plant = Some(plant);
        self
    }
}

#[cfg(not(feature = "gpio"))]
impl ActuatorPort for RelayBoard {
    fn set(&mut self, actuator: Actuator, on: bool) -> Result<()> {
        let state = self
            .outputs
            .get_mut(&actuator)
            .ok_or_else(|| anyhow!("{actuator} is not wired"))?;
        *state = on;
        info!(
            "[mock-gpio] {actuator} set {}",
            if on { "ON" } else { "OFF" }
        );
        mirror(&self.plant, actuator, on);
        Ok(())
    }

    fn show_indicators(&mut self, stage_index: usize, mode: Mode) {
        debug!("[mock-gpio] indicators stage={stage_index} mode={mode}");
        self.indicators = Some((stage_index, mode));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::sim::Plant;

    fn wiring() -> Vec<(Actuator, u8)> {
        vec![
            (Actuator::Heater, 17),
            (Actuator::Fan1, 27),
            (Actuator::Buzzer, 18),
        ]
    }

    #[test]
    fn relay_board_new_registers_outputs_off() {
        let board = RelayBoard::new(&wiring(), None, true).unwrap();
        assert_eq!(board.outputs.len(), 3);
        assert!(board.outputs.values().all(|on| !on));
    }

    #[test]
    fn relay_board_set_on_and_off() {
        let mut board = RelayBoard::new(&wiring(), None, true).unwrap();
        board.set(Actuator::Heater, true).unwrap();
        assert!(board.outputs[&Actuator::Heater]);
        board.set(Actuator::Heater, false).unwrap();
        assert!(!board.outputs[&Actuator::Heater]);
    }

    #[test]
    fn relay_board_all_off_resets_everything() {
        let mut board = RelayBoard::new(&wiring(), None, true).unwrap();
        board.set(Actuator::Heater, true).unwrap();
        board.set(Actuator::Buzzer, true).unwrap();
        board.all_off();
        assert!(board.outputs.values().all(|on| !on));
    }

    #[test]
    fn relay_board_unwired_output_is_an_error() {
        let mut board = RelayBoard::new(&wiring(), None, true).unwrap();
        let err = board.set(Actuator::Dehumidifier2, true).unwrap_err();
        assert!(err.to_string().contains("not wired"));
        assert_eq!(board.outputs.len(), 3); // no new entry created
    }

    #[test]
    fn relay_board_tracks_indicators() {
        let mut board = RelayBoard::new(&wiring(), None, true).unwrap();
        board.show_indicators(2, Mode::Manual);
        assert_eq!(board.indicators, Some((2, Mode::Manual)));
    }

    #[test]
    fn relay_board_mirrors_outputs_to_plant() {
        let mut plant = Plant::with_seed(20.0, 60.0, 1);
        plant.set_failure_rate(0.0);
        let plant = plant.shared();
        let mut board = RelayBoard::new(&wiring(), None, true)
            .unwrap()
            .with_plant(plant.clone());

        let cold = plant.lock().unwrap().sample().unwrap().temperature;
        board.set(Actuator::Heater, true).unwrap();
        let mut warm = cold;
        for _ in 0..100 {
            warm = plant.lock().unwrap().sample().unwrap().temperature;
        }
        assert!(warm > cold + 5.0, "cold={cold} warm={warm}");
    }
}
