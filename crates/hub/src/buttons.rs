//! Front-panel push buttons. Each press becomes a [`Command`] sent through
//! the gateway, exactly like a web or MQTT request.
//!
//! Buttons pull the pin to ground; presses are edge-detected by polling and
//! debounced in software.

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::gateway::{Command, CommandGateway};
use crate::policy::ActuatorTarget;

/// Presses closer together than this count as contact bounce.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

#[cfg(feature = "gpio")]
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Mode,
    Stage,
    Fan,
    Dehumidifier,
}

impl Button {
    pub const ALL: [Button; 4] = [Button::Mode, Button::Stage, Button::Fan, Button::Dehumidifier];

    pub fn command(self) -> Command {
        match self {
            Self::Mode => Command::ToggleMode,
            Self::Stage => Command::AdvanceStage,
            Self::Fan => Command::Toggle(ActuatorTarget::Fans),
            Self::Dehumidifier => Command::Toggle(ActuatorTarget::Dehumidifiers),
        }
    }
}

/// BCM pins for the four buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonPins {
    pub mode: u8,
    pub stage: u8,
    pub fan: u8,
    pub dehumidifier: u8,
}

impl ButtonPins {
    pub fn wiring(&self) -> [(Button, u8); 4] {
        [
            (Button::Mode, self.mode),
            (Button::Stage, self.stage),
            (Button::Fan, self.fan),
            (Button::Dehumidifier, self.dehumidifier),
        ]
    }
}

/// Rising-edge detector with a lockout window after each accepted press.
#[derive(Debug, Clone)]
pub struct Debouncer {
    pressed: bool,
    last_press: Option<Instant>,
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            pressed: false,
            last_press: None,
            window,
        }
    }

    /// Feed the current level; returns true once per real press.
    pub fn update(&mut self, pressed: bool, now: Instant) -> bool {
        let edge = pressed && !self.pressed;
        self.pressed = pressed;
        if !edge {
            return false;
        }
        match self.last_press {
            Some(at) if now.saturating_duration_since(at) < self.window => false,
            _ => {
                self.last_press = Some(now);
                true
            }
        }
    }
}

/// Run a button's command. Rejections are already logged by the gateway.
pub async fn dispatch(gateway: &CommandGateway, button: Button) {
    info!(?button, "button pressed");
    if let Ok(status) = gateway.execute(button.command()).await {
        debug!(summary = %status.summary, "button handled");
    }
}

// ---------------------------------------------------------------------------
// GPIO listener (production)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub fn spawn_listener(
    pins: ButtonPins,
    gateway: CommandGateway,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use rppal::gpio::{Gpio, InputPin};

    let gpio = Gpio::new()?;
    let mut inputs: Vec<(Button, InputPin, Debouncer)> = Vec::new();
    for (button, pin_num) in pins.wiring() {
        let pin = gpio.get(pin_num)?.into_input_pullup();
        inputs.push((button, pin, Debouncer::new(DEBOUNCE)));
    }
    info!(?pins, "button listener started");

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let mut presses = Vec::new();
            for (button, pin, debouncer) in inputs.iter_mut() {
                if debouncer.update(pin.is_low(), now) {
                    presses.push(*button);
                }
            }
            for button in presses {
                dispatch(&gateway, button).await;
            }
        }
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
