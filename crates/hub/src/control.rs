//! The control loop: one task that owns the sensor and the relay board.
//!
//! Every tick it polls the sensor (bounded by a timeout), runs the policy
//! step under the state lock, queues a run record, then reconciles the
//! relays against the new state outside the lock. Accepted operator
//! commands wake the loop early so relays follow without waiting a tick.
//!
//! ```text
//! ┌──────────┐  read   ┌──────────────┐  step   ┌──────────────┐
//! │  sensor  │ ──────▶ │ control loop │ ──────▶ │ SharedState  │
//! └──────────┘         └──────┬───────┘         └──────────────┘
//!                             │ reconcile (only differences)
//!                             ▼
//!                      ┌──────────────┐
//!                      │ relay board  │
//!                      └──────────────┘
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::policy::{self, Actuator, ActuatorStates, Measurement, Mode, TickInput};
use crate::record::{self, RecordSink};
use crate::relay::ActuatorPort;
use crate::sensor::{SensorFault, SensorPort};
use crate::state::SharedState;

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub period: Duration,
    /// Must be shorter than `period`.
    pub sensor_timeout: Duration,
}

/// What one tick did; used by tests and debug logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub sample_ok: bool,
    pub advanced_to: Option<usize>,
    pub write_failures: usize,
}

pub struct ControlLoop<S, A> {
    sensor: S,
    actuators: A,
    shared: SharedState,
    wake: Arc<Notify>,
    records: RecordSink,
    settings: LoopSettings,
    /// What the relays were last successfully driven to.
    applied: ActuatorStates,
    faulted: HashSet<Actuator>,
    indicators: Option<(usize, Mode)>,
    sensor_ok: bool,
}

impl<S: SensorPort, A: ActuatorPort> ControlLoop<S, A> {
    /// Switches every output off so `applied` matches the hardware.
    pub fn new(
        sensor: S,
        mut actuators: A,
        shared: SharedState,
        wake: Arc<Notify>,
        records: RecordSink,
        settings: LoopSettings,
    ) -> Self {
        actuators.all_off();
        Self {
            sensor,
            actuators,
            shared,
            wake,
            records,
            settings,
            applied: ActuatorStates::default(),
            faulted: HashSet::new(),
            indicators: None,
            sensor_ok: true,
        }
    }

    /// Tick until `shutdown` resolves, then switch everything off.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.settings.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = Arc::clone(&self.wake);
        tokio::pin!(shutdown);

        info!(
            period_ms = self.settings.period.as_millis() as u64,
            sensor_timeout_ms = self.settings.sensor_timeout.as_millis() as u64,
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "tick");
                }
                _ = wake.notified() => {
                    self.sync_outputs().await;
                }
                _ = &mut shutdown => break,
            }
        }

        self.actuators.all_off();
        info!("control loop stopped, outputs off");
    }

    /// One sense → decide → actuate pass.
    pub async fn tick(&mut self) -> TickReport {
        let (sample, fault) = match self.poll_sensor().await {
            Ok(m) => (Some(m), None),
            Err(fault) => (None, Some(fault.to_string())),
        };

        let wall = OffsetDateTime::now_utc();
        let (advanced_to, record, target, indicators) = {
            let mut st = self.shared.write().await;
            let input = TickInput {
                now: Instant::now(),
                wall,
                sample,
            };
            let tr = policy::step(&st.control, &st.stages, &input);
            st.apply_tick(&tr, fault.as_deref());
            let c = st.control;
            (
                tr.advanced_to,
                st.to_record(wall),
                c.actuators,
                (c.stage_index, c.mode),
            )
        };

        record::emit(&self.records, record);
        if let Some(index) = advanced_to {
            info!(stage = index, "stage duration elapsed, advanced");
        }

        let write_failures = self.apply_outputs(target, indicators).await;
        TickReport {
            sample_ok: sample.is_some(),
            advanced_to,
            write_failures,
        }
    }

    /// Push the current state's outputs to the relays without sampling.
    pub async fn sync_outputs(&mut self) -> usize {
        let (target, indicators) = {
            let st = self.shared.read().await;
            (
                st.control.actuators,
                (st.control.stage_index, st.control.mode),
            )
        };
        self.apply_outputs(target, indicators).await
    }

    async fn poll_sensor(&mut self) -> Result<Measurement, SensorFault> {
        let timeout = self.settings.sensor_timeout;
        let result = match tokio::time::timeout(timeout, self.sensor.read()).await {
            Ok(result) => result,
            Err(_) => Err(SensorFault::Timeout(timeout)),
        };

        match (&result, self.sensor_ok) {
            (Err(fault), true) => warn!("sensor read failed: {fault}"),
            (Err(fault), false) => debug!("sensor still failing: {fault}"),
            (Ok(m), false) => info!(
                temperature = m.temperature,
                humidity = m.humidity,
                "sensor recovered"
            ),
            (Ok(_), true) => {}
        }
        self.sensor_ok = result.is_ok();
        result
    }

    /// Write only what differs from the last successful write. Failed
    /// outputs stay out of `applied` so the next pass tries again.
    async fn apply_outputs(&mut self, target: ActuatorStates, indicators: (usize, Mode)) -> usize {
        let mut new_faults = Vec::new();
        let mut failures = 0;

        for (actuator, on) in self.applied.changes_to(&target) {
            match self.actuators.set(actuator, on) {
                Ok(()) => {
                    self.applied.set(actuator, on);
                    if self.faulted.remove(&actuator) {
                        info!(%actuator, "relay write recovered");
                    }
                }
                Err(e) => {
                    failures += 1;
                    error!(%actuator, on, "relay write failed: {e:#}");
                    if self.faulted.insert(actuator) {
                        new_faults.push(format!(
                            "{actuator} write {} failed: {e}",
                            if on { "ON" } else { "OFF" }
                        ));
                    }
                }
            }
        }

        if self.indicators != Some(indicators) {
            self.actuators.show_indicators(indicators.0, indicators.1);
            self.indicators = Some(indicators);
        }

        if !new_faults.is_empty() {
            let mut st = self.shared.write().await;
            for detail in new_faults {
                st.record_actuator_fault(detail);
            }
        }
        failures
    }
}

// ===========================================================================
// Tests
// ===========================================================================
