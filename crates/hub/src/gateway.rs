//! Single entry point for operator intent.
//!
//! The web API, MQTT command topics and the physical buttons all build a
//! [`Command`] and hand it to [`CommandGateway::execute`]; there is no other
//! way to change mode, stage or outputs from outside the control loop. Each
//! command is applied under the state lock in one critical section and
//! answered with the post-command snapshot.

use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::policy::ActuatorTarget;
use crate::record::{self, RecordSink};
use crate::state::{SharedState, StatusResponse};

/// Expected, non-exceptional refusals. Nothing is mutated when one is
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandRejection {
    #[error("{0} cannot be toggled in AUTO mode")]
    ModeConflict(String),
    #[error("buzzer follows the temperature alarm and cannot be toggled")]
    AlarmGoverned,
    #[error("unknown actuator '{0}'")]
    UnknownActuator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleMode,
    AdvanceStage,
    ResetRun,
    Toggle(ActuatorTarget),
}

impl Command {
    /// Build a toggle from a request name (`fan`, `heater`, `dehumidifier-2`...).
    pub fn toggle(name: &str) -> Result<Self, CommandRejection> {
        ActuatorTarget::parse(name)
            .map(Self::Toggle)
            .ok_or_else(|| CommandRejection::UnknownActuator(name.to_string()))
    }
}

#[derive(Clone)]
pub struct CommandGateway {
    shared: SharedState,
    wake: Arc<Notify>,
    records: RecordSink,
}

impl CommandGateway {
    /// `wake` is notified after every accepted command so the control loop
    /// pushes the new outputs to hardware without waiting for its next tick.
    pub fn new(shared: SharedState, wake: Arc<Notify>, records: RecordSink) -> Self {
        Self {
            shared,
            wake,
            records,
        }
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub async fn execute(&self, cmd: Command) -> Result<StatusResponse, CommandRejection> {
        let (result, record) = {
            let mut st = self.shared.write().await;
            let now = Instant::now();
            let outcome = match cmd {
                Command::ToggleMode => {
                    st.toggle_mode();
                    Ok(())
                }
                Command::AdvanceStage => {
                    st.advance_stage(now);
                    Ok(())
                }
                Command::ResetRun => {
                    st.reset_run(now);
                    Ok(())
                }
                Command::Toggle(target) => st.toggle_actuator(target).map(|_| ()),
            };

            match outcome {
                Ok(()) => {
                    let wall = OffsetDateTime::now_utc();
                    (Ok(st.to_status(now, wall)), Some(st.to_record(wall)))
                }
                Err(rejection) => {
                    st.record_rejection(&rejection);
                    (Err(rejection), None)
                }
            }
        };

        match (&result, record) {
            (Ok(status), Some(record)) => {
                info!(
                    ?cmd,
                    mode = %status.mode,
                    stage = %status.stage_name,
                    actuators = %status.actuators.flags(),
                    "command applied"
                );
                record::emit(&self.records, record);
                self.wake.notify_one();
            }
            (Err(rejection), _) => warn!(?cmd, "command rejected: {rejection}"),
            _ => {}
        }
        result
    }

    pub async fn toggle_mode(&self) -> Result<StatusResponse, CommandRejection> {
        self.execute(Command::ToggleMode).await
    }

    pub async fn advance_stage(&self) -> Result<StatusResponse, CommandRejection> {
        self.execute(Command::AdvanceStage).await
    }

    pub async fn reset_run(&self) -> Result<StatusResponse, CommandRejection> {
        self.execute(Command::ResetRun).await
    }

    pub async fn toggle_actuator(&self, name: &str) -> Result<StatusResponse, CommandRejection> {
        self.execute(Command::toggle(name)?).await
    }

    /// Read-only snapshot for reporting.
    pub async fn status(&self) -> StatusResponse {
        let st = self.shared.read().await;
        st.to_status(Instant::now(), OffsetDateTime::now_utc())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
