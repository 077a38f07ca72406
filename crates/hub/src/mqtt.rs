//! Optional MQTT surface: command topics in, command results and run
//! records out.
//!
//! ```text
//! <prefix>/cmd/toggle-mode        ─┐
//! <prefix>/cmd/advance-stage       │
//! <prefix>/cmd/reset               ├─▶ CommandGateway ─▶ <prefix>/cmd/result
//! <prefix>/cmd/toggle/<target>    ─┘
//!                                      record writer  ─▶ <prefix>/tele/record
//! ```
//!
//! Payloads on command topics are ignored; the topic is the command.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::gateway::{Command, CommandGateway, CommandRejection};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub commands: String,
    pub result: String,
    pub telemetry: String,
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            commands: format!("{prefix}/cmd/#"),
            result: format!("{prefix}/cmd/result"),
            telemetry: format!("{prefix}/tele/record"),
            prefix: prefix.to_string(),
        }
    }

    /// Map a command topic to a command. `None` for topics that are not
    /// commands (including our own result topic).
    pub fn parse_command(&self, topic: &str) -> Option<Result<Command, CommandRejection>> {
        let action = topic.strip_prefix(&self.prefix)?.strip_prefix("/cmd/")?;
        match action {
            "toggle-mode" => Some(Ok(Command::ToggleMode)),
            "advance-stage" => Some(Ok(Command::AdvanceStage)),
            "reset" => Some(Ok(Command::ResetRun)),
            _ => {
                let target = action.strip_prefix("toggle/")?;
                if target.is_empty() || target.contains('/') {
                    return None;
                }
                Some(Command::toggle(target))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Result message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub topic: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Run the command behind `topic`, if there is one.
pub async fn handle_publish(
    gateway: &CommandGateway,
    topics: &Topics,
    topic: &str,
) -> Option<CommandResult> {
    let parsed = topics.parse_command(topic)?;
    let outcome = match parsed {
        Ok(cmd) => gateway.execute(cmd).await,
        Err(rejection) => Err(rejection),
    };

    Some(match outcome {
        Ok(status) => CommandResult {
            topic: topic.to_string(),
            ok: true,
            error: None,
            summary: Some(status.summary),
        },
        Err(rejection) => CommandResult {
            topic: topic.to_string(),
            ok: false,
            error: Some(rejection.to_string()),
            summary: None,
        },
    })
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(options, 20)
}

/// Drive the connection forever. Subscriptions are (re)made on every
/// ConnAck so a broker restart does not silently drop commands.
pub async fn run(client: AsyncClient, mut eventloop: EventLoop, topics: Topics, gateway: CommandGateway) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(result) = handle_publish(&gateway, &topics, &p.topic).await else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match serde_json::to_vec(&result) {
                    Ok(payload) => {
                        if let Err(e) = client
                            .publish(&topics.result, QoS::AtLeastOnce, false, payload)
                            .await
                        {
                            warn!("mqtt: result publish failed: {e}");
                        }
                    }
                    Err(e) => warn!("mqtt: result serialise failed: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(topic = %topics.commands, "mqtt connected");
                if let Err(e) = client.subscribe(&topics.commands, QoS::AtLeastOnce).await {
                    warn!("mqtt: subscribe failed: {e}");
                }
                gateway
                    .shared()
                    .write()
                    .await
                    .record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                gateway
                    .shared()
                    .write()
                    .await
                    .record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                // The barn keeps running on its own; only the remote surface is down.
                warn!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
