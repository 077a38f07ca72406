//! Append-only run log. Every observable state change (sensor tick or
//! accepted command) produces one [`RunRecord`]; a single writer task
//! persists them and mirrors them to MQTT when a broker is configured.

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::db::Db;
use crate::policy::{ActuatorStates, Mode};

/// Buffered records before producers start dropping.
pub const RECORD_QUEUE: usize = 256;

pub type RecordSink = mpsc::Sender<RunRecord>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub mode: Mode,
    pub stage_index: usize,
    pub stage_name: String,
    /// `None` when the latest reading is not valid.
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub alarm_active: bool,
    pub actuators: ActuatorStates,
}

/// Queue a record without ever blocking the caller.
pub fn emit(sink: &RecordSink, record: RunRecord) {
    match sink.try_send(record) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("run log queue full — dropping record");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("run log writer gone — dropping record");
        }
    }
}

/// Where records end up besides the database.
pub struct Telemetry {
    pub client: AsyncClient,
    pub topic: String,
}

/// Drain the queue until every sender is dropped.
pub async fn run_writer(
    mut rx: mpsc::Receiver<RunRecord>,
    db: Db,
    telemetry: Option<Telemetry>,
) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = db.insert_record(&record).await {
            error!("run log: insert failed: {e:#}");
        }

        if let Some(t) = &telemetry {
            match serde_json::to_vec(&record) {
                Ok(payload) => {
                    if let Err(e) = t
                        .client
                        .publish(&t.topic, QoS::AtMostOnce, false, payload)
                        .await
                    {
                        warn!(topic = %t.topic, "run log: publish failed: {e}");
                    }
                }
                Err(e) => error!("run log: serialise failed: {e}"),
            }
        }
    }
    debug!("run log writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunRecord {
        RunRecord {
            ts: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            mode: Mode::Auto,
            stage_index: 1,
            stage_name: "LEAF_DRYING".into(),
            temperature: Some(44.5),
            humidity: None,
            alarm_active: false,
            actuators: ActuatorStates::default(),
        }
    }

    #[test]
    fn record_serializes_invalid_reading_as_null() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["mode"], "AUTO");
        assert_eq!(json["stage_name"], "LEAF_DRYING");
        assert!(json["humidity"].is_null());
        assert_eq!(json["ts"], "2023-11-14T22:13:20Z");
        assert_eq!(json["actuators"]["fan-1"], false);
    }

    #[tokio::test]
    async fn emit_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, sample());
        emit(&tx, sample()); // full, must not block
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn writer_persists_until_senders_drop() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        emit(&tx, sample());
        emit(&tx, sample());
        drop(tx);

        run_writer(rx, db.clone(), None).await;

        let rows = db.recent_records(10).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
