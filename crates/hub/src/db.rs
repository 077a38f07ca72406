use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::policy::{ActuatorStates, Mode};
use crate::record::RunRecord;

/// Upper bound for a single history query.
pub const MAX_HISTORY: i64 = 1000;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

type RunLogRow = (i64, String, i64, String, Option<f64>, Option<f64>, bool, String);

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/curing/curing.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Run log
    // ----------------------------

    pub async fn insert_record(&self, r: &RunRecord) -> Result<()> {
        let actuators =
            serde_json::to_string(&r.actuators).context("failed to encode actuator states")?;
        sqlx::query(
            r#"
            INSERT INTO run_log (
              ts, mode, stage_index, stage_name,
              temperature, humidity, alarm_active, actuators
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.ts.unix_timestamp())
        .bind(r.mode.to_string())
        .bind(r.stage_index as i64)
        .bind(&r.stage_name)
        .bind(r.temperature.map(f64::from))
        .bind(r.humidity.map(f64::from))
        .bind(r.alarm_active)
        .bind(actuators)
        .execute(&self.pool)
        .await
        .context("insert_record failed")?;
        Ok(())
    }

    /// Newest records first.
    pub async fn recent_records(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let limit = limit.clamp(1, MAX_HISTORY);
        let rows: Vec<RunLogRow> = sqlx::query_as(
            r#"
            SELECT ts, mode, stage_index, stage_name,
                   temperature, humidity, alarm_active, actuators
            FROM run_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_records failed")?;

        rows.into_iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: RunLogRow) -> Result<RunRecord> {
    let (ts, mode, stage_index, stage_name, temperature, humidity, alarm_active, actuators) = row;
    let mode = match mode.as_str() {
        "AUTO" => Mode::Auto,
        "MANUAL" => Mode::Manual,
        other => bail!("run_log: unknown mode '{other}'"),
    };
    let actuators: ActuatorStates =
        serde_json::from_str(&actuators).context("run_log: bad actuator json")?;

    Ok(RunRecord {
        ts: OffsetDateTime::from_unix_timestamp(ts).context("run_log: bad timestamp")?,
        mode,
        stage_index: stage_index.max(0) as usize,
        stage_name,
        temperature: temperature.map(|v| v as f32),
        humidity: humidity.map(|v| v as f32),
        alarm_active,
        actuators,
    })
}
