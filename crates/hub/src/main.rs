mod buttons;
mod config;
mod control;
mod db;
mod gateway;
mod host;
mod mqtt;
mod policy;
mod record;
mod relay;
mod sensor;
mod sim;
mod stage;
mod state;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Instant};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::SensorKind;
use control::ControlLoop;
use db::Db;
use gateway::CommandGateway;
use record::{Telemetry, RECORD_QUEUE};
use relay::RelayBoard;
use sensor::{AnySensor, IioSensor, SimSensor};
use sim::Plant;
use state::{SharedState, SystemState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let stages = cfg.stage_table()?;

    // ── Database ────────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:curing.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    info!(%db_url, "db ready");

    // ── Sensor ──────────────────────────────────────────────────────
    // A barn must never run blind: failing to open the sensor aborts.
    let mut plant = None;
    let sensor = match cfg.sensor.kind {
        SensorKind::Iio => AnySensor::Iio(
            IioSensor::open(&cfg.sensor.iio_device).context("sensor startup failed")?,
        ),
        SensorKind::Sim => {
            let handle = Plant::new(
                cfg.sensor.sim_ambient_temperature,
                cfg.sensor.sim_ambient_humidity,
            )
            .shared();
            plant = Some(Arc::clone(&handle));
            warn!("running on the simulated barn");
            AnySensor::Sim(SimSensor::new(handle))
        }
    };

    // ── Relay board ─────────────────────────────────────────────────
    let mut relays = RelayBoard::new(
        &cfg.relay_wiring(),
        cfg.indicator_pins(),
        cfg.relays.active_low,
    )?;
    if let Some(plant) = plant {
        relays = relays.with_plant(plant);
    }

    // ── Shared state ────────────────────────────────────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new(stages, Instant::now())));
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── MQTT (optional) + run log writer ────────────────────────────
    let mqtt = cfg.mqtt.as_ref().map(|m| {
        let (client, eventloop) = mqtt::connect(m);
        info!(host = %m.host, port = m.port, prefix = %m.prefix, "mqtt enabled");
        (client, eventloop, mqtt::Topics::new(&m.prefix))
    });

    let (record_tx, record_rx) = mpsc::channel(RECORD_QUEUE);
    let telemetry = mqtt.as_ref().map(|(client, _, topics)| Telemetry {
        client: client.clone(),
        topic: topics.telemetry.clone(),
    });
    tokio::spawn(record::run_writer(record_rx, db.clone(), telemetry));

    // ── Command surfaces ────────────────────────────────────────────
    let wake = Arc::new(Notify::new());
    let gateway = CommandGateway::new(Arc::clone(&shared), Arc::clone(&wake), record_tx.clone());

    if let Some((client, eventloop, topics)) = mqtt {
        tokio::spawn(mqtt::run(client, eventloop, topics, gateway.clone()));
    }

    let web_state = web::AppState {
        gateway: gateway.clone(),
        db: db.clone(),
    };
    let web_cfg = cfg.web.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_cfg).await {
            error!("web server stopped: {e:#}");
        }
    });

    #[cfg(feature = "gpio")]
    if let Some(pins) = cfg.button_pins() {
        buttons::spawn_listener(pins, gateway.clone())?;
    }
    #[cfg(not(feature = "gpio"))]
    if cfg.button_pins().is_some() {
        warn!("buttons configured but built without the gpio feature; ignoring");
    }

    // ── Control loop (runs until Ctrl-C) ────────────────────────────
    let control = ControlLoop::new(
        sensor,
        relays,
        shared,
        wake,
        record_tx,
        cfg.loop_settings(),
    );
    control
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("ctrl-c handler failed: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("hub stopped");
    Ok(())
}
