use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::WebConfig;
use crate::db::Db;
use crate::gateway::{Command, CommandGateway, CommandRejection};
use crate::host;
use crate::policy::ActuatorTarget;
use crate::state::StatusResponse;

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Rows returned by `/api/history` when no limit is given.
const DEFAULT_HISTORY: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub gateway: CommandGateway,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    Rejected(CommandRejection),
    Internal(anyhow::Error),
}

impl From<CommandRejection> for ApiError {
    fn from(r: CommandRejection) -> Self {
        Self::Rejected(r)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Rejected(r @ CommandRejection::UnknownActuator(_)) => {
                (StatusCode::NOT_FOUND, r.to_string())
            }
            Self::Rejected(r) => (StatusCode::CONFLICT, r.to_string()),
            Self::Internal(e) => {
                error!("api: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/host", get(api_host))
        .route("/api/mode/toggle", post(api_toggle_mode))
        .route("/api/stage/advance", post(api_advance_stage))
        .route("/api/run/reset", post(api_reset_run))
        .route("/api/fan/toggle", post(api_toggle_fans))
        .route("/api/dehumidifier/toggle", post(api_toggle_dehumidifiers))
        .route("/api/actuators/{name}/toggle", post(api_toggle_actuator))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.gateway.status().await)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
}

async fn api_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<crate::record::RunRecord>> {
    let rows = state
        .db
        .recent_records(params.limit.unwrap_or(DEFAULT_HISTORY))
        .await?;
    Ok(Json(rows))
}

async fn api_host() -> ApiResult<host::HostStats> {
    let stats = tokio::task::spawn_blocking(host::sample)
        .await
        .map_err(|e| anyhow::anyhow!("host sampler panicked: {e}"))?;
    Ok(Json(stats))
}

async fn run(state: &AppState, cmd: Command) -> ApiResult<StatusResponse> {
    Ok(Json(state.gateway.execute(cmd).await?))
}

async fn api_toggle_mode(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    run(&state, Command::ToggleMode).await
}

async fn api_advance_stage(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    run(&state, Command::AdvanceStage).await
}

async fn api_reset_run(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    run(&state, Command::ResetRun).await
}

async fn api_toggle_fans(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    run(&state, Command::Toggle(ActuatorTarget::Fans)).await
}

async fn api_toggle_dehumidifiers(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    run(&state, Command::Toggle(ActuatorTarget::Dehumidifiers)).await
}

async fn api_toggle_actuator(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusResponse> {
    run(&state, Command::toggle(&name)?).await
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, cfg: WebConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let app = router(state);

    if let (Some(cert), Some(key)) = (&cfg.tls_cert, &cfg.tls_key) {
        return serve_tls(app, addr, cert, key).await;
    }

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind web port {addr}: {e}"))?;
    info!("web ui listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "tls")]
async fn serve_tls(app: Router, addr: SocketAddr, cert: &str, key: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use axum_server::tls_rustls::RustlsConfig;

    let tls = RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;
    info!("web ui listening on https://{addr}");
    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

#[cfg(not(feature = "tls"))]
async fn serve_tls(_app: Router, _addr: SocketAddr, _cert: &str, _key: &str) -> anyhow::Result<()> {
    anyhow::bail!("web.tls_cert is set but this build has no TLS support (enable the `tls` feature)")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ActuatorStates, Mode};
    use crate::record::RunRecord;
    use crate::stage::StageTable;
    use crate::state::{SharedState, SystemState};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Instant;
    use time::OffsetDateTime;
    use tokio::sync::{mpsc, Notify, RwLock};
    use tower::ServiceExt;

    async fn app_state() -> AppState {
        let shared: SharedState = Arc::new(RwLock::new(SystemState::new(
            StageTable::flue_cured(),
            Instant::now(),
        )));
        let (tx, _rx) = mpsc::channel(64);
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        AppState {
            gateway: CommandGateway::new(shared, Arc::new(Notify::new()), tx),
            db,
        }
    }

    async fn send(state: &AppState, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let res = router(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn index_serves_html() {
        let state = app_state().await;
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let res = router(state).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn status_before_first_reading() {
        let state = app_state().await;
        let (code, body) = send(&state, "GET", "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["mode"], "AUTO");
        assert_eq!(body["stage_name"], "YELLOWING");
        assert_eq!(body["stage_count"], 4);
        assert_eq!(body["reading_valid"], false);
        assert!(body["temperature"].is_null());
        assert!(body["humidity"].is_null());
        assert_eq!(body["alarm_active"], false);
        assert!(body["summary"].as_str().unwrap().starts_with("T --/35.0C H --%"));
    }

    #[tokio::test]
    async fn toggle_mode_returns_new_state() {
        let state = app_state().await;
        let (code, body) = send(&state, "POST", "/api/mode/toggle").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["mode"], "MANUAL");
        assert_eq!(body["remaining_secs"], 0);
    }

    #[tokio::test]
    async fn fan_toggle_in_auto_is_conflict() {
        let state = app_state().await;
        let (code, body) = send(&state, "POST", "/api/fan/toggle").await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["error"], "fan cannot be toggled in AUTO mode");
    }

    #[tokio::test]
    async fn manual_toggles_change_outputs() {
        let state = app_state().await;
        send(&state, "POST", "/api/mode/toggle").await;

        let (code, body) = send(&state, "POST", "/api/dehumidifier/toggle").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["actuators"]["dehumidifier-1"], true);
        assert_eq!(body["actuators"]["dehumidifier-2"], true);

        let (code, body) = send(&state, "POST", "/api/actuators/fan-2/toggle").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["actuators"]["fan-2"], true);
        assert_eq!(body["actuators"]["fan-1"], false);
    }

    #[tokio::test]
    async fn buzzer_toggle_is_conflict_even_in_manual() {
        let state = app_state().await;
        send(&state, "POST", "/api/mode/toggle").await;
        let (code, _) = send(&state, "POST", "/api/actuators/buzzer/toggle").await;
        assert_eq!(code, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_actuator_is_not_found() {
        let state = app_state().await;
        let (code, body) = send(&state, "POST", "/api/actuators/sprinkler/toggle").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown actuator 'sprinkler'");
    }

    #[tokio::test]
    async fn advance_and_reset() {
        let state = app_state().await;
        let (_, body) = send(&state, "POST", "/api/stage/advance").await;
        assert_eq!(body["stage_name"], "LEAF_DRYING");

        let (_, body) = send(&state, "POST", "/api/run/reset").await;
        assert_eq!(body["stage_index"], 0);
        assert_eq!(body["mode"], "AUTO");
    }

    #[tokio::test]
    async fn history_returns_newest_first_with_limit() {
        let state = app_state().await;
        for i in 0..3 {
            state
                .db
                .insert_record(&RunRecord {
                    ts: OffsetDateTime::from_unix_timestamp(1_700_000_000 + i).unwrap(),
                    mode: Mode::Auto,
                    stage_index: i as usize,
                    stage_name: format!("S{i}"),
                    temperature: Some(30.0),
                    humidity: Some(70.0),
                    alarm_active: false,
                    actuators: ActuatorStates::default(),
                })
                .await
                .unwrap();
        }

        let (code, body) = send(&state, "GET", "/api/history?limit=2").await;
        assert_eq!(code, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["stage_name"], "S2");

        let (_, body) = send(&state, "GET", "/api/history").await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn host_stats_available() {
        let state = app_state().await;
        let (code, body) = send(&state, "GET", "/api/host").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body["memory_total_bytes"].as_u64().is_some());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let state = app_state().await;
        let (code, _) = send(&state, "GET", "/api/nope").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
