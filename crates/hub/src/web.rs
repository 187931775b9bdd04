use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::db::Db;
use crate::device_config::{
    get_light_config, get_pump_config, set_light_config, set_pump_config, LightConfig, PumpConfig,
};
use crate::error::{ApiError, ValidationError};
use crate::ingest::{self, Flag, RawReading};
use crate::light_events::{record_light_event, recent_light_events, LightEvent, LightMode};
use crate::reconcile::{record_reading, CurrentState, StateReconciler};
use crate::retention::{PruneReport, Pruner};

const LIVENESS_TEXT: &str = "API Hidroponía online";

/// Everything a handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub reconciler: Arc<StateReconciler>,
    pub pruner: Arc<Pruner>,
    pub history_page: i64,
    pub history_max: i64,
    pub light_events_max: i64,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PumpConfigRequest {
    pub on_minutes: Option<i64>,
    pub off_minutes: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LightConfigRequest {
    pub hour_on: Option<i64>,
    pub hour_off: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LightEventRequest {
    pub on: Option<Flag>,
    pub mode: Option<LightMode>,
    pub description: Option<String>,
}

/// Unwraps a JSON body, reporting malformed bodies in the API error format.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(v)| v).map_err(|rejection| {
        ApiError::Validation(ValidationError::Invalid {
            field: "body",
            reason: rejection.body_text(),
        })
    })
}

fn require<T>(fields: [(&'static str, Option<T>); 2]) -> Result<(T, T), ApiError> {
    let [(a_name, a), (b_name, b)] = fields;
    match (a, b) {
        (Some(a), Some(b)) => Ok((a, b)),
        (a, b) => {
            let mut missing = Vec::new();
            if a.is_none() {
                missing.push(a_name);
            }
            if b.is_none() {
                missing.push(b_name);
            }
            Err(ValidationError::MissingFields(missing).into())
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/datos", post(post_reading))
        .route("/estado", get(current_state))
        .route("/historial", get(history))
        .route("/config/bombas/{pump}", get(pump_config).post(update_pump_config))
        .route("/config/luces", get(light_config).post(update_light_config))
        .route("/luces/eventos", get(light_events).post(post_light_event))
        .route("/mantenimiento/limpiar", post(prune_now))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], LIVENESS_TEXT)
}

async fn post_reading(
    State(state): State<AppState>,
    payload: Result<Json<RawReading>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let raw = body(payload)?;
    let reading = ingest::validate(&raw)?;
    let id = record_reading(&state.db, &reading).await?;
    Ok(Json(json!({ "status": "ok", "id": id })))
}

async fn current_state(
    State(state): State<AppState>,
) -> Result<Json<Option<CurrentState>>, ApiError> {
    Ok(Json(state.reconciler.current_state().await?))
}

async fn history(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<CurrentState>>, ApiError> {
    let limit = q.limit.unwrap_or(state.history_page).clamp(1, state.history_max);
    let rows = state.db.recent_readings(limit).await?;
    Ok(Json(rows.into_iter().map(CurrentState::from).collect()))
}

async fn pump_config(
    State(state): State<AppState>,
    Path(pump): Path<i64>,
) -> Result<Json<PumpConfig>, ApiError> {
    Ok(Json(get_pump_config(&state.db, pump).await?))
}

async fn update_pump_config(
    State(state): State<AppState>,
    Path(pump): Path<i64>,
    payload: Result<Json<PumpConfigRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PumpConfig>), ApiError> {
    let req = body(payload)?;
    let (on_minutes, off_minutes) = require([
        ("on_minutes", req.on_minutes),
        ("off_minutes", req.off_minutes),
    ])?;
    let cfg = set_pump_config(
        &state.db,
        pump,
        on_minutes,
        off_minutes,
        req.description.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(cfg)))
}

async fn light_config(State(state): State<AppState>) -> Result<Json<LightConfig>, ApiError> {
    Ok(Json(get_light_config(&state.db).await?))
}

async fn update_light_config(
    State(state): State<AppState>,
    payload: Result<Json<LightConfigRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LightConfig>), ApiError> {
    let req = body(payload)?;
    let (hour_on, hour_off) = require([("hour_on", req.hour_on), ("hour_off", req.hour_off)])?;
    let cfg = set_light_config(&state.db, hour_on, hour_off).await?;
    Ok((StatusCode::CREATED, Json(cfg)))
}

async fn light_events(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<LightEvent>>, ApiError> {
    let limit = q
        .limit
        .unwrap_or(state.history_page)
        .clamp(1, state.light_events_max);
    Ok(Json(recent_light_events(&state.db, limit).await?))
}

async fn post_light_event(
    State(state): State<AppState>,
    payload: Result<Json<LightEventRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LightEvent>), ApiError> {
    let req = body(payload)?;
    let on = req
        .on
        .ok_or(ValidationError::MissingFields(vec!["on"]))?
        .to_bool("on")?;
    let mode = req.mode.unwrap_or(LightMode::Manual);
    let event = record_light_event(&state.db, on, mode, req.description.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn prune_now(State(state): State<AppState>) -> Result<Json<PruneReport>, ApiError> {
    Ok(Json(state.pruner.run_now().await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    #[cfg(feature = "tls")]
    if let (Ok(cert), Ok(key)) = (std::env::var("TLS_CERT"), std::env::var("TLS_KEY")) {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
            .await
            .with_context(|| format!("failed to load TLS cert/key: {cert}, {key}"))?;
        tracing::info!("listening on https://{addr}");
        axum_server::bind_rustls(addr, tls)
            .handle(shutdown_handle(shutdown_signal()))
            .serve(app.into_make_service())
            .await
            .context("web server error")?;
        return Ok(());
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("web server error")?;
    Ok(())
}

/// Drains in-flight requests once `signal` resolves.
#[cfg(feature = "tls")]
fn shutdown_handle<F>(signal: F) -> axum_server::Handle
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = axum_server::Handle::new();
    let on_signal = handle.clone();
    tokio::spawn(async move {
        signal.await;
        on_signal.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });
    handle
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

// ===========================================================================
// Tests
// ===========================================================================
