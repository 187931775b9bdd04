mod config;
mod db;
mod device_config;
mod error;
mod ingest;
mod light_events;
mod reconcile;
mod retention;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::Db;
use reconcile::StateReconciler;
use retention::Pruner;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hydro_hub=info,tower_http=info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "hydro.toml".to_string());
    let mut cfg = config::load_or_default(&config_path)?;
    if let Ok(url) = env::var("DB_URL") {
        cfg.database.url = url;
    }
    if let Some(port) = env::var("PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.server.port = port;
    }
    cfg.validate()?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url, cfg.database.timeout()).await?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;

    info!(timeout_ms = cfg.database.timeout_ms, "db ready");

    // ── Retention timer ─────────────────────────────────────────────
    let policy = cfg.retention.policy;
    let pruner = Arc::new(Pruner::new(db.clone(), policy));
    let timer = tokio::spawn(retention::run_timer(
        Arc::clone(&pruner),
        cfg.retention.interval(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let state = AppState {
        db: db.clone(),
        reconciler: Arc::new(StateReconciler::with_default_sources(&db)),
        pruner,
        history_page: cfg.retention.history_page,
        history_max: policy.readings,
        light_events_max: policy.light_events,
    };
    let served = web::serve(state, cfg.server.port).await;

    timer.abort();
    db.close().await;
    info!("hub stopped");

    served
}
