//! Bounded history: keep the newest K rows per category and delete the rest.
//!
//! Ordering is `fecha DESC, id DESC`, so ties on timestamp resolve the same
//! way on every run. Rows that currently define "current" state or config are
//! always kept, even when they fall outside the window. One pass over the
//! categories is `prune`; the timer and the admin endpoint both go through
//! [`Pruner`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::error::StoreError;

pub type PruneReport = BTreeMap<&'static str, u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Readings,
    LegacyReadings,
    LightEvents,
    PumpConfigs,
    LightConfigs,
}

impl Category {
    pub fn name(self) -> &'static str {
        match self {
            Category::Readings => "readings",
            Category::LegacyReadings => "legacy_readings",
            Category::LightEvents => "light_events",
            Category::PumpConfigs => "pump_configs",
            Category::LightConfigs => "light_configs",
        }
    }

    fn op(self) -> &'static str {
        match self {
            Category::Readings => "prune_readings",
            Category::LegacyReadings => "prune_legacy_readings",
            Category::LightEvents => "prune_light_events",
            Category::PumpConfigs => "prune_pump_configs",
            Category::LightConfigs => "prune_light_configs",
        }
    }

    /// DELETE statement; `?1` is the keep count.
    fn statement(self) -> &'static str {
        match self {
            Category::Readings => {
                r#"
                DELETE FROM lecturas_sensores
                WHERE id NOT IN (
                  SELECT id FROM lecturas_sensores
                  ORDER BY fecha DESC, id DESC
                  LIMIT ?1
                )
                "#
            }
            // Besides the window, keep the newest full snapshot and the
            // newest in-range config echo per pump: both back fallbacks.
            Category::LegacyReadings => {
                r#"
                DELETE FROM registros
                WHERE id NOT IN (
                  SELECT id FROM registros
                  ORDER BY fecha DESC, id DESC
                  LIMIT ?1
                )
                AND id NOT IN (
                  SELECT id FROM registros
                  WHERE temperature IS NOT NULL
                    AND humidity IS NOT NULL
                    AND pump IS NOT NULL
                  ORDER BY fecha DESC, id DESC
                  LIMIT 1
                )
                AND id NOT IN (
                  SELECT id FROM (
                    SELECT id,
                           ROW_NUMBER() OVER (
                             PARTITION BY event ORDER BY fecha DESC, id DESC
                           ) AS rn
                    FROM registros
                    WHERE event IN ('config_pump1', 'config_pump2')
                      AND intervalo_on BETWEEN 1 AND 60
                      AND intervalo_off BETWEEN 1 AND 1440
                  )
                  WHERE rn = 1
                )
                "#
            }
            Category::LightEvents => {
                r#"
                DELETE FROM eventos_luces
                WHERE id NOT IN (
                  SELECT id FROM eventos_luces
                  ORDER BY fecha DESC, id DESC
                  LIMIT ?1
                )
                "#
            }
            Category::PumpConfigs => {
                r#"
                DELETE FROM configuracion_bombas
                WHERE id IN (
                  SELECT id FROM (
                    SELECT id,
                           ROW_NUMBER() OVER (
                             PARTITION BY pump_number ORDER BY fecha DESC, id DESC
                           ) AS rn
                    FROM configuracion_bombas
                  )
                  WHERE rn > ?1
                )
                AND id NOT IN (
                  SELECT id FROM (
                    SELECT id,
                           ROW_NUMBER() OVER (
                             PARTITION BY pump_number ORDER BY fecha DESC, id DESC
                           ) AS rn
                    FROM configuracion_bombas
                    WHERE active = 1
                  )
                  WHERE rn = 1
                )
                "#
            }
            Category::LightConfigs => {
                r#"
                DELETE FROM configuracion_luces
                WHERE id NOT IN (
                  SELECT id FROM configuracion_luces
                  ORDER BY fecha DESC, id DESC
                  LIMIT ?1
                )
                AND id NOT IN (
                  SELECT id FROM configuracion_luces
                  WHERE active = 1
                  ORDER BY fecha DESC, id DESC
                  LIMIT 1
                )
                "#
            }
        }
    }
}

/// Keep counts per category. Pump configs are kept per pump number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub readings: i64,
    pub legacy_readings: i64,
    pub light_events: i64,
    pub pump_configs_per_pump: i64,
    pub light_configs: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            readings: 100,
            legacy_readings: 100,
            light_events: 50,
            pump_configs_per_pump: 5,
            light_configs: 5,
        }
    }
}

impl RetentionPolicy {
    pub fn limits(&self) -> [(Category, i64); 5] {
        [
            (Category::Readings, self.readings),
            (Category::LegacyReadings, self.legacy_readings),
            (Category::LightEvents, self.light_events),
            (Category::PumpConfigs, self.pump_configs_per_pump),
            (Category::LightConfigs, self.light_configs),
        ]
    }
}

/// One retention pass. A keep count below 1 is treated as 1.
pub async fn prune(db: &Db, policy: &RetentionPolicy) -> Result<PruneReport, StoreError> {
    let mut report = PruneReport::new();
    for (category, keep) in policy.limits() {
        let removed = db
            .delete_beyond(category.op(), category.statement(), keep.max(1))
            .await?;
        report.insert(category.name(), removed);
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Serializes prune runs between the timer and on-demand callers.
pub struct Pruner {
    db: Db,
    policy: RetentionPolicy,
    running: Mutex<()>,
}

impl Pruner {
    pub fn new(db: Db, policy: RetentionPolicy) -> Self {
        Self {
            db,
            policy,
            running: Mutex::new(()),
        }
    }

    /// On-demand run. Waits for an in-flight run to finish first.
    pub async fn run_now(&self) -> Result<PruneReport, StoreError> {
        let _guard = self.running.lock().await;
        self.run_locked("on-demand").await
    }

    /// Timer run. Returns `None` without touching the store when another run
    /// is in flight.
    pub async fn try_run(&self) -> Option<Result<PruneReport, StoreError>> {
        let _guard = self.running.try_lock().ok()?;
        Some(self.run_locked("scheduled").await)
    }

    async fn run_locked(&self, trigger: &'static str) -> Result<PruneReport, StoreError> {
        let report = prune(&self.db, &self.policy).await?;
        let removed: u64 = report.values().sum();
        if removed > 0 {
            info!(trigger, removed, ?report, "retention pass complete");
        }
        Ok(report)
    }
}

/// Runs `try_run` every `period` for the life of the process. The first pass
/// happens immediately. Failures are logged and the timer keeps going.
pub async fn run_timer(pruner: Arc<Pruner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(period_sec = period.as_secs(), "retention timer started");

    loop {
        ticker.tick().await;
        match pruner.try_run().await {
            Some(Ok(_)) => {}
            Some(Err(e)) => error!("scheduled retention pass failed: {e}"),
            None => warn!("retention pass still running, skipping tick"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
