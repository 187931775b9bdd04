//! Current-state resolution over an ordered list of reading sources, and the
//! dual-write that keeps the legacy table populated for older clients.
//!
//! Sources are consulted in order; the first one holding a qualifying row
//! defines the current state. No rows anywhere is a valid state (`None`).

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::db::{Db, LegacyRow, NewReading, ReadingRow};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Normalized,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentState {
    pub id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub pump1: bool,
    pub pump2: bool,
    pub lights: bool,
    pub event: String,
    #[serde(with = "time::serde::rfc3339")]
    pub fecha: OffsetDateTime,
    pub source: SourceKind,
}

/// Event label mirrored into `registros` for a reading.
pub fn event_label(pump1: bool) -> &'static str {
    if pump1 {
        "pump1_on"
    } else {
        "pump1_off"
    }
}

impl From<ReadingRow> for CurrentState {
    fn from(r: ReadingRow) -> Self {
        Self {
            id: r.id,
            temperature: r.temperature,
            humidity: r.humidity,
            pump1: r.pump1,
            pump2: r.pump2,
            lights: r.lights,
            event: event_label(r.pump1).to_string(),
            fecha: Db::timestamp(r.fecha),
            source: SourceKind::Normalized,
        }
    }
}

impl CurrentState {
    /// Remaps a legacy row (`pump` becomes `pump1`). Returns `None` for rows
    /// that are not full sensor snapshots.
    fn from_legacy(r: LegacyRow) -> Option<Self> {
        let pump1 = r.pump?;
        let event = r
            .event
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| event_label(pump1).to_string());
        Some(Self {
            id: r.id,
            temperature: r.temperature?,
            humidity: r.humidity?,
            pump1,
            pump2: r.pump2.unwrap_or(false),
            lights: r.lights.unwrap_or(false),
            event,
            fecha: Db::timestamp(r.fecha),
            source: SourceKind::Legacy,
        })
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateSource: Send + Sync {
    async fn latest(&self) -> Result<Option<CurrentState>, StoreError>;
}

pub struct NormalizedReadings {
    db: Db,
}

#[async_trait]
impl StateSource for NormalizedReadings {
    async fn latest(&self) -> Result<Option<CurrentState>, StoreError> {
        Ok(self.db.latest_reading().await?.map(CurrentState::from))
    }
}

pub struct LegacyReadings {
    db: Db,
}

#[async_trait]
impl StateSource for LegacyReadings {
    async fn latest(&self) -> Result<Option<CurrentState>, StoreError> {
        Ok(self
            .db
            .latest_legacy_reading()
            .await?
            .and_then(CurrentState::from_legacy))
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct StateReconciler {
    sources: Vec<Box<dyn StateSource>>,
}

impl StateReconciler {
    pub fn new(sources: Vec<Box<dyn StateSource>>) -> Self {
        Self { sources }
    }

    /// Normalized table first, legacy table as fallback.
    pub fn with_default_sources(db: &Db) -> Self {
        Self::new(vec![
            Box::new(NormalizedReadings { db: db.clone() }),
            Box::new(LegacyReadings { db: db.clone() }),
        ])
    }

    pub async fn current_state(&self) -> Result<Option<CurrentState>, StoreError> {
        for source in &self.sources {
            if let Some(state) = source.latest().await? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }
}

/// Writes a reading to the normalized table and mirrors it into `registros`.
///
/// The normalized write is authoritative: its failure fails the call. The
/// legacy mirror is best-effort and only logged.
pub async fn record_reading(db: &Db, reading: &NewReading) -> Result<i64, StoreError> {
    let fecha = Db::now_millis();
    let id = db.insert_reading(fecha, reading).await?;

    let event = event_label(reading.pump1);
    if let Err(e) = db.insert_legacy_reading(fecha, reading, event).await {
        warn!(reading_id = id, "legacy mirror write failed, keeping normalized row: {e}");
    }

    debug!(
        reading_id = id,
        temperature = reading.temperature,
        humidity = reading.humidity,
        pump1 = reading.pump1,
        "reading stored"
    );
    Ok(id)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(temperature: f64, pump1: bool) -> NewReading {
        NewReading {
            temperature,
            humidity: 60.0,
            pump1,
            pump2: false,
            lights: false,
        }
    }

    async fn count(db: &Db, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    struct Fixed(Option<CurrentState>);

    #[async_trait]
    impl StateSource for Fixed {
        async fn latest(&self) -> Result<Option<CurrentState>, StoreError> {
            Ok(self.0.clone())
        }
    }

    fn fixed_state(id: i64, source: SourceKind) -> CurrentState {
        CurrentState {
            id,
            temperature: 20.0,
            humidity: 50.0,
            pump1: false,
            pump2: false,
            lights: false,
            event: "pump1_off".into(),
            fecha: OffsetDateTime::UNIX_EPOCH,
            source,
        }
    }

    #[test]
    fn event_label_follows_pump1() {
        assert_eq!(event_label(true), "pump1_on");
        assert_eq!(event_label(false), "pump1_off");
    }

    #[tokio::test]
    async fn first_source_with_a_row_wins() {
        let reconciler = StateReconciler::new(vec![
            Box::new(Fixed(None)),
            Box::new(Fixed(Some(fixed_state(7, SourceKind::Legacy)))),
            Box::new(Fixed(Some(fixed_state(9, SourceKind::Normalized)))),
        ]);
        let state = reconciler.current_state().await.unwrap().unwrap();
        assert_eq!(state.id, 7);
    }

    #[tokio::test]
    async fn empty_store_is_absent_state() {
        let db = Db::memory().await;
        let reconciler = StateReconciler::with_default_sources(&db);
        assert!(reconciler.current_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ingested_reading_becomes_current_state() {
        let db = Db::memory().await;
        record_reading(&db, &reading(24.5, true)).await.unwrap();

        let reconciler = StateReconciler::with_default_sources(&db);
        let state = reconciler.current_state().await.unwrap().unwrap();
        assert_eq!(state.source, SourceKind::Normalized);
        assert_eq!(state.temperature, 24.5);
        assert_eq!(state.humidity, 60.0);
        assert!(state.pump1);
        assert_eq!(state.event, "pump1_on");
    }

    #[tokio::test]
    async fn dual_write_mirrors_into_legacy_table() {
        let db = Db::memory().await;
        record_reading(&db, &reading(18.0, false)).await.unwrap();

        assert_eq!(count(&db, "lecturas_sensores").await, 1);
        let legacy = db.latest_legacy_reading().await.unwrap().unwrap();
        assert_eq!(legacy.temperature, Some(18.0));
        assert_eq!(legacy.pump, Some(false));
        assert_eq!(legacy.event.as_deref(), Some("pump1_off"));
    }

    #[tokio::test]
    async fn falls_back_to_legacy_when_normalized_empty() {
        let db = Db::memory().await;
        db.insert_legacy_reading(1_000, &reading(17.0, true), "")
            .await
            .unwrap();
        // A config echo written later must not shadow the snapshot.
        db.insert_legacy_pump_event(2_000, 1, 5, 30).await.unwrap();

        let reconciler = StateReconciler::with_default_sources(&db);
        let state = reconciler.current_state().await.unwrap().unwrap();
        assert_eq!(state.source, SourceKind::Legacy);
        assert_eq!(state.temperature, 17.0);
        assert!(state.pump1);
        assert_eq!(state.event, "pump1_on");
    }

    #[tokio::test]
    async fn legacy_mirror_failure_is_swallowed() {
        let db = Db::memory().await;
        sqlx::query("DROP TABLE registros")
            .execute(db.pool())
            .await
            .unwrap();

        record_reading(&db, &reading(22.0, true)).await.unwrap();
        assert_eq!(count(&db, "lecturas_sensores").await, 1);
    }

    #[tokio::test]
    async fn normalized_failure_aborts_without_legacy_write() {
        let db = Db::memory().await;
        sqlx::query("DROP TABLE lecturas_sensores")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(record_reading(&db, &reading(22.0, true)).await.is_err());
        assert_eq!(count(&db, "registros").await, 0);
    }
}
