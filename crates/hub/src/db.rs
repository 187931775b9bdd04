//! Query gateway: the only module that talks to SQLite. Every statement runs
//! under the configured store timeout.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use time::OffsetDateTime;

use crate::error::StoreError;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    timeout: Duration,
}

/// A validated reading, ready to be written to both reading tables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewReading {
    pub temperature: f64,
    pub humidity: f64,
    pub pump1: bool,
    pub pump2: bool,
    pub lights: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReadingRow {
    pub id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub pump1: bool,
    pub pump2: bool,
    pub lights: bool,
    pub fecha: i64,
}

/// Row from the legacy wide table. Every sensor column is nullable there
/// because config echoes share the table.
#[derive(Debug, Clone, FromRow)]
pub struct LegacyRow {
    pub id: i64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pump: Option<bool>,
    pub pump2: Option<bool>,
    pub lights: Option<bool>,
    pub event: Option<String>,
    pub fecha: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PumpConfigRow {
    pub pump_number: i64,
    pub on_minutes: i64,
    pub off_minutes: i64,
    pub description: String,
    pub active: bool,
    pub fecha: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct LegacyPumpEventRow {
    pub intervalo_on: i64,
    pub intervalo_off: i64,
    pub fecha: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct LightConfigRow {
    pub hour_on: i64,
    pub hour_off: i64,
    pub active: bool,
    pub fecha: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct LightEventRow {
    pub id: i64,
    pub state: bool,
    pub mode: String,
    pub description: String,
    pub fecha: i64,
}

/// Legacy event label for a pump config echo in `registros`.
pub fn legacy_pump_event(pump_number: i64) -> String {
    format!("config_pump{pump_number}")
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/hidroponia/hidroponia.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str, timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Each in-memory connection is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool, timeout })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Migrated in-memory database for tests.
    #[cfg(test)]
    pub async fn memory() -> Self {
        let db = Self::connect("sqlite::memory:", Duration::from_secs(5))
            .await
            .unwrap();
        db.migrate().await.unwrap();
        db
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn now_millis() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    /// Stored `fecha` (Unix millis) back to a timestamp.
    pub fn timestamp(fecha: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(fecha as i128 * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            // The pool's acquire timer shares the budget and can fire first.
            Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => Err(StoreError::Timeout {
                op,
                after: self.timeout,
            }),
            Ok(res) => res.map_err(|source| StoreError::Query { op, source }),
        }
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, fecha: i64, r: &NewReading) -> Result<i64, StoreError> {
        let res = self
            .timed(
                "insert_reading",
                sqlx::query(
                    r#"
                    INSERT INTO lecturas_sensores (temperature, humidity, pump1, pump2, lights, fecha)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(r.temperature)
                .bind(r.humidity)
                .bind(r.pump1)
                .bind(r.pump2)
                .bind(r.lights)
                .bind(fecha)
                .execute(&self.pool),
            )
            .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn latest_reading(&self) -> Result<Option<ReadingRow>, StoreError> {
        self.timed(
            "latest_reading",
            sqlx::query_as::<_, ReadingRow>(
                r#"
                SELECT id, temperature, humidity, pump1, pump2, lights, fecha
                FROM lecturas_sensores
                ORDER BY fecha DESC, id DESC
                LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool),
        )
        .await
    }

    /// Newest first.
    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<ReadingRow>, StoreError> {
        self.timed(
            "recent_readings",
            sqlx::query_as::<_, ReadingRow>(
                r#"
                SELECT id, temperature, humidity, pump1, pump2, lights, fecha
                FROM lecturas_sensores
                ORDER BY fecha DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await
    }

    // ----------------------------
    // Legacy wide table
    // ----------------------------

    pub async fn insert_legacy_reading(
        &self,
        fecha: i64,
        r: &NewReading,
        event: &str,
    ) -> Result<(), StoreError> {
        self.timed(
            "insert_legacy_reading",
            sqlx::query(
                r#"
                INSERT INTO registros (temperature, humidity, pump, pump2, lights, event, fecha)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(r.temperature)
            .bind(r.humidity)
            .bind(r.pump1)
            .bind(r.pump2)
            .bind(r.lights)
            .bind(event)
            .bind(fecha)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Newest legacy row that is a full sensor snapshot. Config echoes and
    /// rows without a pump value never qualify.
    pub async fn latest_legacy_reading(&self) -> Result<Option<LegacyRow>, StoreError> {
        self.timed(
            "latest_legacy_reading",
            sqlx::query_as::<_, LegacyRow>(
                r#"
                SELECT id, temperature, humidity, pump, pump2, lights, event, fecha
                FROM registros
                WHERE temperature IS NOT NULL
                  AND humidity IS NOT NULL
                  AND pump IS NOT NULL
                ORDER BY fecha DESC, id DESC
                LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn insert_legacy_pump_event(
        &self,
        fecha: i64,
        pump_number: i64,
        on_minutes: i64,
        off_minutes: i64,
    ) -> Result<(), StoreError> {
        self.timed(
            "insert_legacy_pump_event",
            sqlx::query(
                r#"
                INSERT INTO registros (event, intervalo_on, intervalo_off, fecha)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(legacy_pump_event(pump_number))
            .bind(on_minutes)
            .bind(off_minutes)
            .bind(fecha)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Newest in-range config echo for a pump. Legacy clients wrote these
    /// unchecked, so out-of-range echoes never qualify.
    pub async fn latest_legacy_pump_event(
        &self,
        pump_number: i64,
    ) -> Result<Option<LegacyPumpEventRow>, StoreError> {
        self.timed(
            "latest_legacy_pump_event",
            sqlx::query_as::<_, LegacyPumpEventRow>(
                r#"
                SELECT intervalo_on, intervalo_off, fecha
                FROM registros
                WHERE event = ?
                  AND intervalo_on BETWEEN 1 AND 60
                  AND intervalo_off BETWEEN 1 AND 1440
                ORDER BY fecha DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(legacy_pump_event(pump_number))
            .fetch_optional(&self.pool),
        )
        .await
    }

    // ----------------------------
    // Pump / light config logs
    // ----------------------------

    pub async fn insert_pump_config(
        &self,
        fecha: i64,
        pump_number: i64,
        on_minutes: i64,
        off_minutes: i64,
        description: &str,
    ) -> Result<i64, StoreError> {
        let res = self
            .timed(
                "insert_pump_config",
                sqlx::query(
                    r#"
                    INSERT INTO configuracion_bombas
                      (pump_number, on_minutes, off_minutes, description, active, fecha)
                    VALUES (?, ?, ?, ?, 1, ?)
                    "#,
                )
                .bind(pump_number)
                .bind(on_minutes)
                .bind(off_minutes)
                .bind(description)
                .bind(fecha)
                .execute(&self.pool),
            )
            .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn latest_pump_config(
        &self,
        pump_number: i64,
    ) -> Result<Option<PumpConfigRow>, StoreError> {
        self.timed(
            "latest_pump_config",
            sqlx::query_as::<_, PumpConfigRow>(
                r#"
                SELECT pump_number, on_minutes, off_minutes, description, active, fecha
                FROM configuracion_bombas
                WHERE pump_number = ? AND active = 1
                ORDER BY fecha DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(pump_number)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn insert_light_config(
        &self,
        fecha: i64,
        hour_on: i64,
        hour_off: i64,
    ) -> Result<i64, StoreError> {
        let res = self
            .timed(
                "insert_light_config",
                sqlx::query(
                    r#"
                    INSERT INTO configuracion_luces (hour_on, hour_off, active, fecha)
                    VALUES (?, ?, 1, ?)
                    "#,
                )
                .bind(hour_on)
                .bind(hour_off)
                .bind(fecha)
                .execute(&self.pool),
            )
            .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn latest_light_config(&self) -> Result<Option<LightConfigRow>, StoreError> {
        self.timed(
            "latest_light_config",
            sqlx::query_as::<_, LightConfigRow>(
                r#"
                SELECT hour_on, hour_off, active, fecha
                FROM configuracion_luces
                WHERE active = 1
                ORDER BY fecha DESC, id DESC
                LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool),
        )
        .await
    }

    // ----------------------------
    // Light events
    // ----------------------------

    pub async fn insert_light_event(
        &self,
        fecha: i64,
        on: bool,
        mode: &str,
        description: &str,
    ) -> Result<i64, StoreError> {
        let res = self
            .timed(
                "insert_light_event",
                sqlx::query(
                    r#"
                    INSERT INTO eventos_luces (state, mode, description, fecha)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(on)
                .bind(mode)
                .bind(description)
                .bind(fecha)
                .execute(&self.pool),
            )
            .await?;
        Ok(res.last_insert_rowid())
    }

    /// Newest first.
    pub async fn recent_light_events(&self, limit: i64) -> Result<Vec<LightEventRow>, StoreError> {
        self.timed(
            "recent_light_events",
            sqlx::query_as::<_, LightEventRow>(
                r#"
                SELECT id, state, mode, description, fecha
                FROM eventos_luces
                ORDER BY fecha DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await
    }

    // ----------------------------
    // Retention
    // ----------------------------

    /// Runs a retention DELETE whose only parameter (`?1`) is the keep count.
    pub async fn delete_beyond(
        &self,
        op: &'static str,
        statement: &'static str,
        keep: i64,
    ) -> Result<u64, StoreError> {
        let res = self
            .timed(op, sqlx::query(statement).bind(keep).execute(&self.pool))
            .await?;
        Ok(res.rows_affected())
    }
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
            humidity: 55.0,
            pump1,
            pump2: false,
            lights: true,
        }
    }

    #[tokio::test]
    async fn exhausted_pool_reports_timeout() {
        let timeout = Duration::from_millis(50);
        let db = Db::connect("sqlite::memory:", timeout).await.unwrap();
        db.migrate().await.unwrap();

        // Hold the only connection so the next call cannot acquire one.
        let _held = db.pool().acquire().await.unwrap();

        match db.latest_reading().await {
            Err(StoreError::Timeout { op, after }) => {
                assert_eq!(op, "latest_reading");
                assert_eq!(after, timeout);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn latest_reading_orders_by_fecha_then_id() {
        let db = Db::memory().await;
        db.insert_reading(1_000, &reading(20.0, false)).await.unwrap();
        db.insert_reading(3_000, &reading(22.0, true)).await.unwrap();
        // Same timestamp as the previous row: the higher id wins.
        db.insert_reading(3_000, &reading(23.0, false)).await.unwrap();
        db.insert_reading(2_000, &reading(21.0, true)).await.unwrap();

        let latest = db.latest_reading().await.unwrap().unwrap();
        assert_eq!(latest.temperature, 23.0);
        assert!(!latest.pump1);
        assert!(latest.lights);
    }

    #[tokio::test]
    async fn latest_reading_empty_table() {
        let db = Db::memory().await;
        assert!(db.latest_reading().await.unwrap().is_none());
        assert!(db.latest_legacy_reading().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_readings_newest_first_with_limit() {
        let db = Db::memory().await;
        for i in 0..5 {
            db.insert_reading(i * 10, &reading(20.0 + i as f64, false))
                .await
                .unwrap();
        }
        let rows = db.recent_readings(3).await.unwrap();
        let temps: Vec<f64> = rows.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![24.0, 23.0, 22.0]);
    }

    #[tokio::test]
    async fn legacy_reading_skips_config_echoes() {
        let db = Db::memory().await;
        db.insert_legacy_reading(1_000, &reading(19.5, true), "pump1_on")
            .await
            .unwrap();
        db.insert_legacy_pump_event(2_000, 1, 10, 50).await.unwrap();

        let latest = db.latest_legacy_reading().await.unwrap().unwrap();
        assert_eq!(latest.temperature, Some(19.5));
        assert_eq!(latest.pump, Some(true));
        assert_eq!(latest.event.as_deref(), Some("pump1_on"));
    }

    #[tokio::test]
    async fn legacy_reading_skips_null_pump_rows() {
        let db = Db::memory().await;
        db.insert_legacy_reading(1_000, &reading(19.5, false), "pump1_off")
            .await
            .unwrap();
        sqlx::query("INSERT INTO registros (temperature, humidity, fecha) VALUES (30.0, 40.0, 5000)")
            .execute(db.pool())
            .await
            .unwrap();

        let latest = db.latest_legacy_reading().await.unwrap().unwrap();
        assert_eq!(latest.temperature, Some(19.5));
    }

    #[tokio::test]
    async fn legacy_pump_event_is_per_pump() {
        let db = Db::memory().await;
        db.insert_legacy_pump_event(1_000, 1, 10, 50).await.unwrap();
        db.insert_legacy_pump_event(2_000, 2, 4, 25).await.unwrap();
        db.insert_legacy_pump_event(3_000, 1, 12, 60).await.unwrap();

        let p1 = db.latest_legacy_pump_event(1).await.unwrap().unwrap();
        assert_eq!((p1.intervalo_on, p1.intervalo_off), (12, 60));
        let p2 = db.latest_legacy_pump_event(2).await.unwrap().unwrap();
        assert_eq!((p2.intervalo_on, p2.intervalo_off), (4, 25));
    }

    #[tokio::test]
    async fn latest_pump_config_ignores_inactive_rows() {
        let db = Db::memory().await;
        db.insert_pump_config(1_000, 1, 10, 30, "first").await.unwrap();
        sqlx::query(
            "INSERT INTO configuracion_bombas (pump_number, on_minutes, off_minutes, description, active, fecha) \
             VALUES (1, 20, 40, 'disabled', 0, 2000)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let cfg = db.latest_pump_config(1).await.unwrap().unwrap();
        assert_eq!(cfg.description, "first");
        assert!(cfg.active);
        assert!(db.latest_pump_config(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn light_events_round_trip_newest_first() {
        let db = Db::memory().await;
        db.insert_light_event(1_000, true, "auto", "schedule on").await.unwrap();
        db.insert_light_event(2_000, false, "manual", "dashboard off").await.unwrap();

        let events = db.recent_light_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].mode, "manual");
        assert!(!events[0].state);
        assert_eq!(events[1].description, "schedule on");
    }

    #[tokio::test]
    async fn schema_rejects_out_of_range_config() {
        let db = Db::memory().await;
        assert!(db.insert_pump_config(1_000, 3, 5, 30, "bad pump").await.is_err());
        assert!(db.insert_light_config(1_000, 8, 30).await.is_err());
    }

    #[tokio::test]
    async fn store_errors_carry_operation_name() {
        let db = Db::memory().await;
        db.close().await;
        match db.latest_reading().await {
            Err(StoreError::Query { op, .. }) => assert_eq!(op, "latest_reading"),
            other => panic!("expected query error, got {other:?}"),
        }
    }
}
