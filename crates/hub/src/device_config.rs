//! Pump and light configuration, stored as append-only logs.
//!
//! A write appends a new active row; a read resolves the latest active row,
//! falling back to the legacy event log (pumps only) and then to a built-in
//! default. Reads never fail with "not found".

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::{Db, LegacyPumpEventRow, LightConfigRow, PumpConfigRow};
use crate::error::{ApiError, ValidationError};

const PUMP_RANGE: &str = "{1, 2}";
const ON_MINUTES_RANGE: &str = "(0, 60]";
const OFF_MINUTES_RANGE: &str = "(0, 1440]";
const HOUR_RANGE: &str = "[0, 23]";

pub const DEFAULT_LIGHT_HOURS: (i64, i64) = (22, 2);

/// Built-in (on_minutes, off_minutes) per pump.
pub fn default_pump_minutes(pump_number: i64) -> (i64, i64) {
    match pump_number {
        2 => (3, 20),
        _ => (5, 30),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Stored,
    Legacy,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpConfig {
    pub pump_number: i64,
    pub on_minutes: i64,
    pub off_minutes: i64,
    pub description: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub source: ConfigSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightConfig {
    pub hour_on: i64,
    pub hour_off: i64,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub source: ConfigSource,
}

/// Latest-wins projection: the first present candidate, else `default`.
pub fn resolve<T>(candidates: impl IntoIterator<Item = Option<T>>, default: T) -> T {
    candidates.into_iter().flatten().next().unwrap_or(default)
}

fn describe_pump(pump_number: i64, on_minutes: i64, off_minutes: i64) -> String {
    format!("pump {pump_number}: {on_minutes} min on / {off_minutes} min off")
}

impl PumpConfig {
    pub fn default_for(pump_number: i64) -> Self {
        let (on_minutes, off_minutes) = default_pump_minutes(pump_number);
        Self {
            pump_number,
            on_minutes,
            off_minutes,
            description: describe_pump(pump_number, on_minutes, off_minutes),
            active: true,
            created_at: None,
            source: ConfigSource::Default,
        }
    }

    /// Legacy rows were never range-checked; out-of-range echoes are skipped.
    fn from_legacy(pump_number: i64, e: LegacyPumpEventRow) -> Option<Self> {
        validate_pump(pump_number, e.intervalo_on, e.intervalo_off).ok()?;
        Some(Self {
            pump_number,
            on_minutes: e.intervalo_on,
            off_minutes: e.intervalo_off,
            description: describe_pump(pump_number, e.intervalo_on, e.intervalo_off),
            active: true,
            created_at: Some(Db::timestamp(e.fecha)),
            source: ConfigSource::Legacy,
        })
    }
}

impl From<PumpConfigRow> for PumpConfig {
    fn from(r: PumpConfigRow) -> Self {
        Self {
            pump_number: r.pump_number,
            on_minutes: r.on_minutes,
            off_minutes: r.off_minutes,
            description: r.description,
            active: r.active,
            created_at: Some(Db::timestamp(r.fecha)),
            source: ConfigSource::Stored,
        }
    }
}

impl LightConfig {
    pub fn default_hours() -> Self {
        let (hour_on, hour_off) = DEFAULT_LIGHT_HOURS;
        Self {
            hour_on,
            hour_off,
            active: true,
            created_at: None,
            source: ConfigSource::Default,
        }
    }
}

impl From<LightConfigRow> for LightConfig {
    fn from(r: LightConfigRow) -> Self {
        Self {
            hour_on: r.hour_on,
            hour_off: r.hour_off,
            active: r.active,
            created_at: Some(Db::timestamp(r.fecha)),
            source: ConfigSource::Stored,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate_pump_number(pump_number: i64) -> Result<(), ValidationError> {
    if pump_number == 1 || pump_number == 2 {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field: "pump_number",
            value: pump_number,
            range: PUMP_RANGE,
        })
    }
}

pub fn validate_pump(
    pump_number: i64,
    on_minutes: i64,
    off_minutes: i64,
) -> Result<(), ValidationError> {
    validate_pump_number(pump_number)?;
    if !(1..=60).contains(&on_minutes) {
        return Err(ValidationError::OutOfRange {
            field: "on_minutes",
            value: on_minutes,
            range: ON_MINUTES_RANGE,
        });
    }
    if !(1..=1440).contains(&off_minutes) {
        return Err(ValidationError::OutOfRange {
            field: "off_minutes",
            value: off_minutes,
            range: OFF_MINUTES_RANGE,
        });
    }
    Ok(())
}

pub fn validate_light(hour_on: i64, hour_off: i64) -> Result<(), ValidationError> {
    for (field, value) in [("hour_on", hour_on), ("hour_off", hour_off)] {
        if !(0..=23).contains(&value) {
            return Err(ValidationError::OutOfRange {
                field,
                value,
                range: HOUR_RANGE,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Appends an active pump config and echoes it into the legacy event log.
pub async fn set_pump_config(
    db: &Db,
    pump_number: i64,
    on_minutes: i64,
    off_minutes: i64,
    description: Option<&str>,
) -> Result<PumpConfig, ApiError> {
    validate_pump(pump_number, on_minutes, off_minutes)?;

    let description = match description.map(str::trim) {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => describe_pump(pump_number, on_minutes, off_minutes),
    };
    let fecha = Db::now_millis();
    db.insert_pump_config(fecha, pump_number, on_minutes, off_minutes, &description)
        .await?;

    if let Err(e) = db
        .insert_legacy_pump_event(fecha, pump_number, on_minutes, off_minutes)
        .await
    {
        warn!(pump = pump_number, "legacy pump config echo failed: {e}");
    }

    info!(pump = pump_number, on_minutes, off_minutes, "pump config updated");

    Ok(PumpConfig {
        pump_number,
        on_minutes,
        off_minutes,
        description,
        active: true,
        created_at: Some(Db::timestamp(fecha)),
        source: ConfigSource::Stored,
    })
}

/// Stored active row, then legacy echo, then the built-in default.
pub async fn get_pump_config(db: &Db, pump_number: i64) -> Result<PumpConfig, ApiError> {
    validate_pump_number(pump_number)?;

    let stored = db
        .latest_pump_config(pump_number)
        .await?
        .map(PumpConfig::from);
    let legacy = match stored {
        Some(_) => None,
        None => db
            .latest_legacy_pump_event(pump_number)
            .await?
            .and_then(|e| PumpConfig::from_legacy(pump_number, e)),
    };

    Ok(resolve([stored, legacy], PumpConfig::default_for(pump_number)))
}

pub async fn set_light_config(
    db: &Db,
    hour_on: i64,
    hour_off: i64,
) -> Result<LightConfig, ApiError> {
    validate_light(hour_on, hour_off)?;

    let fecha = Db::now_millis();
    db.insert_light_config(fecha, hour_on, hour_off).await?;

    info!(hour_on, hour_off, "light schedule updated");

    Ok(LightConfig {
        hour_on,
        hour_off,
        active: true,
        created_at: Some(Db::timestamp(fecha)),
        source: ConfigSource::Stored,
    })
}

pub async fn get_light_config(db: &Db) -> Result<LightConfig, ApiError> {
    let stored = db.latest_light_config().await?.map(LightConfig::from);
    Ok(resolve([stored], LightConfig::default_hours()))
}

// ===========================================================================
// Tests
// ===========================================================================
