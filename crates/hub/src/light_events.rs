//! Append-only log of light switch events, independent of the light schedule.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::{Db, LightEventRow};
use crate::error::{ApiError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightMode {
    Manual,
    Auto,
}

impl LightMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LightMode::Manual => "manual",
            LightMode::Auto => "auto",
        }
    }

    fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(LightMode::Manual),
            "auto" => Ok(LightMode::Auto),
            other => Err(ValidationError::Invalid {
                field: "mode",
                reason: format!("expected 'manual' or 'auto', got '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightEvent {
    pub id: i64,
    pub on: bool,
    pub mode: LightMode,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub fecha: OffsetDateTime,
}

impl TryFrom<LightEventRow> for LightEvent {
    type Error = ValidationError;

    fn try_from(r: LightEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            on: r.state,
            mode: LightMode::parse(&r.mode)?,
            description: r.description,
            fecha: Db::timestamp(r.fecha),
        })
    }
}

/// Appends a light event. An empty description is replaced with a
/// generated one.
pub async fn record_light_event(
    db: &Db,
    on: bool,
    mode: LightMode,
    description: Option<&str>,
) -> Result<LightEvent, ApiError> {
    let description = match description.map(str::trim) {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => format!("lights {} ({})", if on { "on" } else { "off" }, mode.as_str()),
    };
    let fecha = Db::now_millis();
    let id = db
        .insert_light_event(fecha, on, mode.as_str(), &description)
        .await?;

    info!(on, mode = mode.as_str(), "light event recorded");

    Ok(LightEvent {
        id,
        on,
        mode,
        description,
        fecha: Db::timestamp(fecha),
    })
}

/// Newest first. Rows with an unknown mode are logged and skipped.
pub async fn recent_light_events(db: &Db, limit: i64) -> Result<Vec<LightEvent>, ApiError> {
    Ok(db
        .recent_light_events(limit)
        .await?
        .into_iter()
        .filter_map(|r| {
            let id = r.id;
            LightEvent::try_from(r)
                .map_err(|e| warn!(id, "skipping unreadable light event: {e}"))
                .ok()
        })
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================
