//! Validation of sensor payloads posted by the controller.

use serde::Deserialize;

use crate::db::NewReading;
use crate::error::ValidationError;

/// Actuator flag as firmware sends it: a JSON bool or 0/1.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    pub fn to_bool(self, field: &'static str) -> Result<bool, ValidationError> {
        match self {
            Flag::Bool(b) => Ok(b),
            Flag::Int(0) => Ok(false),
            Flag::Int(1) => Ok(true),
            Flag::Int(n) => Err(ValidationError::Invalid {
                field,
                reason: format!("expected true/false or 0/1, got {n}"),
            }),
        }
    }
}

/// Inbound payload. Older firmware uses the Spanish keys.
#[derive(Debug, Default, Deserialize)]
pub struct RawReading {
    #[serde(default, alias = "temperatura")]
    pub temperature: Option<f64>,
    #[serde(default, alias = "humedad")]
    pub humidity: Option<f64>,
    #[serde(default, alias = "pump1", alias = "bomba", alias = "bomba1")]
    pub pump: Option<Flag>,
    #[serde(default, alias = "bomba2")]
    pub pump2: Option<Flag>,
    #[serde(default, alias = "luces")]
    pub lights: Option<Flag>,
}

/// Checks required fields and fills neutral defaults for the optional ones.
/// Every missing field is reported at once.
pub fn validate(raw: &RawReading) -> Result<NewReading, ValidationError> {
    let mut missing = Vec::new();
    if raw.temperature.is_none() {
        missing.push("temperature");
    }
    if raw.pump.is_none() {
        missing.push("pump");
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    let temperature = finite("temperature", raw.temperature.unwrap_or_default())?;
    let humidity = finite("humidity", raw.humidity.unwrap_or(0.0))?;

    Ok(NewReading {
        temperature,
        humidity,
        pump1: raw.pump.map_or(Ok(false), |f| f.to_bool("pump"))?,
        pump2: raw.pump2.map_or(Ok(false), |f| f.to_bool("pump2"))?,
        lights: raw.lights.map_or(Ok(false), |f| f.to_bool("lights"))?,
    })
}

fn finite(field: &'static str, v: f64) -> Result<f64, ValidationError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(ValidationError::Invalid {
            field,
            reason: "must be a finite number".to_string(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> RawReading {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn full_payload_accepted() {
        let r = validate(&parse(
            r#"{"temperature": 24.5, "humidity": 60, "pump": true, "pump2": false, "lights": true}"#,
        ))
        .unwrap();
        assert_eq!(r.temperature, 24.5);
        assert_eq!(r.humidity, 60.0);
        assert!(r.pump1);
        assert!(!r.pump2);
        assert!(r.lights);
    }

    #[test]
    fn optional_fields_default_to_neutral() {
        let r = validate(&parse(r#"{"temperature": 21.0, "pump": false}"#)).unwrap();
        assert_eq!(r.humidity, 0.0);
        assert!(!r.pump2);
        assert!(!r.lights);
    }

    #[test]
    fn spanish_keys_and_integer_flags() {
        let r = validate(&parse(
            r#"{"temperatura": 19.0, "humedad": 70.5, "bomba": 1, "luces": 0}"#,
        ))
        .unwrap();
        assert_eq!(r.temperature, 19.0);
        assert_eq!(r.humidity, 70.5);
        assert!(r.pump1);
        assert!(!r.lights);
    }

    #[test]
    fn pump1_alias_accepted() {
        let r = validate(&parse(r#"{"temperature": 19.0, "pump1": true}"#)).unwrap();
        assert!(r.pump1);
    }

    #[test]
    fn missing_fields_all_reported() {
        let err = validate(&parse(r#"{"humidity": 50}"#)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingFields(vec!["temperature", "pump"])
        );
    }

    #[test]
    fn explicit_null_counts_as_missing() {
        let err = validate(&parse(r#"{"temperature": null, "pump": true}"#)).unwrap_err();
        assert_eq!(err, ValidationError::MissingFields(vec!["temperature"]));
    }

    #[test]
    fn flag_out_of_range_rejected() {
        let err = validate(&parse(r#"{"temperature": 20.0, "pump": 2}"#)).unwrap_err();
        assert!(err.to_string().starts_with("pump:"), "got: {err}");
    }

    #[test]
    fn non_finite_temperature_rejected() {
        let raw = RawReading {
            temperature: Some(f64::NAN),
            pump: Some(Flag::Bool(true)),
            ..Default::default()
        };
        let err = validate(&raw).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }
}
