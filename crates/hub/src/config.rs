//! TOML config file loading, validation, and seeding of initial pump and
//! light schedules.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::db::Db;
use crate::device_config::{set_light_config, set_pump_config, validate_light, validate_pump};
use crate::retention::RetentionPolicy;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub pumps: Vec<PumpSeed>,
    #[serde(default)]
    pub lights: Option<LightSeed>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:hidroponia.db?mode=rwc".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl DatabaseSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    #[serde(flatten)]
    pub policy: RetentionPolicy,
    pub interval_hours: u64,
    /// Default page size of `/historial`. Both reading windows must be at
    /// least this large.
    pub history_page: i64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            policy: RetentionPolicy::default(),
            interval_hours: 6,
            history_page: 20,
        }
    }
}

impl RetentionSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }
}

#[derive(Debug, Deserialize)]
pub struct PumpSeed {
    pub pump_number: i64,
    pub on_minutes: i64,
    pub off_minutes: i64,
}

#[derive(Debug, Deserialize)]
pub struct LightSeed {
    pub hour_on: i64,
    pub hour_off: i64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_database(&mut errors);
        self.validate_retention(&mut errors);
        self.validate_seeds(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_database(&self, errors: &mut Vec<String>) {
        if self.database.url.trim().is_empty() {
            errors.push("database.url is empty".to_string());
        }
        if self.database.timeout_ms == 0 {
            errors.push("database.timeout_ms must be positive".to_string());
        }
    }

    fn validate_retention(&self, errors: &mut Vec<String>) {
        let r = &self.retention;

        for (category, keep) in r.policy.limits() {
            if keep < 1 {
                errors.push(format!(
                    "retention.{} must be at least 1, got {keep}",
                    category.name()
                ));
            }
        }

        if r.history_page < 1 {
            errors.push(format!(
                "retention.history_page must be at least 1, got {}",
                r.history_page
            ));
        } else {
            // The dashboard's history page must fit inside both reading windows.
            for (name, keep) in [
                ("readings", r.policy.readings),
                ("legacy_readings", r.policy.legacy_readings),
            ] {
                if keep >= 1 && keep < r.history_page {
                    errors.push(format!(
                        "retention.{name} ({keep}) is smaller than history_page ({})",
                        r.history_page
                    ));
                }
            }
        }

        if r.interval_hours == 0 {
            errors.push("retention.interval_hours must be positive".to_string());
        }
    }

    fn validate_seeds(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<i64> = HashSet::new();

        for (i, p) in self.pumps.iter().enumerate() {
            if let Err(e) = validate_pump(p.pump_number, p.on_minutes, p.off_minutes) {
                errors.push(format!("pumps[{i}]: {e}"));
            } else if !seen.insert(p.pump_number) {
                errors.push(format!("pumps[{i}]: duplicate pump_number {}", p.pump_number));
            }
        }

        if let Some(l) = &self.lights {
            if let Err(e) = validate_light(l.hour_on, l.hour_off) {
                errors.push(format!("lights: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the built-in defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        load(path)
    } else {
        tracing::info!(path, "no config file, using defaults");
        Ok(Config::default())
    }
}

/// Append seeded schedules for keys that have no active config yet, so a
/// restart never shadows a schedule set from the dashboard.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let mut seeded = 0;

    for p in &config.pumps {
        let existing = db
            .latest_pump_config(p.pump_number)
            .await
            .with_context(|| format!("failed to read pump {} config", p.pump_number))?;
        if existing.is_none() {
            set_pump_config(
                db,
                p.pump_number,
                p.on_minutes,
                p.off_minutes,
                Some("seeded from config file"),
            )
            .await
            .with_context(|| format!("failed to seed pump {}", p.pump_number))?;
            seeded += 1;
        }
    }

    if let Some(l) = &config.lights {
        let existing = db
            .latest_light_config()
            .await
            .context("failed to read light config")?;
        if existing.is_none() {
            set_light_config(db, l.hour_on, l.hour_off)
                .await
                .context("failed to seed light schedule")?;
            seeded += 1;
        }
    }

    tracing::info!(seeded, "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_config::{get_light_config, get_pump_config, ConfigSource};

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn seeded_config() -> Config {
        Config {
            pumps: vec![PumpSeed {
                pump_number: 1,
                on_minutes: 8,
                off_minutes: 40,
            }],
            lights: Some(LightSeed {
                hour_on: 6,
                hour_off: 18,
            }),
            ..Config::default()
        }
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[server]
port = 8081

[database]
url = "sqlite::memory:"
timeout_ms = 250

[retention]
readings = 200
legacy_readings = 150
light_events = 40
pump_configs_per_pump = 3
light_configs = 2
interval_hours = 12
history_page = 50

[[pumps]]
pump_number = 2
on_minutes = 4
off_minutes = 25

[lights]
hour_on = 7
hour_off = 21
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.database.timeout(), Duration::from_millis(250));
        assert_eq!(config.retention.policy.readings, 200);
        assert_eq!(config.retention.policy.pump_configs_per_pump, 3);
        assert_eq!(config.retention.interval(), Duration::from_secs(12 * 3600));
        assert_eq!(config.pumps[0].pump_number, 2);
        assert_eq!(config.lights.as_ref().unwrap().hour_on, 7);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.retention.policy, RetentionPolicy::default());
        assert_eq!(config.retention.interval_hours, 6);
        assert!(config.pumps.is_empty());
        assert!(config.lights.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_retention_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[retention]\nlight_events = 10\n").unwrap();
        assert_eq!(config.retention.policy.light_events, 10);
        assert_eq!(config.retention.policy.readings, 100);
        assert_eq!(config.retention.history_page, 20);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn zero_keep_count_rejected() {
        let mut cfg = Config::default();
        cfg.retention.policy.light_configs = 0;
        assert_validation_err(&cfg, "retention.light_configs must be at least 1");
    }

    #[test]
    fn window_smaller_than_history_page_rejected() {
        let mut cfg = Config::default();
        cfg.retention.policy.readings = 10;
        assert_validation_err(&cfg, "retention.readings (10) is smaller than history_page (20)");
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = Config::default();
        cfg.retention.interval_hours = 0;
        assert_validation_err(&cfg, "interval_hours must be positive");
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = Config::default();
        cfg.database.timeout_ms = 0;
        assert_validation_err(&cfg, "timeout_ms must be positive");
    }

    #[test]
    fn bad_pump_seed_rejected() {
        let mut cfg = seeded_config();
        cfg.pumps[0].on_minutes = 0;
        assert_validation_err(&cfg, "pumps[0]: on_minutes 0 out of range");
    }

    #[test]
    fn duplicate_pump_seed_rejected() {
        let mut cfg = seeded_config();
        cfg.pumps.push(PumpSeed {
            pump_number: 1,
            on_minutes: 5,
            off_minutes: 30,
        });
        assert_validation_err(&cfg, "pumps[1]: duplicate pump_number 1");
    }

    #[test]
    fn bad_light_seed_rejected() {
        let mut cfg = seeded_config();
        cfg.lights = Some(LightSeed {
            hour_on: 24,
            hour_off: 2,
        });
        assert_validation_err(&cfg, "lights: hour_on 24 out of range");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.database.timeout_ms = 0;
        cfg.retention.interval_hours = 0;
        cfg.retention.policy.light_events = -1;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_empty_database() {
        let db = Db::memory().await;
        apply(&seeded_config(), &db).await.unwrap();

        let p1 = get_pump_config(&db, 1).await.unwrap();
        assert_eq!((p1.on_minutes, p1.off_minutes), (8, 40));
        assert_eq!(p1.source, ConfigSource::Stored);
        let l = get_light_config(&db).await.unwrap();
        assert_eq!((l.hour_on, l.hour_off), (6, 18));
    }

    #[tokio::test]
    async fn apply_does_not_shadow_existing_schedule() {
        let db = Db::memory().await;
        set_pump_config(&db, 1, 20, 60, None).await.unwrap();

        apply(&seeded_config(), &db).await.unwrap();
        apply(&seeded_config(), &db).await.unwrap();

        let p1 = get_pump_config(&db, 1).await.unwrap();
        assert_eq!((p1.on_minutes, p1.off_minutes), (20, 60));
        let lights: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM configuracion_luces")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(lights, 1);
    }
}
