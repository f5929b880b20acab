use crate::error::Result;
use crate::types::parse_duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_DATABASE_FILE: &str = "data/argus.db";
pub const DEFAULT_SAVE_DEBOUNCE: &str = "30s";
pub const DEFAULT_SHUTDOWN_TIMEOUT: &str = "10s";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_file: Option<String>,
}

/// Process-level settings. Unset fields fall back to hard defaults through
/// the getters, so only what the user wrote is saved back to the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_debounce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout: Option<String>,
}

type EnvSetter = fn(&mut Settings, String);

/// Environment variables that override settings from the config file.
const ENV_OVERRIDES: &[(&str, EnvSetter)] = &[
    ("ARGUS_LOG_LEVEL", |s, v| s.log.level = Some(v)),
    ("ARGUS_DATA_DATABASE_FILE", |s, v| s.data.database_file = Some(v)),
    ("ARGUS_SAVE_DEBOUNCE", |s, v| s.save_debounce = Some(v)),
    ("ARGUS_SHUTDOWN_TIMEOUT", |s, v| s.shutdown_timeout = Some(v)),
];

impl Settings {
    pub fn log_level(&self) -> &str {
        self.log.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn database_file(&self) -> PathBuf {
        PathBuf::from(
            self.data
                .database_file
                .as_deref()
                .unwrap_or(DEFAULT_DATABASE_FILE),
        )
    }

    pub fn save_debounce(&self) -> Result<Duration> {
        parse_duration(self.save_debounce.as_deref().unwrap_or(DEFAULT_SAVE_DEBOUNCE))
    }

    pub fn shutdown_timeout(&self) -> Result<Duration> {
        parse_duration(
            self.shutdown_timeout
                .as_deref()
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        )
    }

    /// Apply `ARGUS_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (key, set) in ENV_OVERRIDES {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                set(self, value);
            }
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.log_level().parse::<tracing::Level>().is_err() {
            problems.push(format!(
                "settings.log.level: {:?} is not a log level",
                self.log_level()
            ));
        }
        if let Err(e) = self.save_debounce() {
            problems.push(format!("settings.save_debounce: {e}"));
        }
        if let Err(e) = self.shutdown_timeout() {
            problems.push(format!("settings.shutdown_timeout: {e}"));
        }
        problems
    }
}
