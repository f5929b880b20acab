use crate::error::{ArgusError, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// A single HTTP header sent with lookups, webhooks and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse an `AhBmCs` duration (`10m`, `1h30m`, `45s`, `1.5h`).
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ArgusError::InvalidDuration(input.to_string()));
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0f64;
    let mut number = String::new();
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number
            .parse()
            .map_err(|_| ArgusError::InvalidDuration(input.to_string()))?;
        number.clear();
        let unit_secs = match c {
            'h' => 3600.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            'm' => 60.0,
            's' => 1.0,
            _ => return Err(ArgusError::InvalidDuration(input.to_string())),
        };
        total += value * unit_secs;
    }
    if !number.is_empty() {
        // Trailing number without a unit, e.g. "1h30".
        return Err(ArgusError::InvalidDuration(input.to_string()));
    }
    Duration::try_from_secs_f64(total).map_err(|_| ArgusError::InvalidDuration(input.to_string()))
}

/// Parse a version as semver. A leading `v` is tolerated.
pub fn parse_semantic(version: &str) -> Result<semver::Version> {
    let trimmed = version.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    semver::Version::parse(bare).map_err(|_| ArgusError::NotSemantic(version.to_string()))
}

/// Current UTC time as an RFC3339 string (second precision).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// Templating
// ---------------------------------------------------------------------------

/// Values substituted into `{{ var }}` placeholders in notification
/// messages, webhook URLs, commands and docker tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    pub service_id: String,
    pub service_name: String,
    pub service_url: String,
    pub web_url: String,
    pub version: String,
    pub old_version: String,
}

impl TemplateVars {
    pub fn render(&self, template: &str) -> String {
        let pairs = [
            ("service_id", self.service_id.as_str()),
            ("service_name", self.service_name.as_str()),
            ("service_url", self.service_url.as_str()),
            ("web_url", self.web_url.as_str()),
            ("version", self.version.as_str()),
            ("old_version", self.old_version.as_str()),
        ];
        let mut out = template.to_string();
        for (key, value) in pairs {
            out = out.replace(&format!("{{{{ {key} }}}}"), value);
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }
}
