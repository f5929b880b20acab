use crate::error::{ArgusError, Result};
use crate::lookup::require::RequireSpec;
use crate::lookup::url_command::UrlCommands;
use crate::notify::NotifyConfig;
use crate::types::{parse_duration, BasicAuth, Header};
use crate::webhook::WebHookConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_INTERVAL: &str = "10m";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// `AhBmCs` between queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Versions must parse as semver and only move forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_versioning: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardOptions {
    /// Send webhooks/run commands for new releases without waiting for approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// `defaults.service` in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefaults {
    #[serde(default)]
    pub options: ServiceOptions,
    #[serde(default)]
    pub dashboard: DashboardOptions,
}

/// Options after falling back through `defaults.service` and the hard defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub active: bool,
    pub interval: Duration,
    pub semantic_versioning: bool,
    pub auto_approve: bool,
}

// ---------------------------------------------------------------------------
// Lookup specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    #[default]
    Github,
    Url,
}

/// Where the latest version of a service comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatestVersionSpec {
    #[serde(rename = "type", default)]
    pub kind: LookupKind,
    /// `owner/repo` for GitHub, a full URL otherwise.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_prerelease: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_invalid_certs: Option<bool>,
    #[serde(default, skip_serializing_if = "UrlCommands::is_empty")]
    pub url_commands: UrlCommands,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require: Option<RequireSpec>,
}

impl LatestVersionSpec {
    /// Human-facing URL of the source, used in logs and templates.
    pub fn service_url(&self) -> String {
        match self.kind {
            LookupKind::Github => format!("https://github.com/{}", self.url),
            LookupKind::Url => self.url.clone(),
        }
    }
}

/// Where the currently deployed version of a service comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployedVersionSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_invalid_certs: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    /// Dotted path into a JSON body, e.g. `data.version`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

/// One entry under `service:` in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Display name; the service ID is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub options: ServiceOptions,
    pub latest_version: LatestVersionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_version: Option<DeployedVersionSpec>,
    /// Notifiers by ID. Empty entries use the global `notify.<id>` as-is.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notify: BTreeMap<String, NotifyConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub webhook: BTreeMap<String, WebHookConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<Vec<String>>,
    #[serde(default)]
    pub dashboard: DashboardOptions,
}

impl ServiceConfig {
    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(id)
    }

    pub fn resolve_options(&self, defaults: &ServiceDefaults) -> Result<ResolvedOptions> {
        let interval = self
            .options
            .interval
            .as_deref()
            .or(defaults.options.interval.as_deref())
            .unwrap_or(DEFAULT_INTERVAL);
        let interval = parse_duration(interval)?;
        if interval.is_zero() {
            return Err(ArgusError::InvalidConfig(
                "interval must be greater than zero".into(),
            ));
        }
        Ok(ResolvedOptions {
            active: self
                .options
                .active
                .or(defaults.options.active)
                .unwrap_or(true),
            interval,
            semantic_versioning: self
                .options
                .semantic_versioning
                .or(defaults.options.semantic_versioning)
                .unwrap_or(true),
            auto_approve: self
                .dashboard
                .auto_approve
                .or(defaults.dashboard.auto_approve)
                .unwrap_or(false),
        })
    }

    /// Problems with this service, each prefixed with its config path.
    pub fn validate(
        &self,
        id: &str,
        defaults: &ServiceDefaults,
        global_notify: &BTreeMap<String, NotifyConfig>,
        global_webhook: &BTreeMap<String, WebHookConfig>,
    ) -> Vec<String> {
        let prefix = format!("service.{id}");
        let mut problems = Vec::new();

        if let Err(e) = self.resolve_options(defaults) {
            problems.push(format!("{prefix}.options.interval: {e}"));
        }
        if self.latest_version.url.trim().is_empty() {
            problems.push(format!("{prefix}.latest_version.url: <required>"));
        }
        for problem in self.latest_version.url_commands.validate() {
            problems.push(format!("{prefix}.latest_version.url_commands: {problem}"));
        }
        if let Some(require) = &self.latest_version.require {
            for problem in require.validate() {
                problems.push(format!("{prefix}.latest_version.require: {problem}"));
            }
        }
        if let Some(deployed) = &self.deployed_version {
            if deployed.url.trim().is_empty() {
                problems.push(format!("{prefix}.deployed_version.url: <required>"));
            }
            if let Some(re) = &deployed.regex {
                if let Err(e) = regex::Regex::new(re) {
                    problems.push(format!("{prefix}.deployed_version.regex: {e}"));
                }
            }
        }
        for (notify_id, notify) in &self.notify {
            if notify.merged(global_notify.get(notify_id)).url.is_none() {
                problems.push(format!(
                    "{prefix}.notify.{notify_id}: no url here or in notify.{notify_id}"
                ));
            }
        }
        for (webhook_id, webhook) in &self.webhook {
            let merged = webhook.merged(global_webhook.get(webhook_id));
            if merged.url.is_none() {
                problems.push(format!(
                    "{prefix}.webhook.{webhook_id}: no url here or in webhook.{webhook_id}"
                ));
            }
            if let Some(delay) = &merged.delay {
                if let Err(e) = parse_duration(delay) {
                    problems.push(format!("{prefix}.webhook.{webhook_id}.delay: {e}"));
                }
            }
        }
        for (i, argv) in self.command.iter().enumerate() {
            if argv.is_empty() || argv[0].trim().is_empty() {
                problems.push(format!("{prefix}.command[{i}]: <empty>"));
            }
        }
        problems
    }
}
