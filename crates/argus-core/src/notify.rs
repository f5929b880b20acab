//! Notifications sent when a new release is found or an action fails.

use crate::error::{ArgusError, Result};
use crate::lookup::http::{self, RetryPolicy};
use crate::types::{Header, TemplateVars};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_TITLE: &str = "Argus";
pub const DEFAULT_MESSAGE: &str = "{{ service_id }} - {{ version }} released";
pub const DEFAULT_MAX_TRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// A notifier, either under the global `notify:` map or referenced from a
/// service. Service entries override the global entry with the same ID
/// field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
}

impl NotifyConfig {
    pub fn merged(&self, global: Option<&NotifyConfig>) -> NotifyConfig {
        let Some(global) = global else {
            return self.clone();
        };
        NotifyConfig {
            url: self.url.clone().or_else(|| global.url.clone()),
            title: self.title.clone().or_else(|| global.title.clone()),
            message: self.message.clone().or_else(|| global.message.clone()),
            headers: if self.headers.is_empty() {
                global.headers.clone()
            } else {
                self.headers.clone()
            },
            max_tries: self.max_tries.or(global.max_tries),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    NewRelease,
    /// A webhook or command failed; carries the failure text.
    ActionFailed(String),
}

/// What the tracker hands to notifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEvent {
    pub vars: TemplateVars,
    pub kind: EventKind,
}

impl VersionEvent {
    pub fn new_release(vars: TemplateVars) -> Self {
        Self {
            vars,
            kind: EventKind::NewRelease,
        }
    }

    pub fn action_failed(vars: TemplateVars, detail: impl Into<String>) -> Self {
        Self {
            vars,
            kind: EventKind::ActionFailed(detail.into()),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, event: &VersionEvent) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HttpNotifier
// ---------------------------------------------------------------------------

/// POSTs `{title, message, service_id, version, old_version}` as JSON.
pub struct HttpNotifier {
    id: String,
    config: NotifyConfig,
    client: Client,
    pause: Duration,
}

impl HttpNotifier {
    pub fn new(id: &str, config: NotifyConfig) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            config,
            client: http::build_client(false)?,
            pause: Duration::from_secs(1),
        })
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    fn body(&self, event: &VersionEvent) -> serde_json::Value {
        let vars = &event.vars;
        let title = vars.render(self.config.title.as_deref().unwrap_or(DEFAULT_TITLE));
        let message = match &event.kind {
            EventKind::NewRelease => {
                vars.render(self.config.message.as_deref().unwrap_or(DEFAULT_MESSAGE))
            }
            EventKind::ActionFailed(detail) => detail.clone(),
        };
        json!({
            "title": title,
            "message": message,
            "service_id": vars.service_id,
            "version": vars.version,
            "old_version": vars.old_version,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: &VersionEvent) -> Result<()> {
        let url = self
            .config
            .url
            .as_deref()
            .map(|u| event.vars.render(u))
            .ok_or_else(|| ArgusError::Action(format!("notify {}: no url", self.id)))?;
        let body = self.body(event);
        let policy = RetryPolicy {
            attempts: self.config.max_tries.unwrap_or(DEFAULT_MAX_TRIES),
            pause: self.pause,
        };
        let resp = http::send_with_retries(policy, || {
            http::decorate(self.client.post(&url), &self.config.headers, None).json(&body)
        })
        .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ArgusError::Action(format!(
                "notify {}: {status}",
                self.id
            )));
        }
        tracing::info!(notify = %self.id, service = %event.vars.service_id, "notification sent");
        Ok(())
    }
}
