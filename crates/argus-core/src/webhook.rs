//! WebHooks fired for an approved release.

use crate::error::{ArgusError, Result};
use crate::lookup::http;
use crate::types::{parse_duration, Header, TemplateVars};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Responses containing these are failures even with a good status code.
const REJECTED_BODIES: &[&str] = &["do not have permission", "rules were not satisfied"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebHookKind {
    #[default]
    Github,
    Gitlab,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebHookConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<WebHookKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_headers: Vec<Header>,
    /// 0 (or unset) accepts any 2XX.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
    /// Wait this long before sending an auto-approved release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    /// Don't notify when every try fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent_fails: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_invalid_certs: Option<bool>,
}

impl WebHookConfig {
    pub fn merged(&self, global: Option<&WebHookConfig>) -> WebHookConfig {
        let Some(g) = global else {
            return self.clone();
        };
        WebHookConfig {
            kind: self.kind.or(g.kind),
            url: self.url.clone().or_else(|| g.url.clone()),
            secret: self.secret.clone().or_else(|| g.secret.clone()),
            custom_headers: if self.custom_headers.is_empty() {
                g.custom_headers.clone()
            } else {
                self.custom_headers.clone()
            },
            desired_status_code: self.desired_status_code.or(g.desired_status_code),
            max_tries: self.max_tries.or(g.max_tries),
            delay: self.delay.clone().or_else(|| g.delay.clone()),
            silent_fails: self.silent_fails.or(g.silent_fails),
            allow_invalid_certs: self.allow_invalid_certs.or(g.allow_invalid_certs),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// `sha256=<hex>` signature of `payload`, as GitHub sends it.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn random_sha() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// WebHook
// ---------------------------------------------------------------------------

pub struct WebHook {
    id: String,
    config: WebHookConfig,
    client: Client,
    retry_pause: Duration,
}

impl WebHook {
    /// `config` should already be merged with its global counterpart.
    pub fn new(id: &str, config: WebHookConfig) -> Result<Self> {
        let client = http::build_client(config.allow_invalid_certs.unwrap_or(false))?;
        Ok(Self {
            id: id.to_string(),
            config,
            client,
            retry_pause: Duration::from_secs(5),
        })
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn delay(&self) -> Duration {
        self.config
            .delay
            .as_deref()
            .and_then(|d| parse_duration(d).ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn silent_fails(&self) -> bool {
        self.config.silent_fails.unwrap_or(false)
    }

    fn max_tries(&self) -> u32 {
        self.config.max_tries.unwrap_or(DEFAULT_MAX_TRIES).max(1)
    }

    fn request(&self, vars: &TemplateVars) -> Result<reqwest::RequestBuilder> {
        let url = self
            .config
            .url
            .as_deref()
            .map(|u| vars.render(u))
            .ok_or_else(|| ArgusError::Action(format!("webhook {}: no url", self.id)))?;
        let secret = self.config.secret.clone().unwrap_or_default();

        let req = match self.config.kind.unwrap_or_default() {
            WebHookKind::Github => {
                let payload = serde_json::to_vec(&serde_json::json!({
                    "ref": "refs/heads/master",
                    "before": random_sha(),
                    "after": random_sha(),
                }))?;
                self.client
                    .post(url)
                    .header("Content-Type", "application/json")
                    .header("X-Github-Event", "push")
                    .header("X-Hub-Signature-256", sign(&secret, &payload))
                    .body(payload)
            }
            WebHookKind::Gitlab => self
                .client
                .post(url)
                .form(&[("token", secret.as_str()), ("ref", "master")]),
        };

        let headers: Vec<Header> = self
            .config
            .custom_headers
            .iter()
            .map(|h| Header {
                key: h.key.clone(),
                value: vars.render(&h.value),
            })
            .collect();
        Ok(http::decorate(req, &headers, None))
    }

    async fn try_once(&self, vars: &TemplateVars) -> Result<()> {
        let resp = self.request(vars)?.send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let body_ok = !REJECTED_BODIES.iter().any(|r| body.contains(r));
        let desired = self.config.desired_status_code.unwrap_or(0);
        let status_ok = if desired == 0 {
            status.is_success()
        } else {
            status.as_u16() == desired
        };
        if body_ok && status_ok {
            return Ok(());
        }
        let wanted = if desired == 0 {
            "2XX".to_string()
        } else {
            desired.to_string()
        };
        Err(ArgusError::Action(format!(
            "webhook {} gave {}, not {wanted}: {body}",
            self.id,
            status.as_u16()
        )))
    }

    /// Send, trying up to `max_tries` times. Stops early when `cancel` fires.
    pub async fn send(&self, vars: &TemplateVars, cancel: &CancellationToken) -> Result<()> {
        let tries = self.max_tries();
        for attempt in 1..=tries {
            if cancel.is_cancelled() {
                return Err(ArgusError::Action(format!("webhook {}: cancelled", self.id)));
            }
            match self.try_once(vars).await {
                Ok(()) => {
                    tracing::info!(webhook = %self.id, service = %vars.service_id, "webhook received");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(webhook = %self.id, service = %vars.service_id, attempt, error = %e, "webhook failed");
                }
            }
            if attempt < tries {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_pause) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
        Err(ArgusError::Action(format!(
            "failed {tries} times to send the webhook {} for {}",
            self.id, vars.service_id
        )))
    }
}
