use crate::error::{ArgusError, Result};
use crate::lookup::http::{self, RetryPolicy};
use crate::lookup::VersionLookup;
use crate::service::DeployedVersionSpec;
use crate::types::parse_semantic;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;

/// Deployed version read from a running instance's HTTP endpoint.
pub struct WebLookup {
    service_id: String,
    spec: DeployedVersionSpec,
    semantic_versioning: bool,
    client: Client,
    retry: RetryPolicy,
}

impl WebLookup {
    pub fn new(
        service_id: &str,
        spec: DeployedVersionSpec,
        semantic_versioning: bool,
    ) -> Result<Self> {
        let client = http::build_client(spec.allow_invalid_certs.unwrap_or(false))?;
        Ok(Self {
            service_id: service_id.to_string(),
            spec,
            semantic_versioning,
            client,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn extract(&self, body: &str) -> Result<String> {
        let mut version = body.trim().to_string();
        if let Some(path) = &self.spec.json {
            let value: Value = serde_json::from_str(body)?;
            version = json_path(&value, path).ok_or_else(|| ArgusError::Query {
                service: self.service_id.clone(),
                reason: format!("failed to find value for {path:?} in JSON body"),
            })?;
        }
        if let Some(pattern) = &self.spec.regex {
            let re = Regex::new(pattern)?;
            let caps = re.captures(&version).ok_or_else(|| ArgusError::NoMatch {
                kind: "deployed_version regex".into(),
                pattern: pattern.clone(),
            })?;
            version = caps
                .get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
        }
        Ok(version)
    }
}

/// Walk a dotted path (`a.b[0].c` or `a.b.0.c`) through a JSON value.
/// Scalars are returned as their plain string form.
fn json_path(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for raw in path.split('.') {
        let (key, indexes) = match raw.find('[') {
            Some(i) => (&raw[..i], &raw[i..]),
            None => (raw, ""),
        };
        if !key.is_empty() {
            current = match current {
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => current.get(key)?,
            };
        }
        for idx in indexes.split('[').skip(1) {
            let n: usize = idx.strip_suffix(']')?.parse().ok()?;
            current = current.get(n)?;
        }
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[async_trait]
impl VersionLookup for WebLookup {
    async fn query(&self) -> Result<String> {
        let resp = http::send_with_retries(self.retry, || {
            http::decorate(
                self.client.get(&self.spec.url),
                &self.spec.headers,
                self.spec.basic_auth.as_ref(),
            )
        })
        .await?;
        let body = http::ok_body(&self.service_id, resp).await?;
        let version = self.extract(&body)?;
        if version.is_empty() {
            return Err(ArgusError::Query {
                service: self.service_id.clone(),
                reason: "deployed version lookup returned an empty version".into(),
            });
        }
        if self.semantic_versioning {
            parse_semantic(&version)?;
        }
        Ok(version)
    }

    fn service_url(&self) -> String {
        self.spec.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Header;
    use serde_json::json;

    #[test]
    fn json_path_walks_objects_and_arrays() {
        let v = json!({"data": {"versions": [{"id": "1.0.0"}, {"id": "1.1.0"}], "build": 42}});
        assert_eq!(json_path(&v, "data.versions[1].id").as_deref(), Some("1.1.0"));
        assert_eq!(json_path(&v, "data.versions.0.id").as_deref(), Some("1.0.0"));
        assert_eq!(json_path(&v, "data.build").as_deref(), Some("42"));
        assert_eq!(json_path(&v, "data.missing"), None);
        assert_eq!(json_path(&v, "data"), None);
    }

    #[tokio::test]
    async fn queries_json_with_headers() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/version")
            .match_header("x-api-key", "secret")
            .with_body(r#"{"app": {"version": "v3.2.1"}}"#)
            .create_async()
            .await;
        let spec = DeployedVersionSpec {
            url: format!("{}/api/version", server.url()),
            headers: vec![Header {
                key: "X-Api-Key".into(),
                value: "secret".into(),
            }],
            json: Some("app.version".into()),
            regex: Some(r"v?([0-9.]+)".into()),
            ..Default::default()
        };
        let lookup = WebLookup::new("app", spec, true)
            .unwrap()
            .with_retry(RetryPolicy::immediate(1));
        assert_eq!(lookup.query().await.unwrap(), "3.2.1");
    }

    #[tokio::test]
    async fn plain_body_is_trimmed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/version")
            .with_body("1.0.0\n")
            .create_async()
            .await;
        let spec = DeployedVersionSpec {
            url: format!("{}/version", server.url()),
            ..Default::default()
        };
        let lookup = WebLookup::new("app", spec, true)
            .unwrap()
            .with_retry(RetryPolicy::immediate(1));
        assert_eq!(lookup.query().await.unwrap(), "1.0.0");
    }
}
