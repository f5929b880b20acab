use crate::error::Result;
use crate::lookup::http::{self, RetryPolicy};
use crate::lookup::VersionLookup;
use crate::service::LatestVersionSpec;
use crate::types::parse_semantic;
use async_trait::async_trait;
use reqwest::Client;

/// Latest version scraped from an arbitrary URL via `url_commands`.
pub struct UrlLookup {
    service_id: String,
    spec: LatestVersionSpec,
    semantic_versioning: bool,
    client: Client,
    retry: RetryPolicy,
}

impl UrlLookup {
    pub fn new(service_id: &str, spec: LatestVersionSpec, semantic_versioning: bool) -> Result<Self> {
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
}

#[async_trait]
impl VersionLookup for UrlLookup {
    async fn query(&self) -> Result<String> {
        let resp = http::send_with_retries(self.retry, || self.client.get(&self.spec.url)).await?;
        let body = http::ok_body(&self.service_id, resp).await?;
        let version = self.spec.url_commands.run(&body)?;
        if self.semantic_versioning {
            parse_semantic(&version)?;
        }
        if let Some(require) = &self.spec.require {
            require.check_version(&version)?;
            require.check_content(&version, [body.as_str()])?;
            require.check_docker(&self.client, &version).await?;
        }
        Ok(version)
    }

    fn service_url(&self) -> String {
        self.spec.service_url()
    }
}
