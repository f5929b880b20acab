use crate::error::{ArgusError, Result};
use crate::lookup::http::{self, RetryPolicy};
use crate::lookup::VersionLookup;
use crate::service::LatestVersionSpec;
use crate::types::parse_semantic;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

const GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
}

#[derive(Deserialize)]
struct Tag {
    name: String,
}

/// Releases from the last 200 response, replayed on 304.
#[derive(Default)]
struct ReleaseCache {
    etag: Option<String>,
    releases: Vec<Release>,
}

/// Latest version from a GitHub repository's releases (or tags when the
/// repository publishes none).
pub struct GithubLookup {
    service_id: String,
    spec: LatestVersionSpec,
    semantic_versioning: bool,
    client: Client,
    api_base: String,
    retry: RetryPolicy,
    cache: Mutex<ReleaseCache>,
}

impl GithubLookup {
    pub fn new(service_id: &str, spec: LatestVersionSpec, semantic_versioning: bool) -> Result<Self> {
        let client = http::build_client(spec.allow_invalid_certs.unwrap_or(false))?;
        Ok(Self {
            service_id: service_id.to_string(),
            spec,
            semantic_versioning,
            client,
            api_base: GITHUB_API.to_string(),
            retry: RetryPolicy::default(),
            cache: Mutex::new(ReleaseCache::default()),
        })
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, path: &str, etag: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(format!("{}/repos/{}/{path}", self.api_base, self.spec.url))
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.spec.access_token {
            req = req.header(AUTHORIZATION, format!("token {token}"));
        }
        if let Some(etag) = etag {
            req = req.header(IF_NONE_MATCH, etag);
        }
        req
    }

    async fn releases(&self) -> Result<Vec<Release>> {
        let mut cache = self.cache.lock().await;
        let etag = cache.etag.clone();
        let resp =
            http::send_with_retries(self.retry, || self.request("releases", etag.as_deref()))
                .await?;

        match resp.status() {
            StatusCode::NOT_MODIFIED => {
                tracing::debug!(service = %self.service_id, "releases unchanged (304)");
                return Ok(cache.releases.clone());
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                let body = resp.text().await.unwrap_or_default();
                let reason = if body.contains("rate limit") {
                    "GitHub rate limit reached".to_string()
                } else {
                    format!("access denied: {body}")
                };
                return Err(ArgusError::Query {
                    service: self.service_id.clone(),
                    reason,
                });
            }
            _ => {}
        }

        let new_etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = http::ok_body(&self.service_id, resp).await?;
        let mut releases: Vec<Release> = serde_json::from_str(&body)?;
        if releases.is_empty() {
            releases = self.tags().await?;
        }
        cache.etag = new_etag;
        cache.releases = releases.clone();
        Ok(releases)
    }

    async fn tags(&self) -> Result<Vec<Release>> {
        let resp = http::send_with_retries(self.retry, || self.request("tags", None)).await?;
        let body = http::ok_body(&self.service_id, resp).await?;
        let tags: Vec<Tag> = serde_json::from_str(&body)?;
        Ok(tags
            .into_iter()
            .map(|t| Release {
                tag_name: t.name,
                prerelease: false,
                draft: false,
                assets: Vec::new(),
            })
            .collect())
    }

    /// Candidate `(version, release)` pairs, newest first.
    fn candidates(&self, releases: Vec<Release>) -> Vec<(String, Release)> {
        let use_prerelease = self.spec.use_prerelease.unwrap_or(false);
        let mut out: Vec<(String, Release)> = releases
            .into_iter()
            .filter(|r| !r.draft && (use_prerelease || !r.prerelease))
            .filter_map(|r| match self.spec.url_commands.run(&r.tag_name) {
                Ok(v) => Some((v, r)),
                Err(e) => {
                    tracing::debug!(service = %self.service_id, tag = %r.tag_name, error = %e, "skipping tag");
                    None
                }
            })
            .collect();

        if self.semantic_versioning {
            let mut parsed: Vec<_> = out
                .into_iter()
                .filter_map(|(v, r)| parse_semantic(&v).ok().map(|sv| (sv, v, r)))
                .collect();
            parsed.sort_by(|a, b| b.0.cmp(&a.0));
            out = parsed.into_iter().map(|(_, v, r)| (v, r)).collect();
        }
        out
    }
}

#[async_trait]
impl VersionLookup for GithubLookup {
    async fn query(&self) -> Result<String> {
        let releases = self.releases().await?;
        let candidates = self.candidates(releases);
        if candidates.is_empty() {
            return Err(ArgusError::Query {
                service: self.service_id.clone(),
                reason: "no releases matched".into(),
            });
        }

        let mut last_err = None;
        for (version, release) in candidates {
            let Some(require) = &self.spec.require else {
                return Ok(version);
            };
            let checked = async {
                require.check_version(&version)?;
                require.check_content(&version, release.assets.iter().map(|a| a.name.as_str()))?;
                require.check_docker(&self.client, &version).await
            }
            .await;
            match checked {
                Ok(()) => return Ok(version),
                Err(e) => {
                    tracing::debug!(service = %self.service_id, version = %version, error = %e, "release failed require");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ArgusError::Query {
            service: self.service_id.clone(),
            reason: "no releases matched".into(),
        }))
    }

    fn service_url(&self) -> String {
        self.spec.service_url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::require::RequireSpec;
    use crate::service::LookupKind;

    const RELEASES: &str = r#"[
        {"tag_name": "v1.3.0-beta", "prerelease": true, "assets": []},
        {"tag_name": "v1.1.0", "assets": [{"name": "app-1.1.0-linux.tar.gz"}]},
        {"tag_name": "v1.2.0", "assets": [{"name": "app-1.2.0-windows.zip"}]},
        {"tag_name": "v9.9.9", "draft": true, "assets": []}
    ]"#;

    fn lookup(base: &str, spec: LatestVersionSpec) -> GithubLookup {
        GithubLookup::new("app", spec, true)
            .unwrap()
            .with_api_base(base)
            .with_retry(RetryPolicy::immediate(1))
    }

    fn spec() -> LatestVersionSpec {
        LatestVersionSpec {
            kind: LookupKind::Github,
            url: "owner/app".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn picks_highest_non_prerelease() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/owner/app/releases")
            .with_body(RELEASES)
            .create_async()
            .await;
        let lookup = lookup(&server.url(), spec());
        assert_eq!(lookup.query().await.unwrap(), "v1.2.0");
    }

    #[tokio::test]
    async fn prerelease_included_when_enabled() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/owner/app/releases")
            .with_body(RELEASES)
            .create_async()
            .await;
        let mut spec = spec();
        spec.use_prerelease = Some(true);
        let lookup = lookup(&server.url(), spec);
        assert_eq!(lookup.query().await.unwrap(), "v1.3.0-beta");
    }

    #[tokio::test]
    async fn require_content_checks_asset_names() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/owner/app/releases")
            .with_body(RELEASES)
            .create_async()
            .await;
        let mut spec = spec();
        spec.require = Some(RequireSpec {
            regex_content: Some(r"linux\.tar\.gz$".into()),
            ..Default::default()
        });
        let lookup = lookup(&server.url(), spec);
        assert_eq!(lookup.query().await.unwrap(), "v1.1.0");
    }

    #[tokio::test]
    async fn not_modified_replays_cached_releases() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/repos/owner/app/releases")
            .match_header("if-none-match", mockito::Matcher::Missing)
            .with_header("etag", "\"abc\"")
            .with_body(RELEASES)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/repos/owner/app/releases")
            .match_header("if-none-match", "\"abc\"")
            .with_status(304)
            .expect(1)
            .create_async()
            .await;
        let lookup = lookup(&server.url(), spec());
        assert_eq!(lookup.query().await.unwrap(), "v1.2.0");
        assert_eq!(lookup.query().await.unwrap(), "v1.2.0");
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/owner/app/releases")
            .with_status(403)
            .with_body(r#"{"message": "API rate limit exceeded"}"#)
            .create_async()
            .await;
        let err = lookup(&server.url(), spec()).query().await.unwrap_err();
        assert!(err.to_string().contains("rate limit"), "{err}");
    }

    #[tokio::test]
    async fn falls_back_to_tags() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/owner/app/releases")
            .with_body("[]")
            .create_async()
            .await;
        server
            .mock("GET", "/repos/owner/app/tags")
            .with_body(r#"[{"name": "v0.1.0"}, {"name": "v0.2.0"}]"#)
            .create_async()
            .await;
        assert_eq!(
            lookup(&server.url(), spec()).query().await.unwrap(),
            "v0.2.0"
        );
    }
}
