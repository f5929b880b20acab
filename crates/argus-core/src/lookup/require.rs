use crate::error::{ArgusError, Result};
use crate::lookup::http::{self, RetryPolicy};
use crate::types::TemplateVars;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Extra conditions a candidate release must meet before it becomes latest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequireSpec {
    /// The version string itself must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_version: Option<String>,
    /// The response body (or a GitHub release's asset names) must match.
    /// `{{ version }}` is substituted first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerRegistry {
    #[default]
    Hub,
    Ghcr,
    Quay,
}

/// The image tag for a release must exist on a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerSpec {
    #[serde(rename = "type", default)]
    pub registry: DockerRegistry,
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Replaces the registry's API origin.
    #[serde(skip)]
    pub base_url: Option<String>,
}

fn default_tag() -> String {
    "{{ version }}".into()
}

fn version_vars(version: &str) -> TemplateVars {
    TemplateVars {
        version: version.to_string(),
        ..Default::default()
    }
}

impl RequireSpec {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (field, re) in [
            ("regex_version", &self.regex_version),
            ("regex_content", &self.regex_content),
        ] {
            if let Some(re) = re {
                if let Err(e) = Regex::new(re) {
                    problems.push(format!("{field}: {re:?} <invalid> ({e})"));
                }
            }
        }
        if let Some(docker) = &self.docker {
            problems.extend(docker.validate().into_iter().map(|p| format!("docker.{p}")));
        }
        problems
    }

    pub fn check_version(&self, version: &str) -> Result<()> {
        let Some(re) = &self.regex_version else {
            return Ok(());
        };
        if Regex::new(re)?.is_match(version) {
            Ok(())
        } else {
            Err(ArgusError::NoMatch {
                kind: format!("regex_version on {version:?}"),
                pattern: re.clone(),
            })
        }
    }

    /// Check `regex_content` against each of `haystacks`; any match passes.
    pub fn check_content<'a>(
        &self,
        version: &str,
        haystacks: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let Some(re) = &self.regex_content else {
            return Ok(());
        };
        let pattern = version_vars(version).render(re);
        let re = Regex::new(&pattern)?;
        if haystacks.into_iter().any(|h| re.is_match(h)) {
            Ok(())
        } else {
            Err(ArgusError::NoMatch {
                kind: "regex_content".into(),
                pattern,
            })
        }
    }

    pub async fn check_docker(&self, client: &Client, version: &str) -> Result<()> {
        match &self.docker {
            Some(docker) => docker.check_tag(client, version).await,
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Docker tag checks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

impl DockerSpec {
    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let image_re = Regex::new(r"^[\w\-./]+$").ok();
        if self.image.is_empty() {
            problems.push("image: <required>".to_string());
        } else if image_re.is_some_and(|re| !re.is_match(&self.image)) {
            problems.push(format!("image: {:?} <invalid>", self.image));
        }
        if self.tag.is_empty() {
            problems.push("tag: <required>".to_string());
        }
        if self.registry == DockerRegistry::Hub && self.username.is_some() != self.token.is_some()
        {
            problems.push("hub needs both username and token, or neither".to_string());
        }
        problems
    }

    /// Docker Hub's official images live under `library/`.
    fn image(&self) -> String {
        if self.registry == DockerRegistry::Hub && !self.image.contains('/') {
            format!("library/{}", self.image)
        } else {
            self.image.clone()
        }
    }

    fn tag_url(&self, tag: &str) -> String {
        let image = self.image();
        match self.registry {
            DockerRegistry::Hub => format!(
                "{}/v2/repositories/{image}/tags/{tag}",
                self.base_url
                    .as_deref()
                    .unwrap_or("https://registry.hub.docker.com")
            ),
            DockerRegistry::Ghcr => format!(
                "{}/v2/{image}/manifests/{tag}",
                self.base_url.as_deref().unwrap_or("https://ghcr.io")
            ),
            DockerRegistry::Quay => format!(
                "{}/api/v1/repository/{image}/tag/?onlyActiveTags=true&specificTag={tag}",
                self.base_url.as_deref().unwrap_or("https://quay.io")
            ),
        }
    }

    async fn query_token(&self, client: &Client) -> Result<Option<String>> {
        let image = self.image();
        match self.registry {
            DockerRegistry::Hub => {
                let (Some(user), Some(token)) = (&self.username, &self.token) else {
                    return Ok(None);
                };
                let url = format!(
                    "{}/token?service=registry.docker.io&scope=repository:{image}:pull",
                    self.base_url.as_deref().unwrap_or("https://auth.docker.io")
                );
                let resp = client.get(url).basic_auth(user, Some(token)).send().await?;
                let body = http::ok_body(&image, resp).await?;
                Ok(Some(serde_json::from_str::<TokenResponse>(&body)?.token))
            }
            DockerRegistry::Ghcr => {
                if let Some(token) = &self.token {
                    return Ok(Some(token.clone()));
                }
                let url = format!(
                    "{}/token?scope=repository:{image}:pull",
                    self.base_url.as_deref().unwrap_or("https://ghcr.io")
                );
                let resp = client.get(url).send().await?;
                let body = http::ok_body(&image, resp).await?;
                Ok(Some(serde_json::from_str::<TokenResponse>(&body)?.token))
            }
            DockerRegistry::Quay => Ok(self.token.clone()),
        }
    }

    pub async fn check_tag(&self, client: &Client, version: &str) -> Result<()> {
        let tag = version_vars(version).render(&self.tag);
        let token = self.query_token(client).await?;
        let url = self.tag_url(&tag);
        let resp = http::send_with_retries(RetryPolicy::default(), || {
            let req = client.get(&url);
            match &token {
                Some(t) => req.bearer_auth(t),
                None => req,
            }
        })
        .await?;
        let status = resp.status();
        let body = resp.text().await?;
        let missing = !status.is_success()
            || (self.registry == DockerRegistry::Quay && body.contains(r#""tags": []"#));
        if missing {
            return Err(ArgusError::Query {
                service: format!("{}:{tag}", self.image),
                reason: "tag not found".into(),
            });
        }
        Ok(())
    }
}
