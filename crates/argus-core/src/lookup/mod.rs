//! Version lookups: where latest and deployed versions come from.
//!
//! Every source implements [`VersionLookup`]. The tracker only sees the
//! trait, so tests substitute scripted lookups for the HTTP-backed ones.

pub mod deployed;
pub mod github;
pub mod http;
pub mod require;
pub mod url;
pub mod url_command;

use crate::error::Result;
use crate::service::{DeployedVersionSpec, LatestVersionSpec, LookupKind};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait VersionLookup: Send + Sync {
    /// Fetch the current version from the source.
    async fn query(&self) -> Result<String>;

    /// Where the version comes from, for logs and templates.
    fn service_url(&self) -> String;
}

/// Build the latest-version lookup for a service.
pub fn latest_lookup(
    service_id: &str,
    spec: &LatestVersionSpec,
    semantic_versioning: bool,
) -> Result<Arc<dyn VersionLookup>> {
    Ok(match spec.kind {
        LookupKind::Github => Arc::new(github::GithubLookup::new(
            service_id,
            spec.clone(),
            semantic_versioning,
        )?),
        LookupKind::Url => Arc::new(url::UrlLookup::new(
            service_id,
            spec.clone(),
            semantic_versioning,
        )?),
    })
}

/// Build the deployed-version lookup for a service.
pub fn deployed_lookup(
    service_id: &str,
    spec: &DeployedVersionSpec,
    semantic_versioning: bool,
) -> Result<Arc<dyn VersionLookup>> {
    Ok(Arc::new(deployed::WebLookup::new(
        service_id,
        spec.clone(),
        semantic_versioning,
    )?))
}
