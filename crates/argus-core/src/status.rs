//! Per-service version state: latest, deployed and approved versions with
//! their timestamps, plus lookup failure counters and action results.

use crate::sinks::Cell;
use crate::types::now_timestamp;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Prefix stored in `approved_version` when a release is skipped.
pub const SKIP_PREFIX: &str = "SKIP_";

pub const COL_LATEST: &str = "latest_version";
pub const COL_LATEST_TS: &str = "latest_version_timestamp";
pub const COL_DEPLOYED: &str = "deployed_version";
pub const COL_DEPLOYED_TS: &str = "deployed_version_timestamp";
pub const COL_APPROVED: &str = "approved_version";

// ---------------------------------------------------------------------------
// VersionSnapshot
// ---------------------------------------------------------------------------

/// A point-in-time copy of the persisted version fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSnapshot {
    pub latest_version: String,
    pub latest_version_timestamp: String,
    pub deployed_version: String,
    pub deployed_version_timestamp: String,
    pub approved_version: String,
}

impl VersionSnapshot {
    /// Compare the (latest, deployed, approved) triple, ignoring timestamps.
    pub fn same_versions(&self, other: &VersionSnapshot) -> bool {
        self.latest_version == other.latest_version
            && self.deployed_version == other.deployed_version
            && self.approved_version == other.approved_version
    }

    /// Every column, for seeding a fresh database row.
    pub fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::new(COL_LATEST, &self.latest_version),
            Cell::new(COL_LATEST_TS, &self.latest_version_timestamp),
            Cell::new(COL_DEPLOYED, &self.deployed_version),
            Cell::new(COL_DEPLOYED_TS, &self.deployed_version_timestamp),
            Cell::new(COL_APPROVED, &self.approved_version),
        ]
    }

    /// Only the columns that differ from `before`.
    pub fn changed_cells(&self, before: &VersionSnapshot) -> Vec<Cell> {
        let pairs = [
            (COL_LATEST, &self.latest_version, &before.latest_version),
            (
                COL_LATEST_TS,
                &self.latest_version_timestamp,
                &before.latest_version_timestamp,
            ),
            (COL_DEPLOYED, &self.deployed_version, &before.deployed_version),
            (
                COL_DEPLOYED_TS,
                &self.deployed_version_timestamp,
                &before.deployed_version_timestamp,
            ),
            (COL_APPROVED, &self.approved_version, &before.approved_version),
        ];
        pairs
            .into_iter()
            .filter(|(_, now, then)| now != then)
            .map(|(col, now, _)| Cell::new(col, now))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Fails
// ---------------------------------------------------------------------------

/// Outcome of each action for the current latest version.
/// `None` = not attempted, `Some(true)` = failed, `Some(false)` = succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fails {
    pub notify: BTreeMap<String, Option<bool>>,
    pub webhook: BTreeMap<String, Option<bool>>,
    pub command: Vec<Option<bool>>,
}

impl Fails {
    pub fn new<'a>(
        notify_ids: impl IntoIterator<Item = &'a String>,
        webhook_ids: impl IntoIterator<Item = &'a String>,
        commands: usize,
    ) -> Self {
        Self {
            notify: notify_ids.into_iter().map(|id| (id.clone(), None)).collect(),
            webhook: webhook_ids.into_iter().map(|id| (id.clone(), None)).collect(),
            command: vec![None; commands],
        }
    }

    pub fn reset(&mut self) {
        self.notify.values_mut().for_each(|v| *v = None);
        self.webhook.values_mut().for_each(|v| *v = None);
        self.command.iter_mut().for_each(|v| *v = None);
    }

    /// Every webhook and command has run and succeeded.
    pub fn actions_passed(&self) -> bool {
        self.webhook.values().all(|v| *v == Some(false))
            && self.command.iter().all(|v| *v == Some(false))
    }
}

// ---------------------------------------------------------------------------
// VersionState
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    versions: VersionSnapshot,
    last_queried: String,
    latest_failures: u32,
    deployed_failures: u32,
    fails: Fails,
}

/// Version state for one service. Shared between the service's tracker and
/// external callers (approve/skip), so every access goes through the lock.
#[derive(Debug, Default)]
pub struct VersionState {
    inner: RwLock<Inner>,
}

impl VersionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(versions: VersionSnapshot) -> Self {
        Self {
            inner: RwLock::new(Inner {
                versions,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> VersionSnapshot {
        self.read().versions.clone()
    }

    pub fn latest_version(&self) -> String {
        self.read().versions.latest_version.clone()
    }

    pub fn deployed_version(&self) -> String {
        self.read().versions.deployed_version.clone()
    }

    pub fn approved_version(&self) -> String {
        self.read().versions.approved_version.clone()
    }

    /// Overwrite latest. Returns true when the version changed, in which case
    /// action results are reset for the new release.
    pub fn set_latest_version(&self, version: &str, timestamp: &str) -> bool {
        let mut inner = self.write();
        let changed = inner.versions.latest_version != version;
        inner.versions.latest_version = version.to_string();
        inner.versions.latest_version_timestamp = timestamp.to_string();
        if changed {
            inner.fails.reset();
        }
        changed
    }

    /// Overwrite deployed. Approval of the now-deployed version is cleared.
    pub fn set_deployed_version(&self, version: &str, timestamp: &str) -> bool {
        let mut inner = self.write();
        let changed = inner.versions.deployed_version != version;
        inner.versions.deployed_version = version.to_string();
        inner.versions.deployed_version_timestamp = timestamp.to_string();
        if inner.versions.approved_version == version {
            inner.versions.approved_version.clear();
        }
        if changed {
            inner.fails.reset();
        }
        changed
    }

    pub fn set_approved_version(&self, version: &str) -> bool {
        let mut inner = self.write();
        let changed = inner.versions.approved_version != version;
        inner.versions.approved_version = version.to_string();
        changed
    }

    /// Compare the version triples of two states. Safe to call with the same
    /// state on both sides.
    pub fn same_versions(&self, other: &VersionState) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let a = self.snapshot();
        let b = other.snapshot();
        a.same_versions(&b)
    }

    pub fn set_last_queried(&self) {
        self.write().last_queried = now_timestamp();
    }

    pub fn last_queried(&self) -> String {
        self.read().last_queried.clone()
    }

    /// Bump the latest-lookup failure counter, returning the new count.
    pub fn record_latest_failure(&self) -> u32 {
        let mut inner = self.write();
        inner.latest_failures += 1;
        inner.latest_failures
    }

    pub fn record_deployed_failure(&self) -> u32 {
        let mut inner = self.write();
        inner.deployed_failures += 1;
        inner.deployed_failures
    }

    pub fn reset_latest_failures(&self) {
        self.write().latest_failures = 0;
    }

    pub fn reset_deployed_failures(&self) {
        self.write().deployed_failures = 0;
    }

    pub fn failures(&self) -> (u32, u32) {
        let inner = self.read();
        (inner.latest_failures, inner.deployed_failures)
    }

    // ─── Action results ───────────────────────────────────────────────────

    pub fn init_fails(&self, fails: Fails) {
        self.write().fails = fails;
    }

    pub fn fails(&self) -> Fails {
        self.read().fails.clone()
    }

    pub fn set_notify_fail(&self, id: &str, failed: bool) {
        self.write().fails.notify.insert(id.to_string(), Some(failed));
    }

    pub fn set_webhook_fail(&self, id: &str, failed: bool) {
        self.write().fails.webhook.insert(id.to_string(), Some(failed));
    }

    pub fn set_command_fail(&self, index: usize, failed: bool) {
        let mut inner = self.write();
        if let Some(slot) = inner.fails.command.get_mut(index) {
            *slot = Some(failed);
        }
    }
}
