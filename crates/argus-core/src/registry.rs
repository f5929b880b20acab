//! The ordered set of tracked services.
//!
//! `order` and the ID → service map live behind one lock so readers never
//! see them disagree. Structural edits (add, rename, delete) fan out to the
//! database writer and the config persister.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ArgusError, Result};
use crate::persist::ConfigStore;
use crate::service::ServiceConfig;
use crate::sinks::{DatabaseMessage, DbSender, SaveSender, ServiceSinks};
use crate::status::{VersionSnapshot, VersionState};
use crate::tracked::TrackedService;
use crate::tracker;

/// Gap between the first queries of consecutive services at startup.
pub const START_STAGGER: Duration = Duration::from_millis(500);

struct Entry {
    config: ServiceConfig,
    tracked: Arc<TrackedService>,
}

#[derive(Default)]
struct Inner {
    order: Vec<String>,
    services: HashMap<String, Entry>,
}

pub struct ServiceRegistry {
    inner: RwLock<Inner>,
    /// Everything but the services, for rebuilding trackers and saving.
    base: Config,
    db: DbSender,
    save: SaveSender,
    token: CancellationToken,
    config_path: Option<PathBuf>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub fn new(
        config: &Config,
        db: DbSender,
        save: SaveSender,
        token: CancellationToken,
        config_path: Option<PathBuf>,
    ) -> Self {
        let base = Config {
            order: Vec::new(),
            service: HashMap::new(),
            ..config.clone()
        };
        Self {
            inner: RwLock::new(Inner::default()),
            base,
            db,
            save,
            token,
            config_path,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self, id: &str, config: ServiceConfig, state: VersionState) -> Result<TrackedService> {
        let sinks = ServiceSinks::new(
            self.db.clone(),
            self.save.clone(),
            self.token.child_token(),
        );
        TrackedService::from_config(
            id,
            config,
            &self.base.defaults.service,
            &self.base.notify,
            &self.base.webhook,
            Arc::new(state),
            sinks,
        )
    }

    pub(crate) fn spawn_tracker(&self, tracked: Arc<TrackedService>, initial_delay: Duration) {
        let handle = tokio::spawn(tracker::run(tracked, initial_delay));
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Populate from a freshly loaded config, seeding each service's state
    /// from `statuses`. Emits nothing and starts no trackers.
    pub fn load_services(
        &self,
        config: &Config,
        statuses: &HashMap<String, VersionSnapshot>,
    ) -> Result<()> {
        let mut built = Vec::with_capacity(config.order.len());
        for id in &config.order {
            let Some(svc) = config.service.get(id) else {
                continue;
            };
            let state = statuses
                .get(id)
                .cloned()
                .map(VersionState::from_snapshot)
                .unwrap_or_default();
            let tracked = self.build(id, svc.clone(), state)?;
            built.push((id.clone(), svc.clone(), Arc::new(tracked)));
        }

        let mut inner = self.write();
        for (id, config, tracked) in built {
            inner.order.push(id.clone());
            inner.services.insert(id, Entry { config, tracked });
        }
        Ok(())
    }

    /// Start one tracker per service, staggered so they don't all query at
    /// once.
    pub fn start_tracking(&self) {
        let services: Vec<Arc<TrackedService>> = {
            let inner = self.read();
            inner
                .order
                .iter()
                .filter_map(|id| inner.services.get(id))
                .map(|e| Arc::clone(&e.tracked))
                .collect()
        };
        tracing::info!(services = services.len(), "tracking services");
        for (i, tracked) in services.into_iter().enumerate() {
            self.spawn_tracker(tracked, START_STAGGER * i as u32);
        }
    }

    /// Add a service, replace one in place, or rename `old_id` to `id`.
    ///
    /// `status` overrides the version state; when `None` the replaced
    /// service's state carries over. Rejected edits change nothing.
    pub fn add_service(
        &self,
        old_id: Option<&str>,
        id: &str,
        config: ServiceConfig,
        status: Option<VersionSnapshot>,
    ) -> Result<()> {
        let replacing = old_id.unwrap_or(id);
        let renaming = replacing != id;

        let mut inner = self.write();
        if renaming && inner.services.contains_key(id) {
            return Err(ArgusError::ServiceExists(id.to_string()));
        }
        let name = config.display_name(id);
        if let Some((existing, _)) = inner
            .services
            .iter()
            .find(|(other, e)| other.as_str() != replacing && e.config.display_name(other) == name)
        {
            return Err(ArgusError::DuplicateName {
                name: name.to_string(),
                existing: existing.clone(),
            });
        }

        let previous = inner.services.get(replacing);
        let before = previous
            .map(|p| p.tracked.state().snapshot())
            .unwrap_or_default();
        let after = status.unwrap_or_else(|| before.clone());
        let versions_changed = !after.same_versions(&before);
        let config_changed = renaming || previous.map_or(true, |p| p.config != config);
        let moved_row = renaming && previous.is_some();

        let tracked = Arc::new(self.build(id, config.clone(), VersionState::from_snapshot(after.clone()))?);

        if let Some(old) = inner.services.remove(replacing) {
            old.tracked.sinks().close();
        }
        match inner.order.iter().position(|o| o == replacing) {
            Some(pos) => inner.order[pos] = id.to_string(),
            None => inner.order.push(id.to_string()),
        }
        inner.services.insert(
            id.to_string(),
            Entry {
                config,
                tracked: Arc::clone(&tracked),
            },
        );

        if moved_row {
            self.db.send(DatabaseMessage::rename(replacing, id));
        }
        if versions_changed {
            self.db.send(DatabaseMessage::update(id, after.cells()));
        }
        drop(inner);

        if config_changed {
            self.save.signal();
        }
        tracing::info!(service = %id, renamed_from = ?old_id.filter(|_| renaming), "service added");
        self.spawn_tracker(tracked, Duration::ZERO);
        Ok(())
    }

    /// Remove a service. Returns false (and emits nothing) when `id` is
    /// unknown.
    pub fn delete_service(&self, id: &str) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner.services.get(id) else {
            return false;
        };
        // Close the tracker's sinks before it leaves the map.
        entry.tracked.sinks().close();
        inner.services.remove(id);
        inner.order.retain(|o| o != id);
        drop(inner);

        self.db.send(DatabaseMessage::delete(id));
        self.save.signal();
        tracing::info!(service = %id, "service deleted");
        true
    }

    pub fn order(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrackedService>> {
        self.read().services.get(id).map(|e| Arc::clone(&e.tracked))
    }

    pub fn status(&self, id: &str) -> Option<VersionSnapshot> {
        self.get(id).map(|t| t.state().snapshot())
    }

    pub async fn approve(&self, id: &str, version: &str) -> Result<()> {
        let tracked = self
            .get(id)
            .ok_or_else(|| ArgusError::ServiceNotFound(id.to_string()))?;
        tracked.approve(version).await
    }

    pub fn skip(&self, id: &str, version: &str) -> Result<()> {
        self.get(id)
            .ok_or_else(|| ArgusError::ServiceNotFound(id.to_string()))?
            .skip(version)
    }

    /// The full config as it should be saved.
    pub fn config(&self) -> Config {
        let inner = self.read();
        Config {
            order: inner.order.clone(),
            service: inner
                .services
                .iter()
                .map(|(id, e)| (id.clone(), e.config.clone()))
                .collect(),
            ..self.base.clone()
        }
    }

    /// Handles of every tracker started so far.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ConfigStore for ServiceRegistry {
    fn save(&self) -> Result<()> {
        match &self.config_path {
            Some(path) => self.config().save(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{LatestVersionSpec, LookupKind, ServiceOptions};
    use crate::sinks::{DbReceiver, SaveReceiver};
    use crate::status::COL_LATEST;
    use tempfile::TempDir;

    struct Harness {
        registry: ServiceRegistry,
        db_rx: DbReceiver,
        save_rx: SaveReceiver,
    }

    impl Harness {
        fn new(config_path: Option<PathBuf>) -> Self {
            let (db, db_rx) = DbSender::channel();
            let (save, save_rx) = SaveSender::channel();
            let registry = ServiceRegistry::new(
                &Config::default(),
                db,
                save,
                CancellationToken::new(),
                config_path,
            );
            Self {
                registry,
                db_rx,
                save_rx,
            }
        }

        fn db_messages(&mut self) -> Vec<DatabaseMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.db_rx.try_recv() {
                out.push(msg);
            }
            out
        }

        fn saves(&mut self) -> usize {
            let mut n = 0;
            while self.save_rx.try_recv().is_ok() {
                n += 1;
            }
            n
        }
    }

    /// Inactive, so the spawned tracker never queries.
    fn service(name: Option<&str>) -> ServiceConfig {
        ServiceConfig {
            name: name.map(str::to_string),
            options: ServiceOptions {
                active: Some(false),
                ..Default::default()
            },
            latest_version: LatestVersionSpec {
                kind: LookupKind::Url,
                url: "http://127.0.0.1:9/version".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn seeded(h: &mut Harness, ids: &[&str]) {
        for id in ids {
            h.registry.add_service(None, id, service(None), None).unwrap();
        }
        h.db_messages();
        h.saves();
    }

    #[tokio::test]
    async fn add_appends_and_signals_save() {
        let mut h = Harness::new(None);
        h.registry.add_service(None, "a", service(None), None).unwrap();
        h.registry.add_service(None, "b", service(Some("Bee")), None).unwrap();
        assert_eq!(h.registry.order(), vec!["a", "b"]);
        assert_eq!(h.saves(), 2);
        // Empty state on both sides; nothing to write.
        assert!(h.db_messages().is_empty());
    }

    #[tokio::test]
    async fn duplicate_display_name_is_rejected_without_change() {
        let mut h = Harness::new(None);
        h.registry.add_service(None, "a", service(Some("Shared")), None).unwrap();
        h.saves();

        let err = h
            .registry
            .add_service(None, "b", service(Some("Shared")), None)
            .unwrap_err();
        assert!(matches!(err, ArgusError::DuplicateName { .. }));
        // "a" is displayed as "Shared", so the name "a" is still free.
        h.registry.add_service(None, "c", service(Some("a")), None).unwrap();

        let err = h
            .registry
            .add_service(None, "d", service(Some("a")), None)
            .unwrap_err();
        match err {
            ArgusError::DuplicateName { existing, .. } => assert_eq!(existing, "c"),
            other => panic!("unexpected {other}"),
        }

        assert_eq!(h.registry.order(), vec!["a", "c"]);
        assert!(h.registry.get("b").is_none());
        assert!(h.registry.get("d").is_none());
        assert_eq!(h.saves(), 1);
        assert!(h.db_messages().is_empty());
    }

    #[tokio::test]
    async fn replacing_keeps_own_name() {
        let mut h = Harness::new(None);
        h.registry.add_service(None, "a", service(Some("Same")), None).unwrap();
        h.saves();
        h.registry.add_service(Some("a"), "a", service(Some("Same")), None).unwrap();
        // Identical config: no save.
        assert_eq!(h.saves(), 0);
        assert_eq!(h.registry.order(), vec!["a"]);
    }

    #[tokio::test]
    async fn rename_moves_in_place() {
        let mut h = Harness::new(None);
        seeded(&mut h, &["a", "b", "c"]);
        let old = h.registry.get("b").unwrap();

        h.registry.add_service(Some("b"), "bee", service(None), None).unwrap();
        assert_eq!(h.registry.order(), vec!["a", "bee", "c"]);
        assert!(h.registry.get("b").is_none());
        assert!(old.sinks().is_closed());
        assert_eq!(h.db_messages(), vec![DatabaseMessage::rename("b", "bee")]);
        assert_eq!(h.saves(), 1);
    }

    #[tokio::test]
    async fn rename_onto_existing_id_is_rejected() {
        let mut h = Harness::new(None);
        seeded(&mut h, &["a", "b"]);
        let err = h
            .registry
            .add_service(Some("a"), "b", service(None), None)
            .unwrap_err();
        assert!(matches!(err, ArgusError::ServiceExists(_)));
        assert_eq!(h.registry.order(), vec!["a", "b"]);
        assert!(h.db_messages().is_empty());
        assert_eq!(h.saves(), 0);
    }

    #[tokio::test]
    async fn changed_status_is_written() {
        let mut h = Harness::new(None);
        seeded(&mut h, &["a"]);
        let status = VersionSnapshot {
            latest_version: "2.0.0".into(),
            latest_version_timestamp: "2024-01-01T00:00:00Z".into(),
            ..Default::default()
        };
        h.registry
            .add_service(Some("a"), "a", service(None), Some(status))
            .unwrap();
        let msgs = h.db_messages();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0]
            .cells
            .iter()
            .any(|c| c.column == COL_LATEST && c.value == "2.0.0"));
        assert_eq!(h.registry.status("a").unwrap().latest_version, "2.0.0");
    }

    #[tokio::test]
    async fn delete_unknown_is_a_no_op() {
        let mut h = Harness::new(None);
        seeded(&mut h, &["a"]);
        assert!(!h.registry.delete_service("nope"));
        assert_eq!(h.registry.order(), vec!["a"]);
        assert!(h.registry.get("a").is_some());
        assert!(h.db_messages().is_empty());
        assert_eq!(h.saves(), 0);
    }

    #[tokio::test]
    async fn delete_removes_and_signals() {
        let mut h = Harness::new(None);
        seeded(&mut h, &["a", "b"]);
        assert!(h.registry.delete_service("a"));
        assert_eq!(h.registry.order(), vec!["b"]);
        assert!(h.registry.get("a").is_none());
        assert_eq!(h.db_messages(), vec![DatabaseMessage::delete("a")]);
        assert_eq!(h.saves(), 1);
    }

    #[tokio::test]
    async fn delete_mid_cycle_drops_the_trackers_writes() {
        let mut h = Harness::new(None);
        seeded(&mut h, &["a"]);
        let tracked = h.registry.get("a").unwrap();

        assert!(h.registry.delete_service("a"));
        assert_eq!(h.db_messages(), vec![DatabaseMessage::delete("a")]);

        // The cycle that was in flight finishes against closed sinks.
        assert!(tracked.handle_latest("9.9.9").is_ok());
        assert!(!tracker::poll_once(&tracked).await);
        assert!(h.db_messages().is_empty());
        assert_eq!(h.saves(), 1);
    }

    #[tokio::test]
    async fn approve_and_skip_unknown_service() {
        let h = Harness::new(None);
        assert!(matches!(
            h.registry.approve("x", "1.0.0").await,
            Err(ArgusError::ServiceNotFound(_))
        ));
        assert!(matches!(
            h.registry.skip("x", "1.0.0"),
            Err(ArgusError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_services_seeds_state_quietly() {
        let mut h = Harness::new(None);
        let config = Config::from_yaml(
            "service:\n  b:\n    latest_version: {url: o/b}\n  a:\n    latest_version: {url: o/a}\n",
        )
        .unwrap();
        let statuses = HashMap::from([(
            "a".to_string(),
            VersionSnapshot {
                latest_version: "1.0.0".into(),
                ..Default::default()
            },
        )]);
        h.registry.load_services(&config, &statuses).unwrap();
        assert_eq!(h.registry.order(), vec!["b", "a"]);
        assert_eq!(h.registry.status("a").unwrap().latest_version, "1.0.0");
        assert_eq!(h.registry.status("b").unwrap().latest_version, "");
        assert!(h.db_messages().is_empty());
        assert_eq!(h.saves(), 0);
    }

    #[tokio::test]
    async fn save_writes_config_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        let mut h = Harness::new(Some(path.clone()));
        seeded(&mut h, &["zeta", "alpha"]);

        h.registry.save().unwrap();
        let saved = Config::load(&path).unwrap();
        assert_eq!(saved.order, vec!["zeta", "alpha"]);
        assert_eq!(saved.service["alpha"], service(None));
    }
}
