//! The per-service polling loop.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ArgusError;
use crate::tracked::TrackedService;

/// Poll `service` until its cancellation token fires: wait `initial_delay`,
/// then query latest (and deployed, when configured) every interval.
///
/// Lookup errors are logged and counted; they never stop the loop. Returns
/// once any auto-approved actions it started have finished.
pub async fn run(service: Arc<TrackedService>, initial_delay: Duration) {
    poll_until_cancelled(&service, initial_delay).await;
    service.wait_for_actions().await;
    tracing::debug!(service = %service.id(), "tracking stopped");
}

async fn poll_until_cancelled(service: &Arc<TrackedService>, initial_delay: Duration) {
    let token = service.sinks().token().clone();
    tokio::select! {
        _ = tokio::time::sleep(initial_delay) => {}
        _ = token.cancelled() => return,
    }
    tracing::debug!(service = %service.id(), "tracking started");

    loop {
        if service.options().active && !poll_once(service).await {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(service.options().interval) => {}
            _ = token.cancelled() => return,
        }
    }
}

/// One query cycle. Returns false when cancelled mid-cycle.
pub async fn poll_once(service: &Arc<TrackedService>) -> bool {
    let token = service.sinks().token().clone();
    let state = service.state();
    state.set_last_queried();

    let old_version = state.latest_version();
    let latest = tokio::select! {
        r = service.lookups().latest.query() => r,
        _ = token.cancelled() => return false,
    };
    match latest.and_then(|v| service.handle_latest(&v)) {
        Ok(true) => {
            state.reset_latest_failures();
            service.handle_update_actions(&old_version).await;
        }
        Ok(false) => state.reset_latest_failures(),
        Err(e @ ArgusError::VersionRegression { .. }) => {
            let failures = state.record_latest_failure();
            tracing::warn!(service = %service.id(), failures, "{e}");
        }
        Err(e) => {
            let failures = state.record_latest_failure();
            tracing::warn!(service = %service.id(), failures, error = %e, "latest version query failed");
        }
    }

    if let Some(deployed) = &service.lookups().deployed {
        let result = tokio::select! {
            r = deployed.query() => r,
            _ = token.cancelled() => return false,
        };
        match result.and_then(|v| service.handle_deployed(&v)) {
            Ok(_) => state.reset_deployed_failures(),
            Err(e) => {
                let failures = state.record_deployed_failure();
                tracing::warn!(service = %service.id(), failures, error = %e, "deployed version query failed");
            }
        }
    }
    !token.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{EventKind, Notifier};
    use crate::service::{ResolvedOptions, ServiceConfig};
    use crate::status::{VersionSnapshot, VersionState, COL_LATEST};
    use crate::testing::{Channels, RecordingNotifier, ScriptedLookup};
    use crate::tracked::{Actions, Lookups};
    use crate::lookup::VersionLookup;

    fn tracked(
        channels: &Channels,
        latest: Arc<ScriptedLookup>,
        deployed: Option<Arc<ScriptedLookup>>,
        notifier: Arc<RecordingNotifier>,
    ) -> Arc<TrackedService> {
        let state = VersionState::from_snapshot(VersionSnapshot {
            latest_version: "1.0.0".into(),
            deployed_version: "1.0.0".into(),
            ..Default::default()
        });
        Arc::new(TrackedService::new(
            "app",
            ServiceConfig::default(),
            ResolvedOptions {
                active: true,
                interval: Duration::from_secs(60),
                semantic_versioning: true,
                auto_approve: false,
            },
            Arc::new(state),
            channels.sinks.clone(),
            Lookups {
                latest,
                deployed: deployed.map(|d| d as Arc<dyn VersionLookup>),
            },
            Actions {
                notifiers: vec![notifier as Arc<dyn Notifier>],
                ..Default::default()
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn regression_is_rejected_then_newer_release_lands() {
        let mut channels = Channels::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let latest = ScriptedLookup::versions(&["0.9.0", "1.2.0"]);
        let service = tracked(&channels, latest, None, notifier.clone());

        assert!(poll_once(&service).await);
        assert_eq!(service.state().latest_version(), "1.0.0");
        assert_eq!(service.state().failures(), (1, 0));
        assert!(channels.drain_db().is_empty());
        assert!(notifier.events().is_empty());

        assert!(poll_once(&service).await);
        assert_eq!(service.state().latest_version(), "1.2.0");
        assert_eq!(service.state().failures(), (0, 0));
        let msgs = channels.drain_db();
        assert!(msgs
            .iter()
            .flat_map(|m| &m.cells)
            .any(|c| c.column == COL_LATEST && c.value == "1.2.0"));
        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::NewRelease);
        assert_eq!(events[0].vars.old_version, "1.0.0");
        assert!(!service.state().last_queried().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_query_is_counted_and_loop_continues() {
        let channels = Channels::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let latest = ScriptedLookup::new(&[Err("boom"), Err("boom"), Ok("1.1.0")]);
        let deployed = ScriptedLookup::new(&[Err("down")]);
        let service = tracked(&channels, latest, Some(deployed), notifier);

        assert!(poll_once(&service).await);
        assert!(poll_once(&service).await);
        assert_eq!(service.state().failures(), (2, 2));
        assert!(poll_once(&service).await);
        assert_eq!(service.state().failures(), (0, 3));
        assert_eq!(service.state().latest_version(), "1.1.0");
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_on_interval_until_cancelled() {
        let mut channels = Channels::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let latest = ScriptedLookup::versions(&["1.0.0", "1.1.0", "1.2.0"]);
        let service = tracked(&channels, latest, None, notifier.clone());

        let handle = tokio::spawn(run(service.clone(), Duration::from_millis(500)));
        // initial delay + first poll, then two intervals
        tokio::time::sleep(Duration::from_millis(500 + 60_000 * 2 + 100)).await;
        assert_eq!(service.state().latest_version(), "1.2.0");
        assert_eq!(notifier.events().len(), 2);

        channels.token.cancel();
        handle.await.unwrap();
        channels.drain_db();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_cycle_drops_writes() {
        let mut channels = Channels::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let latest = ScriptedLookup::versions(&["2.0.0"]);
        let service = tracked(&channels, latest, None, notifier);

        channels.token.cancel();
        assert!(!poll_once(&service).await);
        // A cancelled run returns without polling.
        run(service.clone(), Duration::ZERO).await;
        assert!(channels.drain_db().is_empty());
        assert_eq!(channels.drain_saves(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_waits_for_auto_approved_actions() {
        let channels = Channels::new();
        let state = Arc::new(VersionState::from_snapshot(VersionSnapshot {
            latest_version: "1.0.0".into(),
            deployed_version: "1.0.0".into(),
            ..Default::default()
        }));
        let service = Arc::new(TrackedService::new(
            "auto",
            ServiceConfig::default(),
            ResolvedOptions {
                active: true,
                interval: Duration::from_secs(60),
                semantic_versioning: true,
                auto_approve: true,
            },
            state.clone(),
            channels.sinks.clone(),
            Lookups {
                latest: ScriptedLookup::versions(&["1.1.0"]),
                deployed: None,
            },
            Actions {
                commands: vec![vec!["sh".into(), "-c".into(), "sleep 0.2".into()]],
                ..Default::default()
            },
        ));

        assert!(poll_once(&service).await);
        assert_eq!(state.approved_version(), "1.1.0");
        assert_eq!(state.deployed_version(), "1.0.0");

        channels.token.cancel();
        run(service, Duration::ZERO).await;
        assert_eq!(state.deployed_version(), "1.1.0");
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_service_is_not_queried() {
        let channels = Channels::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let latest = ScriptedLookup::versions(&["3.0.0"]);
        let state = Arc::new(VersionState::new());
        let service = Arc::new(TrackedService::new(
            "idle",
            ServiceConfig::default(),
            ResolvedOptions {
                active: false,
                interval: Duration::from_secs(1),
                semantic_versioning: true,
                auto_approve: false,
            },
            state.clone(),
            channels.sinks.clone(),
            Lookups {
                latest,
                deployed: None,
            },
            Actions {
                notifiers: vec![notifier as Arc<dyn Notifier>],
                ..Default::default()
            },
        ));
        let handle = tokio::spawn(run(service, Duration::ZERO));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(state.latest_version(), "");
        channels.token.cancel();
        handle.await.unwrap();
    }
}
