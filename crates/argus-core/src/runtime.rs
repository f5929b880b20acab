//! Wires the registry, database writer and config persister together and
//! owns their tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{DatabaseWriter, StatusDb};
use crate::error::{ArgusError, Result};
use crate::persist::DebouncedPersister;
use crate::registry::ServiceRegistry;
use crate::sinks::{DbSender, SaveSender};

pub struct Argus {
    registry: Arc<ServiceRegistry>,
    token: CancellationToken,
    writer: JoinHandle<()>,
    persister: JoinHandle<()>,
}

impl Argus {
    /// Open the database, seed service state from it and start every
    /// background task. Must be called inside a tokio runtime.
    ///
    /// Config saves go to `config_path`; `None` keeps edits in memory.
    pub fn start(
        config: Config,
        config_path: Option<PathBuf>,
        token: CancellationToken,
    ) -> Result<Self> {
        let db_path = config.settings.database_file();
        let db = StatusDb::open(&db_path)?;
        let removed = db.remove_unknown_services(&config.order)?;
        let statuses = db.load_statuses()?;
        tracing::info!(
            database = %db_path.display(),
            rows = statuses.len(),
            removed,
            "database opened"
        );

        let (db_tx, db_rx) = DbSender::channel();
        let (save_tx, save_rx) = SaveSender::channel();
        let registry = Arc::new(ServiceRegistry::new(
            &config,
            db_tx,
            save_tx,
            token.clone(),
            config_path,
        ));
        registry.load_services(&config, &statuses)?;

        let writer = tokio::spawn(DatabaseWriter::new(db, db_rx).run(token.clone()));
        let persister = tokio::spawn(
            DebouncedPersister::new(registry.clone(), save_rx, config.settings.save_debounce()?)
                .run(token.clone()),
        );
        registry.start_tracking();

        Ok(Self {
            registry,
            token,
            writer,
            persister,
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Cancel everything and wait up to `timeout` for the trackers, the
    /// persister (which flushes a pending save) and the database writer
    /// (which drains its queue) to finish.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        tracing::info!("shutting down");
        self.token.cancel();

        let trackers = self.registry.take_tasks();
        let writer = self.writer;
        let persister = self.persister;
        let all = async move {
            join_all(trackers).await;
            if let Err(e) = persister.await {
                tracing::error!(error = %e, "persister task failed");
            }
            if let Err(e) = writer.await {
                tracing::error!(error = %e, "database writer task failed");
            }
        };
        tokio::time::timeout(timeout, all)
            .await
            .map_err(|_| ArgusError::ShutdownTimeout(timeout))?;
        tracing::info!("shutdown complete");
        Ok(())
    }
}
