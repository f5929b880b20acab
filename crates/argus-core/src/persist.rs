//! Debounced writes of the config file back to disk.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::sinks::SaveReceiver;

/// Something that can write the full configuration to durable storage.
pub trait ConfigStore: Send + Sync {
    fn save(&self) -> Result<()>;
}

/// Coalesces save signals and writes the config once the channel has been
/// quiet for the full debounce window.
///
/// A save still pending at shutdown is flushed before returning.
pub struct DebouncedPersister {
    store: Arc<dyn ConfigStore>,
    rx: SaveReceiver,
    debounce: Duration,
}

impl DebouncedPersister {
    pub fn new(store: Arc<dyn ConfigStore>, rx: SaveReceiver, debounce: Duration) -> Self {
        Self {
            store,
            rx,
            debounce,
        }
    }

    async fn save(&self) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.save()).await {
            Ok(Ok(())) => tracing::info!("config saved"),
            Ok(Err(e)) => tracing::error!(error = %e, "config save failed"),
            Err(e) => tracing::error!(error = %e, "config save task failed"),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut pending = false;
        let timer = tokio::time::sleep(self.debounce);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                signal = self.rx.recv() => match signal {
                    Some(()) => {
                        pending = true;
                        timer.as_mut().reset(Instant::now() + self.debounce);
                    }
                    None => break,
                },
                _ = &mut timer, if pending => {
                    pending = false;
                    self.save().await;
                }
                _ = cancel.cancelled() => break,
            }
        }

        self.rx.close();
        while self.rx.try_recv().is_ok() {
            pending = true;
        }
        if pending {
            tracing::debug!("flushing pending config save");
            self.save().await;
        }
        tracing::debug!("persister stopped");
    }
}
