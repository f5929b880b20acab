//! Channels from producers (trackers, registry edits) to the single
//! database writer and config persister.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the save channel. Signals carry no payload, so a full
/// channel already guarantees a pending save.
pub const SAVE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub column: String,
    pub value: String,
}

impl Cell {
    pub fn new(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }
}

/// A unit of work for the database writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMessage {
    pub service_id: String,
    pub cells: Vec<Cell>,
    pub delete: bool,
}

impl DatabaseMessage {
    pub fn update(service_id: &str, cells: Vec<Cell>) -> Self {
        Self {
            service_id: service_id.to_string(),
            cells,
            delete: false,
        }
    }

    pub fn delete(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            cells: Vec::new(),
            delete: true,
        }
    }

    /// Move a row from `old_id` to `service_id`.
    pub fn rename(old_id: &str, service_id: &str) -> Self {
        Self::update(old_id, vec![Cell::new("id", service_id)])
    }
}

pub type DbReceiver = mpsc::UnboundedReceiver<DatabaseMessage>;
pub type SaveReceiver = mpsc::Receiver<()>;

/// Producer side of the database channel. Unbounded so that ordering is
/// preserved without blocking callers that hold locks.
#[derive(Debug, Clone)]
pub struct DbSender(mpsc::UnboundedSender<DatabaseMessage>);

impl DbSender {
    pub fn channel() -> (Self, DbReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn send(&self, msg: DatabaseMessage) {
        if self.0.send(msg).is_err() {
            tracing::debug!("database writer stopped; dropping message");
        }
    }
}

/// Producer side of the save channel.
#[derive(Debug, Clone)]
pub struct SaveSender(mpsc::Sender<()>);

impl SaveSender {
    pub fn channel() -> (Self, SaveReceiver) {
        let (tx, rx) = mpsc::channel(SAVE_CHANNEL_CAPACITY);
        (Self(tx), rx)
    }

    /// Best effort; a full channel means a save is already queued.
    pub fn signal(&self) {
        if let Err(mpsc::error::TrySendError::Closed(())) = self.0.try_send(()) {
            tracing::debug!("persister stopped; dropping save signal");
        }
    }
}

/// The sinks handed to one service. Once closed every send is a silent
/// no-op, so a deleted service's in-flight cycle cannot write.
///
/// Sends hold the gate for reading across the check and the enqueue, and
/// `close` takes it for writing, so no send that saw the sinks open can land
/// after whatever the closer enqueues next.
#[derive(Debug, Clone)]
pub struct ServiceSinks {
    db: DbSender,
    save: SaveSender,
    token: CancellationToken,
    gate: Arc<RwLock<()>>,
}

impl ServiceSinks {
    pub fn new(db: DbSender, save: SaveSender, token: CancellationToken) -> Self {
        Self {
            db,
            save,
            token,
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token once every in-progress send has been enqueued.
    pub fn close(&self) {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.token.cancel();
    }

    pub fn send_db(&self, msg: DatabaseMessage) {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            tracing::trace!(service = %msg.service_id, "sinks closed; dropping database message");
            return;
        }
        self.db.send(msg);
    }

    pub fn signal_save(&self) {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return;
        }
        self.save.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_sinks_drop_everything() {
        let (db, mut db_rx) = DbSender::channel();
        let (save, mut save_rx) = SaveSender::channel();
        let token = CancellationToken::new();
        let sinks = ServiceSinks::new(db, save, token.clone());

        sinks.send_db(DatabaseMessage::delete("a"));
        sinks.signal_save();
        assert_eq!(db_rx.recv().await, Some(DatabaseMessage::delete("a")));
        assert_eq!(save_rx.recv().await, Some(()));

        token.cancel();
        sinks.send_db(DatabaseMessage::delete("b"));
        sinks.signal_save();
        assert!(db_rx.try_recv().is_err());
        assert!(save_rx.try_recv().is_err());
    }

    #[test]
    fn nothing_lands_after_close_and_delete() {
        let (db, mut db_rx) = DbSender::channel();
        let (save, _save_rx) = SaveSender::channel();
        let sinks = ServiceSinks::new(db.clone(), save, CancellationToken::new());

        let writer = {
            let sinks = sinks.clone();
            std::thread::spawn(move || {
                while !sinks.is_closed() {
                    sinks.send_db(DatabaseMessage::update("a", vec![Cell::new("latest_version", "1")]));
                }
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(5));
        sinks.close();
        db.send(DatabaseMessage::delete("a"));
        writer.join().unwrap();

        let mut last = None;
        while let Ok(msg) = db_rx.try_recv() {
            last = Some(msg);
        }
        assert_eq!(last, Some(DatabaseMessage::delete("a")));
    }

    #[test]
    fn save_signal_never_blocks_when_full() {
        let (save, _rx) = SaveSender::channel();
        for _ in 0..(SAVE_CHANNEL_CAPACITY * 3) {
            save.signal();
        }
    }

    #[test]
    fn sending_after_receiver_dropped_is_harmless() {
        let (db, rx) = DbSender::channel();
        drop(rx);
        db.send(DatabaseMessage::delete("gone"));
    }
}
