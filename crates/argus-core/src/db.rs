//! SQLite mirror of each service's version state.
//!
//! # Table design
//!
//! One `status` row per service, keyed by service ID:
//! ```text
//! id | latest_version | latest_version_timestamp | deployed_version
//!    | deployed_version_timestamp | approved_version
//! ```
//!
//! In-memory state is authoritative. The database lets state survive a
//! restart, so write failures are logged and dropped rather than retried.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::error::{ArgusError, Result};
use crate::io::ensure_parent_dir;
use crate::sinks::{Cell, DatabaseMessage, DbReceiver};
use crate::status::{
    VersionSnapshot, COL_APPROVED, COL_DEPLOYED, COL_DEPLOYED_TS, COL_LATEST, COL_LATEST_TS,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS status (
    id                         TEXT NOT NULL PRIMARY KEY,
    latest_version             TEXT DEFAULT '',
    latest_version_timestamp   TEXT DEFAULT '',
    deployed_version           TEXT DEFAULT '',
    deployed_version_timestamp TEXT DEFAULT '',
    approved_version           TEXT DEFAULT ''
);";

/// Columns a message may touch. Column names are interpolated into SQL, so
/// anything else is rejected.
const COLUMNS: &[&str] = &[
    "id",
    COL_LATEST,
    COL_LATEST_TS,
    COL_DEPLOYED,
    COL_DEPLOYED_TS,
    COL_APPROVED,
];

// ---------------------------------------------------------------------------
// StatusDb
// ---------------------------------------------------------------------------

pub struct StatusDb {
    conn: Connection,
}

impl StatusDb {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn apply(&self, msg: &DatabaseMessage) -> Result<()> {
        if msg.delete {
            self.delete(&msg.service_id)
        } else {
            self.upsert(&msg.service_id, &msg.cells)
        }
    }

    /// Update the named columns of `id`, inserting the row when it is missing.
    pub fn upsert(&self, id: &str, cells: &[Cell]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }
        if let Some(bad) = cells.iter().find(|c| !COLUMNS.contains(&c.column.as_str())) {
            return Err(ArgusError::UnknownColumn(bad.column.clone()));
        }

        let assignments = cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c.column, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE status SET {assignments} WHERE id = ?{}",
            cells.len() + 1
        );
        let values = cells
            .iter()
            .map(|c| c.value.as_str())
            .chain(std::iter::once(id));
        let updated = self.conn.execute(&sql, params_from_iter(values))?;
        if updated > 0 {
            return Ok(());
        }

        // No row yet. A rename cell supplies the id itself.
        let has_id = cells.iter().any(|c| c.column == "id");
        let mut columns: Vec<&str> = cells.iter().map(|c| c.column.as_str()).collect();
        let mut values: Vec<&str> = cells.iter().map(|c| c.value.as_str()).collect();
        if !has_id {
            columns.push("id");
            values.push(id);
        }
        let placeholders = (1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO status ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM status WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<Option<VersionSnapshot>> {
        Ok(self
            .conn
            .query_row(
                "SELECT latest_version, latest_version_timestamp, deployed_version,
                        deployed_version_timestamp, approved_version
                 FROM status WHERE id = ?1",
                params![id],
                row_to_snapshot,
            )
            .optional()?)
    }

    pub fn load_statuses(&self) -> Result<HashMap<String, VersionSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, latest_version, latest_version_timestamp, deployed_version,
                    deployed_version_timestamp, approved_version
             FROM status",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            Ok((
                id,
                VersionSnapshot {
                    latest_version: text(row, 1)?,
                    latest_version_timestamp: text(row, 2)?,
                    deployed_version: text(row, 3)?,
                    deployed_version_timestamp: text(row, 4)?,
                    approved_version: text(row, 5)?,
                },
            ))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, snap) = row?;
            out.insert(id, snap);
        }
        Ok(out)
    }

    /// Delete rows for services that are no longer configured.
    pub fn remove_unknown_services(&self, known: &[String]) -> Result<usize> {
        let stored: Vec<String> = {
            let mut stmt = self.conn.prepare("SELECT id FROM status")?;
            let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;
            ids.collect::<rusqlite::Result<_>>()?
        };
        let mut removed = 0;
        for id in stored.iter().filter(|id| !known.contains(id)) {
            self.delete(id)?;
            tracing::info!(service = %id, "removed status row for unknown service");
            removed += 1;
        }
        Ok(removed)
    }
}

fn text(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionSnapshot> {
    Ok(VersionSnapshot {
        latest_version: text(row, 0)?,
        latest_version_timestamp: text(row, 1)?,
        deployed_version: text(row, 2)?,
        deployed_version_timestamp: text(row, 3)?,
        approved_version: text(row, 4)?,
    })
}

// ---------------------------------------------------------------------------
// DatabaseWriter
// ---------------------------------------------------------------------------

/// Sole owner of the database connection. Applies messages in arrival order,
/// one batch at a time, on the blocking pool.
pub struct DatabaseWriter {
    db: Arc<Mutex<StatusDb>>,
    rx: DbReceiver,
}

impl DatabaseWriter {
    pub fn new(db: StatusDb, rx: DbReceiver) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            rx,
        }
    }

    async fn apply(&self, batch: Vec<DatabaseMessage>) {
        let db = Arc::clone(&self.db);
        let applied = tokio::task::spawn_blocking(move || {
            let db = db.lock().unwrap_or_else(PoisonError::into_inner);
            for msg in &batch {
                if let Err(e) = db.apply(msg) {
                    tracing::error!(
                        service = %msg.service_id,
                        delete = msg.delete,
                        error = %e,
                        "database write failed; message dropped"
                    );
                }
            }
        })
        .await;
        if let Err(e) = applied {
            tracing::error!(error = %e, "database write task failed");
        }
    }

    /// `first` plus whatever else is already queued.
    fn batch(&mut self, first: DatabaseMessage) -> Vec<DatabaseMessage> {
        let mut batch = vec![first];
        while let Ok(msg) = self.rx.try_recv() {
            batch.push(msg);
        }
        batch
    }

    /// Run until cancelled (or every sender is gone), then apply whatever
    /// is still queued.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        let batch = self.batch(msg);
                        self.apply(batch).await;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    self.rx.close();
                    while let Some(msg) = self.rx.recv().await {
                        let batch = self.batch(msg);
                        self.apply(batch).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!("database writer stopped");
    }
}
