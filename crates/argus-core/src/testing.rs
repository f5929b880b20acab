//! Scripted collaborators shared by the tracker and registry tests.

use crate::error::{ArgusError, Result};
use crate::lookup::VersionLookup;
use crate::notify::{Notifier, VersionEvent};
use crate::sinks::{DatabaseMessage, DbReceiver, DbSender, SaveReceiver, SaveSender, ServiceSinks};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Returns queued results in order, repeating the last one when exhausted.
pub struct ScriptedLookup {
    results: Mutex<VecDeque<std::result::Result<String, String>>>,
    last: Mutex<Option<std::result::Result<String, String>>>,
}

impl ScriptedLookup {
    pub fn new(results: &[std::result::Result<&str, &str>]) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(
                results
                    .iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            last: Mutex::new(None),
        })
    }

    pub fn versions(versions: &[&str]) -> Arc<Self> {
        let results: Vec<_> = versions.iter().map(|v| Ok(*v)).collect();
        Self::new(&results)
    }

    pub fn push(&self, result: std::result::Result<&str, &str>) {
        self.results
            .lock()
            .unwrap()
            .push_back(result.map(str::to_string).map_err(str::to_string));
    }
}

#[async_trait]
impl VersionLookup for ScriptedLookup {
    async fn query(&self) -> Result<String> {
        let next = self.results.lock().unwrap().pop_front();
        let result = match next {
            Some(r) => {
                *self.last.lock().unwrap() = Some(r.clone());
                r
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("no scripted result".into())),
        };
        result.map_err(|reason| ArgusError::Query {
            service: "scripted".into(),
            reason,
        })
    }

    fn service_url(&self) -> String {
        "https://example.com/scripted".into()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<VersionEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<VersionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn id(&self) -> &str {
        "recorder"
    }

    async fn send(&self, event: &VersionEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Never finishes a send. `entered` flips once a send has started.
#[derive(Default)]
pub struct StalledNotifier {
    entered: AtomicBool,
}

impl StalledNotifier {
    pub fn entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for StalledNotifier {
    fn id(&self) -> &str {
        "stalled"
    }

    async fn send(&self, _event: &VersionEvent) -> Result<()> {
        self.entered.store(true, Ordering::SeqCst);
        std::future::pending::<Result<()>>().await
    }
}

pub struct Channels {
    pub sinks: ServiceSinks,
    pub db_rx: DbReceiver,
    pub save_rx: SaveReceiver,
    pub token: CancellationToken,
}

impl Channels {
    pub fn new() -> Self {
        let (db, db_rx) = DbSender::channel();
        let (save, save_rx) = SaveSender::channel();
        let token = CancellationToken::new();
        Self {
            sinks: ServiceSinks::new(db, save, token.clone()),
            db_rx,
            save_rx,
            token,
        }
    }

    pub fn drain_db(&mut self) -> Vec<DatabaseMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.db_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    pub fn drain_saves(&mut self) -> usize {
        let mut n = 0;
        while self.save_rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}
