//! Release tracking core: per-service version lookups, the version state
//! machine, and the persistence pipeline (SQLite status rows plus debounced
//! config saves) shared by every tracker.

pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod io;
pub mod lookup;
pub mod notify;
pub mod persist;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod settings;
pub mod sinks;
pub mod status;
pub mod tracked;
pub mod tracker;
pub mod types;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ArgusError, Result};
