//! SQLite persistence for the projected ledger state.
//!
//! - `migrations`: pool setup, pragmas, embedded schema
//! - `repo`: the `Repository` and its per-table operations

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{EventLogRow, EventRecord, Repository};
