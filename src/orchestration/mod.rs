//! Event processing pipeline: guard, projection, settlement and the
//! long-running watcher tasks that feed them.

pub mod guard;
pub mod indexer;
pub mod projector;
pub mod settler;

pub use guard::IdempotencyGuard;
pub use indexer::{Indexer, IndexerError, IndexerSettings, RescanReport};
pub use projector::{ProcessOutcome, ProjectionError, Projector};
pub use settler::{SettlementError, SettlementReport, Settler};
