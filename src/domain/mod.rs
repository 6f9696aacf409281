//! Domain types for the copy-trading ledger indexer.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper, with fixed-point conversions
//! - Domain primitives: TimeMs, Address, TxHash, LeaderId, Direction
//! - The closed set of ledger events and their chain metadata
//! - Store records for leaders, followers, positions and settlements

pub mod decimal;
pub mod event;
pub mod primitives;
pub mod records;

pub use decimal::{AmountError, Decimal};
pub use event::{DecodedLog, EventFamily, LedgerEvent, LogMeta, SignalAction};
pub use primitives::{Address, AddressParseError, Direction, LeaderId, TimeMs, TxHash};
pub use records::{
    Follower, Leader, NewPosition, NewSettlement, Position, SettlementEntry, SettlementStatus,
};
