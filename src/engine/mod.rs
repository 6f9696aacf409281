//! Pure computation for mirror sizing and settlement.
//!
//! Nothing here touches the store or the ledger.

pub mod allocation;
pub mod settlement;

pub use allocation::{allocate_mirror_sizes, AllocationError, MirrorAllocation};
pub use settlement::{compute_pnl, quote_settlement, SettlementQuote};
