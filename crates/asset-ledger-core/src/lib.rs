//! Asset ledger: content-addressed registration of ML assets and traintuple
//! lifecycle tracking on top of an injected key-value ledger.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod index;
pub mod ledger;
pub mod model;
pub mod permission;
pub mod query;
pub mod registry;
pub mod traintuple;

#[cfg(test)]
mod fixtures;

pub use config::LedgerConfig;
pub use dispatch::{invoke, invoke_atomic, Function};
pub use error::LedgerError;
pub use index::{expected_index_entries, reconstruct_indexes, IndexDiff, IndexEntry};
pub use ledger::{Ledger, MemoryLedger, Transactional};
pub use model::{
    Algo, Challenge, Data, Dataset, ElementType, HashDress, LedgerRecord, Role, Status,
    Traintuple,
};
