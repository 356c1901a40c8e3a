//! vialdb engine
//!
//! The transactional layer over the concurrent indexes: entity tables with
//! per-transaction write overlays, the asynchronous per-table commit
//! pipeline, and the coordinator that orders revisions and drives garbage
//! collection.

#![warn(clippy::all)]

mod committer;
mod config;
mod database;
mod pool;
mod schema;
mod store;
mod table;
mod transaction;

pub use committer::{CommitHandle, TransactionCommitter};
pub use config::{Config, ConfigBuilder};
pub use database::Database;
pub use pool::WorkerPool;
pub use schema::{IndexSpec, TableSpec};
pub use store::EntityStore;
pub use table::{EntityTable, MAIN_INDEX};
pub use transaction::{Transaction, TransactionStatus};

// the core contracts travel with the engine API
pub use vial_core::{
    Entity, EntityComparator, EntityVersion, Error, IdComparator, IdTieBreak, Result, Tombstone,
};
