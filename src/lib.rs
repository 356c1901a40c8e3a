//! vialdb - embedded in-process MVCC entity store
//!
//! vialdb stores typed collections of identity-bearing records with
//! multi-version concurrency control: snapshot-isolated reads, optimistic
//! writes staged in per-transaction overlays, asynchronous per-table batched
//! commit, and revision-aware garbage collection of superseded versions.
//!
//! # Quick start
//!
//! ```ignore
//! use vialdb::{Database, TableSpec};
//!
//! let db = Database::new();
//! db.create_table(TableSpec::new("person")
//!     .with_index(Box::new(PersonNameComparator), true))?;
//!
//! let mut tx = db.begin();
//! tx.create_or_update("person", vec![Box::new(person)])?;
//! tx.commit()?;
//!
//! let tx = db.begin();
//! let found = tx.get_by_id("person", 1)?;
//! ```
//!
//! Application record types implement the [`Entity`] contract; index
//! orderings implement [`EntityComparator`]. Everything else (revision
//! chains, overlays, the commit pipeline) is internal to the engine crates
//! and re-exported here.

pub use vial_engine::*;
