//! Core contracts for the vialdb entity store
//!
//! This crate defines the foundational types shared by the index and engine
//! crates:
//! - Entity: the contract application record types (and their staging forms)
//!   implement
//! - EntityComparator: ordering + diagnostic keys for indexes
//! - EntityVersion: the engine's versioned record wrapper
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entity;
pub mod error;
pub mod version;

pub use entity::{Entity, EntityComparator, IdComparator, IdTieBreak, Tombstone};
pub use error::{Error, Result};
pub use version::EntityVersion;
