//! Concurrent ordered indexes for the vialdb entity store
//!
//! Two index forms share one contract:
//! - [`SkipListIndex`]: the base storage structure, a lock-free skip list
//!   holding per-key revision chains
//! - [`OverlayIndex`]: a transaction-private patch-over-base view that
//!   isolates uncommitted writes
//!
//! All structural mutation goes through compare-and-swap; readers never
//! block. Memory reclamation uses epoch-based deferral (crossbeam-epoch).

#![warn(clippy::all)]

mod overlay;
mod skiplist;

pub use overlay::{MergedRange, OverlayIndex};
pub use skiplist::{Range, SkipListIndex};
