//! Entity table
//!
//! Owns one main (unique, by-id) index plus the secondary indexes declared
//! at schema time, routes reads and writes through the correct base or
//! overlay index, and orchestrates commit, rollback, and GC across all of
//! them. Transaction patches are created lazily on first write and live in
//! a concurrent map keyed by transaction id.

use crate::schema::TableSpec;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use vial_core::{Entity, EntityVersion, Error, IdComparator, IdTieBreak, Result, Tombstone};
use vial_index::{OverlayIndex, SkipListIndex};

/// Index id of the implicit main by-id index.
pub const MAIN_INDEX: usize = 0;

pub(crate) struct TransactionPatch {
    overlays: Vec<OverlayIndex>,
}

impl TransactionPatch {
    fn new(indexes: &[Arc<SkipListIndex>]) -> Self {
        let mut overlays = Vec::with_capacity(indexes.len());
        let mut main_patch = None;
        for base in indexes {
            let overlay = OverlayIndex::new(Arc::clone(base), main_patch.clone());
            if main_patch.is_none() {
                main_patch = Some(Arc::clone(overlay.patch()));
            }
            overlays.push(overlay);
        }
        TransactionPatch { overlays }
    }
}

/// A typed collection of versioned entities
pub struct EntityTable {
    name: String,
    next_id: AtomicU64,
    indexes: Vec<Arc<SkipListIndex>>,
    patches: DashMap<u64, TransactionPatch>,
}

impl EntityTable {
    /// Build a table from its declaration
    pub fn from_spec(spec: TableSpec) -> Self {
        let mut indexes: Vec<Arc<SkipListIndex>> = Vec::with_capacity(spec.indexes.len() + 1);
        indexes.push(Arc::new(SkipListIndex::new(true, Arc::new(IdComparator))));
        for index in spec.indexes {
            let comparator: Arc<dyn vial_core::EntityComparator> = if index.unique {
                Arc::from(index.comparator)
            } else {
                // tie-break by id so every index is a strict order
                Arc::new(IdTieBreak::new(index.comparator))
            };
            indexes.push(Arc::new(SkipListIndex::new(index.unique, comparator)));
        }
        EntityTable {
            name: spec.name,
            next_id: AtomicU64::new(1),
            indexes,
            patches: DashMap::new(),
        }
    }

    /// The registry name of this table
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of indexes, main included
    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Allocate the next entity id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stage inserts/updates into the transaction's patch
    ///
    /// Ids are assigned from the table counter where absent. The same
    /// record lands in every overlay; only the main overlay links it over
    /// the previously staged version. Merging with committed state is
    /// deferred to commit time.
    pub fn put(&self, transaction_id: u64, updates: Vec<Box<dyn Entity>>) -> Result<()> {
        let patch = self
            .patches
            .entry(transaction_id)
            .or_insert_with(|| TransactionPatch::new(&self.indexes));
        for mut update in updates {
            if update.id() == 0 {
                update.set_id(self.next_id());
            }
            let record = Arc::new(EntityVersion::new(Arc::from(update)));
            for (i, overlay) in patch.overlays.iter().enumerate() {
                overlay.put(Arc::clone(&record), i == MAIN_INDEX, false)?;
            }
        }
        Ok(())
    }

    /// Stage tombstones for the given ids
    ///
    /// Returns whether any id was live at the snapshot, so the caller can
    /// keep a delete-of-nothing transaction read-only.
    pub fn remove(
        &self,
        transaction_id: u64,
        snapshot_revision: u64,
        ids: &[u64],
    ) -> Result<bool> {
        let patch = self
            .patches
            .entry(transaction_id)
            .or_insert_with(|| TransactionPatch::new(&self.indexes));
        let main = &patch.overlays[MAIN_INDEX];
        let mut removed = false;
        for &id in ids {
            let probe = Tombstone::new(id);
            if let Some(existing) = main.get(snapshot_revision, &probe) {
                if !existing.is_tombstone() {
                    removed = true;
                    let record = Arc::new(EntityVersion::new(Arc::new(Tombstone::new(id))));
                    main.put(record, true, false)?;
                }
            }
        }
        Ok(removed)
    }

    /// Point lookup through the transaction's overlay (or the base index
    /// when the transaction has not written to this table)
    pub fn get_by_index(
        &self,
        transaction_id: u64,
        index_id: usize,
        snapshot_revision: u64,
        key: &dyn Entity,
    ) -> Option<Arc<EntityVersion>> {
        match self.patches.get(&transaction_id) {
            Some(patch) => patch.overlays[index_id].get(snapshot_revision, key),
            None => self.indexes[index_id].get(snapshot_revision, key),
        }
    }

    /// Range scan through the transaction's overlay or the base index
    ///
    /// Tombstones are filtered. For non-unique indexes the bounds are
    /// widened with id sentinels so that inclusiveness applies to the
    /// caller's key, not the (key, id) pair.
    pub fn query_by_index(
        &self,
        transaction_id: u64,
        index_id: usize,
        snapshot_revision: u64,
        from: Option<&dyn Entity>,
        from_inclusive: bool,
        to: Option<&dyn Entity>,
        to_inclusive: bool,
    ) -> Vec<Arc<EntityVersion>> {
        let unique = self.indexes[index_id].is_unique();
        let mut from_probe = None;
        let mut to_probe = None;
        if !unique {
            if let Some(from) = from {
                let mut probe = from.clone_entity();
                probe.set_id(if from_inclusive { 0 } else { u64::MAX });
                from_probe = Some(probe);
            }
            if let Some(to) = to {
                let mut probe = to.clone_entity();
                probe.set_id(if to_inclusive { u64::MAX } else { 0 });
                to_probe = Some(probe);
            }
        }
        let from = from_probe.as_deref().or(from);
        let to = to_probe.as_deref().or(to);
        match self.patches.get(&transaction_id) {
            Some(patch) => patch.overlays[index_id]
                .range(snapshot_revision, from, from_inclusive, to, to_inclusive)
                .filter(|version| !version.is_tombstone())
                .collect(),
            None => self.indexes[index_id]
                .range(snapshot_revision, from, from_inclusive, to, to_inclusive)
                .filter(|version| !version.is_tombstone())
                .collect(),
        }
    }

    /// Graft the transaction's staged writes into the base indexes
    ///
    /// Walks the main patch in key order, stamps each staged record with
    /// the commit revision, and inserts it into the base main index linked
    /// and merged, which is the authoritative conflict point. Non-tombstone results
    /// then propagate into every secondary index. The patch is discarded on
    /// success; on conflict it stays for the caller's rollback.
    pub fn commit(&self, transaction_id: u64, revision: u64) -> Result<()> {
        let staged: Vec<Arc<EntityVersion>> = match self.patches.get(&transaction_id) {
            Some(patch) => patch.overlays[MAIN_INDEX]
                .patch()
                .range(0, None, true, None, true)
                .collect(),
            None => return Ok(()),
        };
        let main = &self.indexes[MAIN_INDEX];
        let mut grafted = Vec::with_capacity(staged.len());
        for record in staged {
            record.set_revision(revision);
            match main.put(Arc::clone(&record), true, true) {
                Ok(Some(stored)) => {
                    if !stored.is_tombstone() {
                        grafted.push(stored);
                    }
                }
                Ok(None) => {} // update of an entity that no longer exists
                Err(error) => return Err(self.named(error)),
            }
        }
        for stored in &grafted {
            for index in &self.indexes[MAIN_INDEX + 1..] {
                if let Err(error) = index.put(Arc::clone(stored), false, false) {
                    return Err(self.named(error));
                }
            }
        }
        self.patches.remove(&transaction_id);
        debug!(
            target: "vial::commit",
            transaction_id,
            revision,
            table = %self.name,
            entities = grafted.len(),
            "patch grafted"
        );
        Ok(())
    }

    /// Unwind a transaction: unlink anything it managed to graft, then drop
    /// its patch
    ///
    /// Records staged but never grafted (a conflict aborted the graft
    /// mid-way, or their merge found nothing to update) are expected to be
    /// missing from the base indexes and are skipped.
    pub fn rollback(&self, transaction_id: u64) -> Result<()> {
        if let Some(patch) = self.patches.get(&transaction_id) {
            let staged: Vec<Arc<EntityVersion>> = patch.overlays[MAIN_INDEX]
                .patch()
                .range(0, None, true, None, true)
                .collect();
            for record in staged {
                if record.revision() == 0 {
                    continue; // never reached the graft
                }
                for (i, index) in self.indexes.iter().enumerate() {
                    if i != MAIN_INDEX && record.is_tombstone() {
                        continue; // tombstones never reach secondary indexes
                    }
                    match index.remove_exact(&record) {
                        Ok(()) => {}
                        Err(Error::NotFound { key }) => {
                            debug!(
                                target: "vial::commit",
                                transaction_id,
                                table = %self.name,
                                key = %key,
                                "rollback target was never grafted"
                            );
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }
        self.patches.remove(&transaction_id);
        Ok(())
    }

    /// Drop the transaction's patch without touching base indexes
    pub fn close_transaction(&self, transaction_id: u64) {
        self.patches.remove(&transaction_id);
    }

    /// Collect superseded versions in every base index
    pub fn garbage_collect(&self, floor_revision: u64) {
        for index in &self.indexes {
            index.garbage_collect(floor_revision);
        }
    }

    fn named(&self, error: Error) -> Error {
        match error {
            Error::DuplicatedKey { key } => Error::DuplicatedKey {
                key: format!("{} {}", self.name, key),
            },
            other => other,
        }
    }
}
