//! Versioned record wrapper
//!
//! [`EntityVersion`] is what the indexes actually store: an immutable entity
//! payload plus the engine's revision bookkeeping. The same `Arc`'d version
//! is shared between the main index and every secondary index, so a
//! successor link established during the main-index graft is observed
//! through all of them.

use crate::entity::Entity;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One version of an entity, as stored in an index revision chain
///
/// # Revision
///
/// `0` while the version is staged in a transaction patch; set exactly once
/// to the global commit revision when the version is grafted into a base
/// index. Never changes afterwards.
///
/// # Successor
///
/// When a later version of the same id becomes visible in the main index,
/// this version's `superseded` field is set to that version's revision
/// (`0` = not superseded). Readers use it to detect "this version, though
/// revision-valid, was already superseded by snapshot time"; this is also
/// how stale secondary-index entries become invisible without an explicit
/// removal. Storing the successor's revision instead of a pointer keeps
/// version chains free of reference cycles.
pub struct EntityVersion {
    entity: Arc<dyn Entity>,
    revision: AtomicU64,
    superseded: AtomicU64,
}

impl EntityVersion {
    /// Wrap a freshly staged entity (revision 0, no successor)
    pub fn new(entity: Arc<dyn Entity>) -> Self {
        EntityVersion {
            entity,
            revision: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
        }
    }

    /// The wrapped entity payload
    pub fn entity(&self) -> &Arc<dyn Entity> {
        &self.entity
    }

    /// The entity's id
    pub fn id(&self) -> u64 {
        self.entity.id()
    }

    /// Whether this version is a logical deletion
    pub fn is_tombstone(&self) -> bool {
        self.entity.is_tombstone()
    }

    /// The commit revision of this version (0 = staged)
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Assign the commit revision
    pub fn set_revision(&self, revision: u64) {
        self.revision.store(revision, Ordering::Release);
    }

    /// The revision of the version superseding this one (0 = none)
    pub fn superseded_by(&self) -> u64 {
        self.superseded.load(Ordering::Acquire)
    }

    /// Record that this version is superseded at `revision`
    pub fn link_successor(&self, revision: u64) {
        self.superseded.store(revision, Ordering::Release);
    }

    /// Clear a successor link that references `revision`
    ///
    /// Chain repair after an unwound graft: only resets the link if it still
    /// points at the removed revision.
    pub fn unlink_successor(&self, revision: u64) {
        let _ = self.superseded.compare_exchange(
            revision,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Whether a reader fixed at `snapshot` observes this version
    ///
    /// True when the version was committed at or before the snapshot and no
    /// superseding version was committed at or before it.
    pub fn visible_at(&self, snapshot: u64) -> bool {
        if self.revision() > snapshot {
            return false;
        }
        let successor = self.superseded_by();
        successor == 0 || successor > snapshot
    }

    /// Merge this staged version with the newest committed `base` version
    ///
    /// Produces the version actually stored by a graft: the entity merge
    /// result wrapped with this version's revision. Returns `None` when the
    /// entity merge reports that the update's target no longer exists.
    pub fn merge(&self, base: Option<&EntityVersion>) -> Option<EntityVersion> {
        if self.is_tombstone() {
            // a tombstone always merges to itself
            let merged = EntityVersion::new(Arc::clone(&self.entity));
            merged.set_revision(self.revision());
            return Some(merged);
        }
        let base_entity = base.map(|b| b.entity.as_ref());
        let merged_entity = self.entity.merge(base_entity)?;
        let merged = EntityVersion::new(Arc::from(merged_entity));
        merged.set_revision(self.revision());
        Some(merged)
    }
}

impl std::fmt::Debug for EntityVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityVersion")
            .field("id", &self.id())
            .field("revision", &self.revision())
            .field("superseded", &self.superseded_by())
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Tombstone;

    fn version(id: u64, revision: u64) -> EntityVersion {
        let v = EntityVersion::new(Arc::new(Tombstone::new(id)));
        v.set_revision(revision);
        v
    }

    #[test]
    fn test_visibility_without_successor() {
        let v = version(1, 10);
        assert!(!v.visible_at(9));
        assert!(v.visible_at(10));
        assert!(v.visible_at(u64::MAX));
    }

    #[test]
    fn test_visibility_with_successor() {
        let v = version(1, 10);
        v.link_successor(20);
        assert!(v.visible_at(10));
        assert!(v.visible_at(19));
        assert!(!v.visible_at(20));
        assert!(!v.visible_at(25));
    }

    #[test]
    fn test_unlink_successor_is_conditional() {
        let v = version(1, 10);
        v.link_successor(20);
        v.unlink_successor(21); // different revision, no effect
        assert_eq!(v.superseded_by(), 20);
        v.unlink_successor(20);
        assert_eq!(v.superseded_by(), 0);
    }

    #[test]
    fn test_tombstone_merges_to_itself() {
        let v = version(5, 7);
        let merged = v.merge(None).unwrap();
        assert!(merged.is_tombstone());
        assert_eq!(merged.revision(), 7);
        assert_eq!(merged.superseded_by(), 0);
    }
}
