//! The entity and comparator contracts
//!
//! Every record type stored in the engine implements [`Entity`], and so
//! does every mutable staging form used to build inserts and updates. The engine
//! never inspects application fields directly; ordering and diagnostics go
//! through [`EntityComparator`], and field reconciliation goes through
//! [`Entity::merge`].

use std::any::Any;
use std::cmp::Ordering;

/// Contract implemented by stored record types and their staging forms
///
/// An entity carries a non-zero integer id, unique within its table; `0`
/// means "unassigned" and is replaced from the table's counter on first
/// insert. Version and successor bookkeeping is owned by the engine (see
/// [`crate::EntityVersion`]), not by the entity itself.
pub trait Entity: Send + Sync + 'static {
    /// The entity's id (`0` = unassigned)
    fn id(&self) -> u64;

    /// Assign the entity's id
    ///
    /// Called by the table while staging, before the value is shared.
    fn set_id(&mut self, id: u64);

    /// Whether this value marks a logical deletion
    fn is_tombstone(&self) -> bool {
        false
    }

    /// Combine this value's explicitly-set fields with `base`'s remaining
    /// fields, producing a fully-populated version
    ///
    /// `base` is the newest committed version of the same id at merge time,
    /// or `None` when no such version exists. Returning `None` means this
    /// value is an update of an entity that has since been removed and
    /// nothing should be stored. A tombstone's merge always yields itself.
    fn merge(&self, base: Option<&dyn Entity>) -> Option<Box<dyn Entity>>;

    /// Produce an independent copy safe to hand to the index
    fn clone_entity(&self) -> Box<dyn Entity>;

    /// Downcast hook for comparators and callers
    fn as_any(&self) -> &dyn Any;
}

/// Ordering and diagnostics for one index
///
/// `compare` defines the index order; `key_string` renders a stable
/// diagnostic key used only in conflict reports.
pub trait EntityComparator: Send + Sync + 'static {
    /// Order two entities by this index's key
    fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering;

    /// Stable diagnostic key for conflict messages
    fn key_string(&self, entity: &dyn Entity) -> String;
}

/// Logical-deletion marker and id-probe entity
///
/// Tombstones are staged by `remove` operations and travel through main-index
/// revision chains like any other version; they are excluded from secondary
/// indexes and filtered from visible reads. The same type doubles as the
/// probe key for by-id lookups.
#[derive(Debug, Clone, Default)]
pub struct Tombstone {
    id: u64,
}

impl Tombstone {
    /// A tombstone (or probe) for the given id
    pub fn new(id: u64) -> Self {
        Tombstone { id }
    }
}

impl Entity for Tombstone {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn is_tombstone(&self) -> bool {
        true
    }

    fn merge(&self, _base: Option<&dyn Entity>) -> Option<Box<dyn Entity>> {
        Some(Box::new(self.clone()))
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The main index comparator: orders by entity id
#[derive(Debug, Clone, Copy, Default)]
pub struct IdComparator;

impl EntityComparator for IdComparator {
    fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering {
        a.id().cmp(&b.id())
    }

    fn key_string(&self, entity: &dyn Entity) -> String {
        format!("id:{}", entity.id())
    }
}

/// Wrapper turning a non-unique comparator into a strict order
///
/// Ties under the inner comparator are broken by entity id, so a non-unique
/// index stores one slot per (key, id) pair.
pub struct IdTieBreak {
    inner: Box<dyn EntityComparator>,
}

impl IdTieBreak {
    /// Wrap `inner` with an id tie-break
    pub fn new(inner: Box<dyn EntityComparator>) -> Self {
        IdTieBreak { inner }
    }
}

impl EntityComparator for IdTieBreak {
    fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering {
        self.inner
            .compare(a, b)
            .then_with(|| a.id().cmp(&b.id()))
    }

    fn key_string(&self, entity: &dyn Entity) -> String {
        format!("id:{} {}", entity.id(), self.inner.key_string(entity))
    }
}
