//! Transaction overlay index
//!
//! A patch-over-base view private to one transaction. Uncommitted writes
//! land in the patch (its own [`SkipListIndex`]); reads merge the patch over
//! the base at the transaction's snapshot revision, with patch entries
//! winning on key collision. For non-main overlays, base results whose id
//! this transaction has already staged (updated or tombstoned) in its main
//! patch are filtered out.

use crate::skiplist::{Range, SkipListIndex};
use std::cmp::Ordering as KeyOrdering;
use std::sync::Arc;
use vial_core::{Entity, EntityVersion, Error, Result};

/// Patch-over-base view of one index for one transaction
pub struct OverlayIndex {
    base: Arc<SkipListIndex>,
    patch: Arc<SkipListIndex>,
    main_patch: Option<Arc<SkipListIndex>>,
}

impl OverlayIndex {
    /// Overlay `base` with a fresh private patch
    ///
    /// `main_patch` is the main overlay's patch, used by secondary overlays
    /// to hide base entries this transaction has staged over; `None` for the
    /// main overlay itself.
    pub fn new(base: Arc<SkipListIndex>, main_patch: Option<Arc<SkipListIndex>>) -> Self {
        let patch = Arc::new(SkipListIndex::new(
            base.is_unique(),
            Arc::clone(base.comparator()),
        ));
        OverlayIndex {
            base,
            patch,
            main_patch,
        }
    }

    /// The private patch index (staged writes only)
    pub fn patch(&self) -> &Arc<SkipListIndex> {
        &self.patch
    }

    /// Read through the patch, then the base at `snapshot`
    pub fn get(&self, snapshot: u64, key: &dyn Entity) -> Option<Arc<EntityVersion>> {
        if let Some(staged) = self.patch.get(0, key) {
            return Some(staged);
        }
        let committed = self.base.get(snapshot, key)?;
        if let Some(main_patch) = &self.main_patch {
            if main_patch.get(0, committed.entity().as_ref()).is_some() {
                // the transaction restaged or tombstoned this id
                return None;
            }
        }
        Some(committed)
    }

    /// Stage a write into the patch
    ///
    /// Fast-path conflict check: the key must not already be owned by a
    /// different id in last-known committed state. The authoritative check
    /// happens again at commit-graft time against the live base.
    pub fn put(
        &self,
        version: Arc<EntityVersion>,
        link: bool,
        merge: bool,
    ) -> Result<Option<Arc<EntityVersion>>> {
        if let Some(existing) = self.base.get(u64::MAX, version.entity().as_ref()) {
            if existing.id() != version.id() {
                return Err(Error::DuplicatedKey {
                    key: self.base.comparator().key_string(version.entity().as_ref()),
                });
            }
        }
        self.patch.put(version, link, merge)
    }

    /// Ordered merge of the patch and base scans
    pub fn range(
        &self,
        snapshot: u64,
        from: Option<&dyn Entity>,
        from_inclusive: bool,
        to: Option<&dyn Entity>,
        to_inclusive: bool,
    ) -> MergedRange<'_> {
        let base = self
            .base
            .range(snapshot, from, from_inclusive, to, to_inclusive);
        let patch = self
            .patch
            .range(snapshot, from, from_inclusive, to, to_inclusive);
        MergedRange::new(
            base,
            patch,
            self,
        )
    }

    /// Patches are ephemeral and discarded wholesale; nothing to collect.
    pub fn garbage_collect(&self, _floor: u64) {}
}

/// Ordered union of a base scan and a patch scan
///
/// Patch entries take precedence on equal keys; base entries shadowed by
/// the transaction's main patch are skipped.
pub struct MergedRange<'a> {
    overlay: &'a OverlayIndex,
    base: Range<'a>,
    patch: Range<'a>,
    next_base: Option<Arc<EntityVersion>>,
    next_patch: Option<Arc<EntityVersion>>,
}

impl<'a> MergedRange<'a> {
    fn new(mut base: Range<'a>, mut patch: Range<'a>, overlay: &'a OverlayIndex) -> Self {
        let next_base = base.next();
        let next_patch = patch.next();
        MergedRange {
            overlay,
            base,
            patch,
            next_base,
            next_patch,
        }
    }
}

impl Iterator for MergedRange<'_> {
    type Item = Arc<EntityVersion>;

    fn next(&mut self) -> Option<Self::Item> {
        let comparator = self.overlay.base.comparator();
        loop {
            let take_base = match (&self.next_base, &self.next_patch) {
                (None, None) => return None,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(base), Some(patch)) => {
                    comparator.compare(base.entity().as_ref(), patch.entity().as_ref())
                        == KeyOrdering::Less
                }
            };
            if take_base {
                let result = self.next_base.take();
                self.next_base = self.base.next();
                if let (Some(main_patch), Some(version)) =
                    (&self.overlay.main_patch, &result)
                {
                    if main_patch.get(0, version.entity().as_ref()).is_some() {
                        continue;
                    }
                }
                return result;
            }
            let result = self.next_patch.take();
            if let (Some(base), Some(patch)) = (&self.next_base, &result) {
                if comparator.compare(base.entity().as_ref(), patch.entity().as_ref())
                    == KeyOrdering::Equal
                {
                    // the staged entry shadows this committed one
                    self.next_base = self.base.next();
                }
            }
            self.next_patch = self.patch.next();
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use vial_core::{EntityComparator, IdComparator, Tombstone};

    #[derive(Debug, Clone)]
    struct Item {
        id: u64,
        key: String,
    }

    impl Item {
        fn new(id: u64, key: &str) -> Self {
            Item {
                id,
                key: key.to_string(),
            }
        }
    }

    impl Entity for Item {
        fn id(&self) -> u64 {
            self.id
        }
        fn set_id(&mut self, id: u64) {
            self.id = id;
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

    struct KeyComparator;

    impl EntityComparator for KeyComparator {
        fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> KeyOrdering {
            key_of(a).cmp(key_of(b))
        }
        fn key_string(&self, entity: &dyn Entity) -> String {
            format!("key:{}", key_of(entity))
        }
    }

    fn key_of(entity: &dyn Entity) -> &str {
        match entity.as_any().downcast_ref::<Item>() {
            Some(item) => &item.key,
            None => "",
        }
    }

    fn committed(id: u64, key: &str, revision: u64) -> Arc<EntityVersion> {
        let version = EntityVersion::new(Arc::new(Item::new(id, key)));
        version.set_revision(revision);
        Arc::new(version)
    }

    fn staged(id: u64, key: &str) -> Arc<EntityVersion> {
        Arc::new(EntityVersion::new(Arc::new(Item::new(id, key))))
    }

    #[test]
    fn test_patch_takes_precedence_over_base() {
        let base = Arc::new(SkipListIndex::new(true, Arc::new(KeyComparator)));
        base.put(committed(1, "a", 3), false, false).unwrap();
        let overlay = OverlayIndex::new(Arc::clone(&base), None);

        assert_eq!(overlay.get(5, &Item::new(0, "a")).unwrap().revision(), 3);
        overlay.put(staged(1, "a"), true, false).unwrap();
        assert_eq!(overlay.get(5, &Item::new(0, "a")).unwrap().revision(), 0);
    }

    #[test]
    fn test_fast_path_conflict_against_committed_state() {
        let base = Arc::new(SkipListIndex::new(true, Arc::new(KeyComparator)));
        base.put(committed(1, "a", 3), false, false).unwrap();
        let overlay = OverlayIndex::new(Arc::clone(&base), None);

        let err = overlay.put(staged(2, "a"), false, false).unwrap_err();
        assert!(matches!(err, Error::DuplicatedKey { .. }));
        // the same id restaging its own key is fine
        overlay.put(staged(1, "a"), false, false).unwrap();
    }

    #[test]
    fn test_secondary_read_hides_ids_staged_in_main_patch() {
        // base secondary index knows id 1 under key "a"
        let base = Arc::new(SkipListIndex::new(true, Arc::new(KeyComparator)));
        base.put(committed(1, "a", 3), false, false).unwrap();

        // main patch holds a tombstone for id 1 (staged delete)
        let main_base = Arc::new(SkipListIndex::new(true, Arc::new(IdComparator)));
        let main = OverlayIndex::new(Arc::clone(&main_base), None);
        main.put(
            Arc::new(EntityVersion::new(Arc::new(Tombstone::new(1)))),
            true,
            false,
        )
        .unwrap();

        let secondary = OverlayIndex::new(Arc::clone(&base), Some(Arc::clone(main.patch())));
        assert!(secondary.get(5, &Item::new(0, "a")).is_none());
        let found: Vec<_> = secondary.range(5, None, true, None, true).collect();
        assert!(found.is_empty());
    }

    #[test]
    fn test_merged_range_orders_and_dedups() {
        let base = Arc::new(SkipListIndex::new(true, Arc::new(KeyComparator)));
        base.put(committed(1, "a", 3), false, false).unwrap();
        base.put(committed(2, "c", 3), false, false).unwrap();
        let overlay = OverlayIndex::new(Arc::clone(&base), None);
        overlay.put(staged(3, "b"), false, false).unwrap();
        overlay.put(staged(2, "c"), false, false).unwrap(); // shadows the base "c"

        let keys: Vec<(String, u64)> = overlay
            .range(5, None, true, None, true)
            .map(|v| {
                (
                    key_of(v.entity().as_ref()).to_string(),
                    v.revision(),
                )
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), 3),
                ("b".to_string(), 0),
                ("c".to_string(), 0),
            ]
        );
    }
}
