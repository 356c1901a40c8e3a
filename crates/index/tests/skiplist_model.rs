//! Model-based checks: the skip list against a reference BTreeMap
//!
//! Sequential histories only; every committed write supersedes the previous
//! version of its key, so the newest-visible rule must agree with a plain
//! ordered map replayed to the same point.

use proptest::prelude::*;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use vial_core::{Entity, EntityComparator, EntityVersion};
use vial_index::SkipListIndex;

#[derive(Debug, Clone)]
struct Item {
    id: u64,
    key: String,
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
    fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering {
        key_of(a).cmp(key_of(b))
    }
    fn key_string(&self, entity: &dyn Entity) -> String {
        format!("key:{}", key_of(entity))
    }
}

fn key_of(entity: &dyn Entity) -> &str {
    &entity.as_any().downcast_ref::<Item>().unwrap().key
}

fn observed(index: &SkipListIndex, snapshot: u64) -> Vec<(String, u64)> {
    index
        .range(snapshot, None, true, None, true)
        .map(|v| (key_of(v.entity().as_ref()).to_string(), v.revision()))
        .collect()
}

proptest! {
    #[test]
    fn replay_matches_reference_map(writes in prop::collection::vec(0u8..40, 1..120)) {
        let index = SkipListIndex::new(true, Arc::new(KeyComparator));
        let mut model: BTreeMap<String, u64> = BTreeMap::new();
        let mut midpoint_model: Option<(u64, BTreeMap<String, u64>)> = None;
        let midpoint = writes.len() / 2;

        let mut revision = 0u64;
        for (i, key) in writes.iter().enumerate() {
            revision += 1;
            let key = format!("k{:03}", key);
            let id = u64::from(*key.as_bytes().last().unwrap()) + 1;
            let version = EntityVersion::new(Arc::new(Item { id, key: key.clone() }));
            version.set_revision(revision);
            index.put(Arc::new(version), true, false).unwrap();
            model.insert(key, revision);
            if i + 1 == midpoint {
                midpoint_model = Some((revision, model.clone()));
            }
        }

        // the latest snapshot sees exactly the reference map
        let expected: Vec<(String, u64)> =
            model.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(observed(&index, revision), expected);

        // an older snapshot still sees the state as of that revision
        if let Some((snapshot, model_then)) = midpoint_model {
            let expected_then: Vec<(String, u64)> =
                model_then.iter().map(|(k, v)| (k.clone(), *v)).collect();
            prop_assert_eq!(observed(&index, snapshot), expected_then);
        }

        // collecting at the latest revision leaves one version per key
        index.garbage_collect(revision);
        let expected_after_gc: Vec<(String, u64)> =
            model.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(observed(&index, revision), expected_after_gc);
    }
}
