//! Lock-free skip-list index
//!
//! The atomic unit of storage: a two-level skip list mapping a
//! comparator-defined key to a newest-first chain of entity versions.
//!
//! The base level is a singly linked, strictly ordered list of slots; each
//! slot holds the head of one key's revision chain. Index levels above are
//! probabilistic shortcuts (~1-in-4 promotion) giving expected O(log n)
//! search; correctness never depends on them, only on the base list.
//!
//! All structural mutation is compare-and-swap. Slot removal installs a
//! marker slot before unlinking so concurrent traversals detect the excision
//! and restart instead of acting on stale structure. Reclamation is
//! epoch-based: chain nodes are deferred by the thread whose CAS excised
//! them; slot shells and superseded index nodes go to a retire list freed on
//! drop, since surviving tower nodes may reference them until lazy cleanup
//! catches up.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use rand::Rng;
use std::cmp::Ordering as KeyOrdering;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vial_core::{Entity, EntityComparator, EntityVersion, Error, Result};

/// Pointer tag identifying a marker slot in the base list.
const MARKER_TAG: usize = 1;

/// Nearest-slot search accepts an exact key match.
const OP_EQUAL: u8 = 1;
/// Nearest-slot search returns the last slot strictly before the key.
const OP_LESS_THAN: u8 = 2;

/// One entry in a key's revision chain, newest first.
struct VersionNode {
    version: Arc<EntityVersion>,
    next: Atomic<VersionNode>,
    /// Claimed by whichever thread schedules this node for destruction, so
    /// a racing GC pass and chain repair cannot both defer it.
    reclaimed: AtomicBool,
}

impl VersionNode {
    fn new(version: Arc<EntityVersion>, next: Shared<'_, VersionNode>) -> Self {
        let node = VersionNode {
            version,
            next: Atomic::null(),
            reclaimed: AtomicBool::new(false),
        };
        node.next.store(next, Ordering::Relaxed);
        node
    }
}

/// A base-list slot: one key, one revision chain.
///
/// `chain` is null once the slot has been emptied, and a tagged null on
/// marker slots inserted by the unlink protocol.
struct SlotNode {
    chain: Atomic<VersionNode>,
    next: Atomic<SlotNode>,
    /// Claimed by whichever thread retires or defers this shell; stale-path
    /// traversals can bypass the same dead slot through two different
    /// predecessors, and only one of them may reclaim it.
    reclaimed: AtomicBool,
}

impl SlotNode {
    fn new() -> Self {
        SlotNode {
            chain: Atomic::null(),
            next: Atomic::null(),
            reclaimed: AtomicBool::new(false),
        }
    }

    fn claim(&self) -> bool {
        self.reclaimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Drop for SlotNode {
    fn drop(&mut self) {
        // Exclusive at this point; free whatever remains of the chain.
        let guard = unsafe { epoch::unprotected() };
        let mut node = self.chain.load(Ordering::Relaxed, guard);
        while !node.is_null() {
            let next = unsafe { node.deref() }.next.load(Ordering::Relaxed, guard);
            drop(unsafe { node.into_owned() });
            node = next;
        }
    }
}

/// An index-level shortcut node. `right` is the only field mutated after
/// publication.
struct IndexNode {
    slot: Atomic<SlotNode>,
    down: Atomic<IndexNode>,
    right: Atomic<IndexNode>,
    reclaimed: AtomicBool,
}

impl IndexNode {
    fn new() -> Self {
        IndexNode {
            slot: Atomic::null(),
            down: Atomic::null(),
            right: Atomic::null(),
            reclaimed: AtomicBool::new(false),
        }
    }

    fn claim(&self) -> bool {
        self.reclaimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

enum Retired {
    Slot(*mut SlotNode),
    Index(*mut IndexNode),
}

/// Lock-free ordered index of entity versions
///
/// `get` and `range` read a consistent view at a snapshot revision without
/// blocking; `put` inserts with CAS retries and raises the authoritative
/// uniqueness conflict; `remove_exact` and `garbage_collect` are the only
/// paths that unlink chain entries.
pub struct SkipListIndex {
    unique: bool,
    comparator: Arc<dyn EntityComparator>,
    head: Atomic<IndexNode>,
    retired: Mutex<Vec<Retired>>,
}

// Raw node pointers are only dereferenced under an epoch guard, and retired
// shells are freed exclusively on drop.
unsafe impl Send for SkipListIndex {}
unsafe impl Sync for SkipListIndex {}

impl SkipListIndex {
    /// Create an empty index ordered by `comparator`
    pub fn new(unique: bool, comparator: Arc<dyn EntityComparator>) -> Self {
        SkipListIndex {
            unique,
            comparator,
            head: Atomic::null(),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Whether this index rejects duplicate keys across distinct ids
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// The index comparator
    pub fn comparator(&self) -> &Arc<dyn EntityComparator> {
        &self.comparator
    }

    /// The newest version of `key` visible at `snapshot`
    pub fn get(&self, snapshot: u64, key: &dyn Entity) -> Option<Arc<EntityVersion>> {
        let guard = &epoch::pin();
        let mut idx = self.head.load(Ordering::Acquire, guard);
        if idx.is_null() {
            return None;
        }
        loop {
            let idx_ref = unsafe { idx.deref() };
            // advance right, cleaning dead shortcuts
            let mut advanced = false;
            let right = idx_ref.right.load(Ordering::Acquire, guard);
            if !right.is_null() {
                let right_ref = unsafe { right.deref() };
                let rslot = right_ref.slot.load(Ordering::Acquire, guard);
                match Self::slot_head(unsafe { rslot.deref() }, guard) {
                    None => {
                        let after = right_ref.right.load(Ordering::Acquire, guard);
                        if idx_ref
                            .right
                            .compare_exchange(right, after, Ordering::AcqRel, Ordering::Acquire, guard)
                            .is_ok()
                        {
                            self.retire_index(right);
                        }
                        continue;
                    }
                    Some((chain, version)) => {
                        match self.comparator.compare(key, version.entity().as_ref()) {
                            KeyOrdering::Greater => {
                                idx = right;
                                advanced = true;
                            }
                            KeyOrdering::Equal => {
                                return self.chain_snapshot(snapshot, chain, guard);
                            }
                            KeyOrdering::Less => {}
                        }
                    }
                }
            }
            if advanced {
                continue;
            }
            let down = idx_ref.down.load(Ordering::Acquire, guard);
            if !down.is_null() {
                idx = down;
                continue;
            }
            // base walk from the landing slot
            let mut slot = idx_ref.slot.load(Ordering::Acquire, guard);
            loop {
                let next = unsafe { slot.deref() }.next.load(Ordering::Acquire, guard);
                if next.is_null() {
                    return None;
                }
                let next_ref = unsafe { next.deref() };
                match Self::slot_head(next_ref, guard) {
                    None => slot = next, // removed slot or marker, step over it
                    Some((chain, version)) => {
                        match self.comparator.compare(key, version.entity().as_ref()) {
                            KeyOrdering::Equal => return self.chain_snapshot(snapshot, chain, guard),
                            KeyOrdering::Less => return None,
                            KeyOrdering::Greater => slot = next,
                        }
                    }
                }
            }
        }
    }

    /// Insert `version`, returning the version actually stored
    ///
    /// With `merge` set, the stored value is `version.merge(existing head)`;
    /// `Ok(None)` means the merge reported that the update's target no
    /// longer exists and nothing was written. With `link` set, the previous
    /// head's successor is pointed at the inserted revision.
    ///
    /// A matching key carrying a different id conflicts unless that head was
    /// fully superseded as of the inserted version's revision.
    pub fn put(
        &self,
        version: Arc<EntityVersion>,
        link: bool,
        merge: bool,
    ) -> Result<Option<Arc<EntityVersion>>> {
        let guard = &epoch::pin();
        'restart: loop {
            let head = self.head_index(guard);
            let (first_slot, levels) = self.descend(version.entity().as_ref(), head, guard);
            let mut slot = first_slot;
            'walk: loop {
                let slot_ref = unsafe { slot.deref() };
                let next = slot_ref.next.load(Ordering::Acquire, guard);
                if !next.is_null() {
                    let next_ref = unsafe { next.deref() };
                    let nchain = next_ref.chain.load(Ordering::Acquire, guard);
                    if nchain.tag() == MARKER_TAG {
                        // the slot we stand on is being excised
                        continue 'restart;
                    }
                    if nchain.is_null() {
                        self.unlink_slot(slot, next, guard);
                        continue 'walk;
                    }
                    let nver = Arc::clone(&unsafe { nchain.deref() }.version);
                    match self
                        .comparator
                        .compare(version.entity().as_ref(), nver.entity().as_ref())
                    {
                        KeyOrdering::Greater => {
                            slot = next;
                            continue 'walk;
                        }
                        KeyOrdering::Equal => {
                            if version.id() != nver.id() {
                                let successor = nver.superseded_by();
                                if successor == 0 || successor > version.revision() {
                                    return Err(Error::DuplicatedKey {
                                        key: self.comparator.key_string(version.entity().as_ref()),
                                    });
                                }
                            }
                            let stored = if merge {
                                let base = if nver.is_tombstone() {
                                    None
                                } else {
                                    Some(nver.as_ref())
                                };
                                match version.merge(base) {
                                    Some(merged) => Arc::new(merged),
                                    None => return Ok(None),
                                }
                            } else {
                                Arc::clone(&version)
                            };
                            let node = Owned::new(VersionNode::new(Arc::clone(&stored), nchain));
                            if next_ref
                                .chain
                                .compare_exchange(nchain, node, Ordering::AcqRel, Ordering::Acquire, guard)
                                .is_ok()
                            {
                                if link {
                                    nver.link_successor(stored.revision());
                                }
                                return Ok(Some(stored));
                            }
                            // the chain head moved, re-read and retry
                            continue 'walk;
                        }
                        KeyOrdering::Less => {}
                    }
                }
                // no slot holds this key yet; insert one between slot and next
                let stored = if merge {
                    match version.merge(None) {
                        Some(merged) => Arc::new(merged),
                        None => return Ok(None),
                    }
                } else {
                    Arc::clone(&version)
                };
                let chain_node = Owned::new(VersionNode::new(Arc::clone(&stored), Shared::null()));
                let new_slot = Owned::new(SlotNode::new());
                new_slot.chain.store(chain_node, Ordering::Relaxed);
                new_slot.next.store(next, Ordering::Relaxed);
                match slot_ref
                    .next
                    .compare_exchange(next, new_slot, Ordering::AcqRel, Ordering::Acquire, guard)
                {
                    Ok(inserted) => {
                        self.promote(inserted, levels, guard);
                        return Ok(Some(stored));
                    }
                    Err(_) => continue 'walk,
                }
            }
        }
    }

    /// Ordered lazy scan of versions visible at `snapshot`
    ///
    /// Finite and restartable per call; the iterator pins an epoch guard for
    /// its lifetime. Tombstone versions are yielded; callers decide.
    pub fn range(
        &self,
        snapshot: u64,
        from: Option<&dyn Entity>,
        from_inclusive: bool,
        to: Option<&dyn Entity>,
        to_inclusive: bool,
    ) -> Range<'_> {
        let guard = epoch::pin();
        let op = if from_inclusive { OP_EQUAL } else { 0 };
        let slot = self.find_nearest_slot(from, op, &guard).as_raw();
        Range {
            index: self,
            guard,
            slot,
            snapshot,
            to: to.map(|entity| entity.clone_entity()),
            to_inclusive,
        }
    }

    /// Unlink the chain entry matching `version`'s key and revision
    ///
    /// Used only by GC and chain repair (unwinding a partially applied
    /// commit). Clears the elder version's successor link if it still
    /// references the removed revision. `NotFound` means the expected entry
    /// is missing, an index consistency failure for ordinary callers.
    pub fn remove_exact(&self, version: &EntityVersion) -> Result<()> {
        let guard = &epoch::pin();
        let key = version.entity().as_ref();
        let target = version.revision();
        'restart: loop {
            let mut slot = self.find_nearest_slot(Some(key), OP_LESS_THAN, guard);
            if slot.is_null() {
                return Err(self.not_found(key));
            }
            'walk: loop {
                let slot_ref = unsafe { slot.deref() };
                let current = slot_ref.next.load(Ordering::Acquire, guard);
                if current.is_null() {
                    return Err(self.not_found(key));
                }
                let cur_ref = unsafe { current.deref() };
                let chain = cur_ref.chain.load(Ordering::Acquire, guard);
                if chain.tag() == MARKER_TAG {
                    continue 'restart;
                }
                if chain.is_null() {
                    self.unlink_slot(slot, current, guard);
                    continue 'walk;
                }
                let head_ver = Arc::clone(&unsafe { chain.deref() }.version);
                match self.comparator.compare(key, head_ver.entity().as_ref()) {
                    KeyOrdering::Greater => {
                        slot = current;
                        continue 'walk;
                    }
                    KeyOrdering::Less => return Err(self.not_found(key)),
                    KeyOrdering::Equal => {
                        return self.remove_revision(slot, current, key, target, guard);
                    }
                }
            }
        }
    }

    /// Drop every version unreachable from snapshots at or above `floor`
    ///
    /// A version V goes when `V.revision <= floor` and V is a tombstone or
    /// V's successor revision is itself at or below the floor. A chain whose
    /// newest entry dies takes its whole slot with it.
    pub fn garbage_collect(&self, floor: u64) {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return;
        }
        let mut prev_slot = unsafe { head.deref() }.slot.load(Ordering::Acquire, guard);
        loop {
            let prev_ref = unsafe { prev_slot.deref() };
            let current = prev_ref.next.load(Ordering::Acquire, guard);
            if current.is_null() {
                return;
            }
            let cur_ref = unsafe { current.deref() };
            let chain = cur_ref.chain.load(Ordering::Acquire, guard);
            if chain.is_null() && chain.tag() != MARKER_TAG {
                self.unlink_slot(prev_slot, current, guard);
                continue;
            }
            if chain.tag() != MARKER_TAG {
                self.collect_chain(prev_slot, current, chain, floor, guard);
            }
            prev_slot = current;
        }
    }

    /// GC one slot's revision chain.
    fn collect_chain(
        &self,
        prev_slot: Shared<'_, SlotNode>,
        slot: Shared<'_, SlotNode>,
        chain: Shared<'_, VersionNode>,
        floor: u64,
        guard: &Guard,
    ) {
        let slot_ref = unsafe { slot.deref() };
        let mut prev_node: Shared<'_, VersionNode> = Shared::null();
        let mut node = chain;
        while !node.is_null() {
            let node_ref = unsafe { node.deref() };
            let version = &node_ref.version;
            if version.revision() <= floor {
                let successor = version.superseded_by();
                let dead =
                    version.is_tombstone() || (successor != 0 && successor <= floor);
                if dead {
                    if prev_node.is_null() {
                        // the newest entry is dead, so the whole chain is
                        if slot_ref
                            .chain
                            .compare_exchange(
                                node,
                                Shared::null(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_ok()
                        {
                            self.defer_chain(node, guard);
                            self.unlink_slot(prev_slot, slot, guard);
                            // sweep stale shortcuts pointing at the dead slot
                            self.find_predecessor(version.entity().as_ref(), guard);
                            self.try_reduce_level(guard);
                        }
                        // lost to a concurrent insert: leave it for the next pass
                    } else {
                        let prev_ref = unsafe { prev_node.deref() };
                        if prev_ref
                            .next
                            .compare_exchange(
                                node,
                                Shared::null(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_ok()
                        {
                            self.defer_chain(node, guard);
                        }
                    }
                } else {
                    // this version stays; everything older is unreachable
                    let tail = node_ref.next.load(Ordering::Acquire, guard);
                    if !tail.is_null()
                        && node_ref
                            .next
                            .compare_exchange(
                                tail,
                                Shared::null(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_ok()
                    {
                        self.defer_chain(tail, guard);
                    }
                }
                return;
            }
            prev_node = node;
            node = node_ref.next.load(Ordering::Acquire, guard);
        }
    }

    /// Unlink the entry with revision `target` from `slot`'s chain.
    fn remove_revision(
        &self,
        prev_slot: Shared<'_, SlotNode>,
        slot: Shared<'_, SlotNode>,
        key: &dyn Entity,
        target: u64,
        guard: &Guard,
    ) -> Result<()> {
        let slot_ref = unsafe { slot.deref() };
        'retry: loop {
            let chain = slot_ref.chain.load(Ordering::Acquire, guard);
            if chain.is_null() {
                return Err(self.not_found(key));
            }
            let mut prev: Shared<'_, VersionNode> = Shared::null();
            let mut node = chain;
            loop {
                if node.is_null() {
                    return Err(self.not_found(key));
                }
                let node_ref = unsafe { node.deref() };
                let revision = node_ref.version.revision();
                if revision == target {
                    let after = node_ref.next.load(Ordering::Acquire, guard);
                    let swung = if prev.is_null() {
                        slot_ref
                            .chain
                            .compare_exchange(node, after, Ordering::AcqRel, Ordering::Acquire, guard)
                            .is_ok()
                    } else {
                        unsafe { prev.deref() }
                            .next
                            .compare_exchange(node, after, Ordering::AcqRel, Ordering::Acquire, guard)
                            .is_ok()
                    };
                    if !swung {
                        continue 'retry;
                    }
                    self.defer_version(node, guard);
                    // chain repair: the elder version must not keep pointing
                    // at a revision that no longer exists
                    if !after.is_null() {
                        unsafe { after.deref() }.version.unlink_successor(target);
                    }
                    if prev.is_null() && after.is_null() {
                        // chain emptied, excise the slot as well
                        self.unlink_slot(prev_slot, slot, guard);
                        self.find_predecessor(key, guard);
                        self.try_reduce_level(guard);
                    }
                    return Ok(());
                }
                if target > revision {
                    // chains are newest-first; the revision cannot be further down
                    return Err(self.not_found(key));
                }
                prev = node;
                node = node_ref.next.load(Ordering::Acquire, guard);
            }
        }
    }

    fn not_found(&self, key: &dyn Entity) -> Error {
        Error::NotFound {
            key: self.comparator.key_string(key),
        }
    }

    /// The newest version of a chain visible at `snapshot`, honoring
    /// successor links.
    fn chain_snapshot(
        &self,
        snapshot: u64,
        chain: Shared<'_, VersionNode>,
        guard: &Guard,
    ) -> Option<Arc<EntityVersion>> {
        let mut node = chain;
        while !node.is_null() {
            let node_ref = unsafe { node.deref() };
            let version = &node_ref.version;
            if version.revision() <= snapshot {
                let successor = version.superseded_by();
                if successor != 0 && successor <= snapshot {
                    // superseded before the snapshot; the live version (if
                    // any) sits under another key
                    return None;
                }
                return Some(Arc::clone(version));
            }
            node = node_ref.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Chain head of a slot, or `None` when the slot is dead or a marker.
    fn slot_head<'g>(
        slot: &SlotNode,
        guard: &'g Guard,
    ) -> Option<(Shared<'g, VersionNode>, Arc<EntityVersion>)> {
        let chain = slot.chain.load(Ordering::Acquire, guard);
        if chain.is_null() {
            return None;
        }
        Some((chain, Arc::clone(&unsafe { chain.deref() }.version)))
    }

    /// Load the head index node, creating the sentinel level on first use.
    fn head_index<'g>(&self, guard: &'g Guard) -> Shared<'g, IndexNode> {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            if !head.is_null() {
                return head;
            }
            let sentinel = Owned::new(SlotNode::new()).into_shared(guard);
            let node = IndexNode::new();
            node.slot.store(sentinel, Ordering::Relaxed);
            match self.head.compare_exchange(
                Shared::null(),
                Owned::new(node),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(head) => return head,
                Err(lost) => {
                    drop(lost.new);
                    drop(unsafe { sentinel.into_owned() });
                }
            }
        }
    }

    /// Descend the index to the base level, returning the landing slot and
    /// the number of levels crossed. Cleans dead shortcuts along the way.
    fn descend<'g>(
        &self,
        key: &dyn Entity,
        head: Shared<'g, IndexNode>,
        guard: &'g Guard,
    ) -> (Shared<'g, SlotNode>, usize) {
        let mut levels = 0;
        let mut idx = head;
        loop {
            let idx_ref = unsafe { idx.deref() };
            let right = idx_ref.right.load(Ordering::Acquire, guard);
            if !right.is_null() {
                let right_ref = unsafe { right.deref() };
                let rslot = right_ref.slot.load(Ordering::Acquire, guard);
                match Self::slot_head(unsafe { rslot.deref() }, guard) {
                    None => {
                        let after = right_ref.right.load(Ordering::Acquire, guard);
                        if idx_ref
                            .right
                            .compare_exchange(right, after, Ordering::AcqRel, Ordering::Acquire, guard)
                            .is_ok()
                        {
                            self.retire_index(right);
                        }
                        continue;
                    }
                    Some((_, version)) => {
                        if self.comparator.compare(key, version.entity().as_ref())
                            == KeyOrdering::Greater
                        {
                            idx = right;
                            continue;
                        }
                    }
                }
            }
            let down = idx_ref.down.load(Ordering::Acquire, guard);
            if down.is_null() {
                return (idx_ref.slot.load(Ordering::Acquire, guard), levels);
            }
            idx = down;
            levels += 1;
        }
    }

    /// Index-only descent used for lazy cleanup after removals.
    fn find_predecessor<'g>(&self, key: &dyn Entity, guard: &'g Guard) -> Shared<'g, SlotNode> {
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return Shared::null();
        }
        self.descend(key, head, guard).0
    }

    /// Locate the base slot nearest to `key` according to `op`
    ///
    /// `None` key means "start of the list". With `OP_EQUAL`, an exact match
    /// is returned; with `OP_LESS_THAN`, the last slot strictly before the
    /// key; with neither, the first slot strictly after it.
    fn find_nearest_slot<'g>(
        &self,
        key: Option<&dyn Entity>,
        op: u8,
        guard: &'g Guard,
    ) -> Shared<'g, SlotNode> {
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return Shared::null();
        }
        let key = match key {
            None => {
                let sentinel = unsafe { head.deref() }.slot.load(Ordering::Acquire, guard);
                return unsafe { sentinel.deref() }.next.load(Ordering::Acquire, guard);
            }
            Some(key) => key,
        };
        'restart: loop {
            let mut slot = self.find_predecessor(key, guard);
            if slot.is_null() {
                return Shared::null();
            }
            loop {
                let slot_ref = unsafe { slot.deref() };
                let next = slot_ref.next.load(Ordering::Acquire, guard);
                if next.is_null() {
                    let keep = op & OP_LESS_THAN != 0
                        && slot_ref.chain.load(Ordering::Acquire, guard).tag() != MARKER_TAG;
                    return if keep { slot } else { Shared::null() };
                }
                let next_ref = unsafe { next.deref() };
                let nchain = next_ref.chain.load(Ordering::Acquire, guard);
                if nchain.tag() == MARKER_TAG {
                    continue 'restart;
                }
                if nchain.is_null() {
                    self.unlink_slot(slot, next, guard);
                    continue;
                }
                let nver = Arc::clone(&unsafe { nchain.deref() }.version);
                let c = self.comparator.compare(key, nver.entity().as_ref());
                if (c == KeyOrdering::Equal && op & OP_EQUAL != 0)
                    || (c == KeyOrdering::Less && op & OP_LESS_THAN == 0)
                {
                    return next;
                }
                if c != KeyOrdering::Greater && op & OP_LESS_THAN != 0 {
                    let keep =
                        slot_ref.chain.load(Ordering::Acquire, guard).tag() != MARKER_TAG;
                    return if keep { slot } else { Shared::null() };
                }
                slot = next;
            }
        }
    }

    /// Excise a dead slot with the marker protocol
    ///
    /// A marker slot is CAS-installed after the victim so traversals that
    /// already passed `prev` observe the excision and restart; then `prev`
    /// is swung past both. The swing winner retires the shell and defers the
    /// marker.
    fn unlink_slot(
        &self,
        prev: Shared<'_, SlotNode>,
        slot: Shared<'_, SlotNode>,
        guard: &Guard,
    ) {
        let slot_ref = unsafe { slot.deref() };
        let target = loop {
            let next = slot_ref.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                let next_ref = unsafe { next.deref() };
                if next_ref.chain.load(Ordering::Acquire, guard).tag() == MARKER_TAG {
                    // already marked by another thread
                    break next_ref.next.load(Ordering::Acquire, guard);
                }
            }
            let marker = SlotNode::new();
            marker
                .chain
                .store(Shared::<VersionNode>::null().with_tag(MARKER_TAG), Ordering::Relaxed);
            marker.next.store(next, Ordering::Relaxed);
            if slot_ref
                .next
                .compare_exchange(next, Owned::new(marker), Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                break next;
            }
        };
        let prev_ref = unsafe { prev.deref() };
        if prev_ref
            .next
            .compare_exchange(slot, target, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            let marker = slot_ref.next.load(Ordering::Acquire, guard);
            self.retire_slot(slot);
            if !marker.is_null() {
                let marker_ref = unsafe { marker.deref() };
                if marker_ref.chain.load(Ordering::Acquire, guard).tag() == MARKER_TAG
                    && marker_ref.claim()
                {
                    unsafe { guard.defer_destroy(marker) };
                }
            }
        }
    }

    /// Probabilistically splice `slot` into the index levels after a base
    /// insert. `max_levels` caps the tower at one above the height observed
    /// during the insert's descent.
    fn promote(&self, slot: Shared<'_, SlotNode>, max_levels: usize, guard: &Guard) {
        let mut rng = rand::thread_rng();
        if rng.gen::<u32>() & 0x3 != 0 {
            // promote roughly a quarter of the slots
            return;
        }
        // a tower may exceed the observed height by one, which is what
        // grows the index a level
        let mut bits: u64 = rng.gen();
        let mut height = 1usize;
        while bits & 1 == 1 && height <= max_levels + 1 {
            height += 1;
            bits >>= 1;
        }
        // build the tower bottom-up, linked through `down`
        let slot_raw = slot.as_raw();
        let mut nodes: Vec<*mut IndexNode> = Vec::with_capacity(height);
        let mut below: *mut IndexNode = ptr::null_mut();
        for _ in 0..height {
            let node = Box::into_raw(Box::new(IndexNode::new()));
            unsafe {
                (*node).slot.store(Shared::from(slot_raw), Ordering::Relaxed);
                if !below.is_null() {
                    (*node)
                        .down
                        .store(Shared::from(below as *const IndexNode), Ordering::Relaxed);
                }
            }
            below = node;
            nodes.push(node);
        }
        for (i, &node) in nodes.iter().enumerate() {
            if !self.splice_level(i + 1, node, slot, guard) {
                // never published from here up; reclaim directly
                for &orphan in &nodes[i..] {
                    drop(unsafe { Box::from_raw(orphan) });
                }
                return;
            }
        }
    }

    /// Splice one tower node into level `level` (1 = lowest index level).
    /// Returns false when the splice is abandoned.
    fn splice_level(
        &self,
        level: usize,
        node: *mut IndexNode,
        slot: Shared<'_, SlotNode>,
        guard: &Guard,
    ) -> bool {
        // the key travels with the slot; if the slot dies mid-promotion, stop
        let key = match Self::slot_head(unsafe { slot.deref() }, guard) {
            Some((_, version)) => version,
            None => return false,
        };
        'retry: loop {
            let (head, height) = self.head_and_height(guard);
            if head.is_null() {
                return false;
            }
            if level > height {
                return self.try_add_level(head, node, guard);
            }
            let mut idx = head;
            let mut current_level = height;
            loop {
                let idx_ref = unsafe { idx.deref() };
                let right = idx_ref.right.load(Ordering::Acquire, guard);
                if !right.is_null() {
                    let right_ref = unsafe { right.deref() };
                    let rslot = right_ref.slot.load(Ordering::Acquire, guard);
                    match Self::slot_head(unsafe { rslot.deref() }, guard) {
                        None => {
                            let after = right_ref.right.load(Ordering::Acquire, guard);
                            if idx_ref
                                .right
                                .compare_exchange(right, after, Ordering::AcqRel, Ordering::Acquire, guard)
                                .is_ok()
                            {
                                self.retire_index(right);
                            }
                            continue;
                        }
                        Some((_, rver)) => {
                            match self
                                .comparator
                                .compare(key.entity().as_ref(), rver.entity().as_ref())
                            {
                                KeyOrdering::Greater => {
                                    idx = right;
                                    continue;
                                }
                                KeyOrdering::Equal => return false, // already present
                                KeyOrdering::Less => {}
                            }
                        }
                    }
                }
                if current_level == level {
                    unsafe { (*node).right.store(right, Ordering::Relaxed) };
                    let node_shared = Shared::from(node as *const IndexNode);
                    if idx_ref
                        .right
                        .compare_exchange(right, node_shared, Ordering::AcqRel, Ordering::Acquire, guard)
                        .is_ok()
                    {
                        return true;
                    }
                    continue 'retry;
                }
                let down = idx_ref.down.load(Ordering::Acquire, guard);
                if down.is_null() {
                    return false;
                }
                idx = down;
                current_level -= 1;
            }
        }
    }

    /// Add one level on top of the index, seeded with `node`.
    fn try_add_level(
        &self,
        head: Shared<'_, IndexNode>,
        node: *mut IndexNode,
        guard: &Guard,
    ) -> bool {
        let head_ref = unsafe { head.deref() };
        let sentinel = head_ref.slot.load(Ordering::Acquire, guard);
        unsafe { (*node).right.store(Shared::null(), Ordering::Relaxed) };
        let new_head = IndexNode::new();
        new_head.slot.store(sentinel, Ordering::Relaxed);
        new_head.down.store(head, Ordering::Relaxed);
        new_head
            .right
            .store(Shared::from(node as *const IndexNode), Ordering::Relaxed);
        self.head
            .compare_exchange(head, Owned::new(new_head), Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
    }

    fn head_and_height<'g>(&self, guard: &'g Guard) -> (Shared<'g, IndexNode>, usize) {
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return (head, 0);
        }
        let mut height = 1;
        let mut idx = head;
        loop {
            let down = unsafe { idx.deref() }.down.load(Ordering::Acquire, guard);
            if down.is_null() {
                return (head, height);
            }
            idx = down;
            height += 1;
        }
    }

    /// Drop the top index level when it has gone empty. Mirrors the classic
    /// reduce-level dance: swap the head down, undo if a racing insert
    /// repopulated the detached level.
    fn try_reduce_level(&self, guard: &Guard) {
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return;
        }
        let head_ref = unsafe { head.deref() };
        if !head_ref.right.load(Ordering::Acquire, guard).is_null() {
            return;
        }
        let down = head_ref.down.load(Ordering::Acquire, guard);
        if down.is_null() {
            return;
        }
        let down_ref = unsafe { down.deref() };
        if !down_ref.right.load(Ordering::Acquire, guard).is_null() {
            return;
        }
        let down2 = down_ref.down.load(Ordering::Acquire, guard);
        if down2.is_null() {
            return;
        }
        if !unsafe { down2.deref() }.right.load(Ordering::Acquire, guard).is_null() {
            return;
        }
        if self
            .head
            .compare_exchange(head, down, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            if !head_ref.right.load(Ordering::Acquire, guard).is_null() {
                let _ = self
                    .head
                    .compare_exchange(down, head, Ordering::AcqRel, Ordering::Acquire, guard);
            } else {
                self.retire_index(head);
            }
        }
    }

    fn defer_chain<'g>(&self, mut node: Shared<'g, VersionNode>, guard: &'g Guard) {
        while !node.is_null() {
            let next = unsafe { node.deref() }.next.load(Ordering::Acquire, guard);
            self.defer_version(node, guard);
            node = next;
        }
    }

    fn defer_version(&self, node: Shared<'_, VersionNode>, guard: &Guard) {
        let node_ref = unsafe { node.deref() };
        if node_ref
            .reclaimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            unsafe { guard.defer_destroy(node) };
        }
    }

    fn retire_slot(&self, slot: Shared<'_, SlotNode>) {
        if unsafe { slot.deref() }.claim() {
            self.retired
                .lock()
                .push(Retired::Slot(slot.as_raw() as *mut SlotNode));
        }
    }

    fn retire_index(&self, node: Shared<'_, IndexNode>) {
        if unsafe { node.deref() }.claim() {
            self.retired
                .lock()
                .push(Retired::Index(node.as_raw() as *mut IndexNode));
        }
    }
}

impl Drop for SkipListIndex {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let head = self.head.load(Ordering::Relaxed, guard);
        if !head.is_null() {
            let sentinel = unsafe { head.deref() }.slot.load(Ordering::Relaxed, guard);
            // index levels first (nodes only reference slots, never own them)
            let mut level = head;
            while !level.is_null() {
                let down = unsafe { level.deref() }.down.load(Ordering::Relaxed, guard);
                let mut node = level;
                while !node.is_null() {
                    let right = unsafe { node.deref() }.right.load(Ordering::Relaxed, guard);
                    drop(unsafe { node.into_owned() });
                    node = right;
                }
                level = down;
            }
            // then the base list, chains included
            let mut slot = sentinel;
            while !slot.is_null() {
                let next = unsafe { slot.deref() }.next.load(Ordering::Relaxed, guard);
                drop(unsafe { slot.into_owned() });
                slot = next;
            }
        }
        for retired in self.retired.get_mut().drain(..) {
            match retired {
                Retired::Slot(slot) => drop(unsafe { Box::from_raw(slot) }),
                Retired::Index(node) => drop(unsafe { Box::from_raw(node) }),
            }
        }
    }
}

/// Lazy ordered scan over a [`SkipListIndex`]
///
/// Holds an epoch guard for its lifetime; nodes observed during the walk
/// stay alive until the iterator is dropped.
pub struct Range<'a> {
    index: &'a SkipListIndex,
    guard: Guard,
    slot: *const SlotNode,
    snapshot: u64,
    to: Option<Box<dyn Entity>>,
    to_inclusive: bool,
}

impl Iterator for Range<'_> {
    type Item = Arc<EntityVersion>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.slot.is_null() {
            let shared: Shared<'_, SlotNode> = Shared::from(self.slot);
            let slot_ref = unsafe { shared.deref() };
            let chain = slot_ref.chain.load(Ordering::Acquire, &self.guard);
            self.slot = slot_ref.next.load(Ordering::Acquire, &self.guard).as_raw();
            if chain.is_null() {
                // removed slot or marker, step over it
                continue;
            }
            let version = match self.index.chain_snapshot(self.snapshot, chain, &self.guard) {
                Some(version) => version,
                None => continue,
            };
            if let Some(to) = &self.to {
                let c = self
                    .index
                    .comparator
                    .compare(version.entity().as_ref(), to.as_ref());
                let within = c == KeyOrdering::Less || (c == KeyOrdering::Equal && self.to_inclusive);
                if !within {
                    self.slot = ptr::null();
                    return None;
                }
            }
            return Some(version);
        }
        None
    }
}
