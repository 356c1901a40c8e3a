//! Engine coordinator
//!
//! Issues transaction ids and revisions, fans commits out to every table's
//! committer, advances the globally visible revision once all tables have
//! applied a commit, and schedules background garbage collection bounded by
//! the oldest snapshot still held by a live transaction.
//!
//! The only coordinator locks protect revision/id issuance and the active
//! transaction set; both critical sections are pure bookkeeping.

use crate::committer::TransactionCommitter;
use crate::config::Config;
use crate::pool::WorkerPool;
use crate::schema::TableSpec;
use crate::store::EntityStore;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use vial_core::{Error, Result};

struct CoordinatorState {
    next_transaction_id: u64,
    next_revision: u64,
    visible_revision: u64,
    /// transaction id -> snapshot revision, for the GC floor
    active: HashMap<u64, u64>,
    gc_running: bool,
}

pub(crate) struct DatabaseInner {
    pub(crate) store: EntityStore,
    pool: Arc<WorkerPool>,
    committer: TransactionCommitter,
    state: Mutex<CoordinatorState>,
}

/// The embedded entity store engine
///
/// One value owns the worker pool, the table registry, and the revision
/// counters. Independent instances are fully isolated.
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Create an engine with default configuration
    pub fn new() -> Self {
        Database::with_config(Config::default())
    }

    /// Create an engine with the given configuration
    pub fn with_config(config: Config) -> Self {
        let pool = Arc::new(WorkerPool::new(
            config.core_pool_size,
            config.max_pool_size,
            config.keep_alive,
        ));
        let committer = TransactionCommitter::new(Arc::clone(&pool), config.commit_batch_size);
        Database {
            inner: Arc::new(DatabaseInner {
                store: EntityStore::new(),
                pool,
                committer,
                state: Mutex::new(CoordinatorState {
                    next_transaction_id: 1,
                    next_revision: 1,
                    visible_revision: 0,
                    active: HashMap::new(),
                    gc_running: false,
                }),
            }),
        }
    }

    /// Register a table
    pub fn create_table(&self, spec: TableSpec) -> Result<()> {
        self.inner.store.create_table(spec)?;
        Ok(())
    }

    /// Open a transaction fixed at the currently visible revision
    pub fn begin(&self) -> Transaction {
        let mut state = self.inner.state.lock();
        let id = state.next_transaction_id;
        state.next_transaction_id += 1;
        let snapshot = state.visible_revision;
        state.active.insert(id, snapshot);
        debug!(target: "vial::txn", transaction_id = id, snapshot, "transaction started");
        Transaction::new(Arc::clone(&self.inner), id, snapshot)
    }

    /// The revision visible to transactions started now
    pub fn visible_revision(&self) -> u64 {
        self.inner.state.lock().visible_revision
    }

    /// Drain and join the worker pool
    ///
    /// Callers must not have commits in flight.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}

impl DatabaseInner {
    /// Assign a revision, fan the commit out to every table, await all.
    pub(crate) fn commit_transaction(inner: &Arc<Self>, transaction_id: u64) -> Result<()> {
        let tables = inner.store.tables();
        let mut handles = Vec::with_capacity(tables.len());
        let revision;
        {
            // revision issuance and fan-out are one critical section so
            // revisions reach each table's queue in issuance order
            let mut state = inner.state.lock();
            revision = state.next_revision;
            state.next_revision += 1;
            for table in &tables {
                handles.push(
                    inner
                        .committer
                        .commit(Arc::clone(table), transaction_id, revision),
                );
            }
        }
        let mut failure = None;
        for handle in &handles {
            if let Err(error) = handle.wait() {
                failure = Some(error);
                break;
            }
        }
        if let Some(error) = failure {
            for handle in &handles {
                handle.cancel();
            }
            // a request already being applied keeps running; drain them all
            // so the caller's unwind cannot race an in-flight graft
            for handle in &handles {
                let _ = handle.wait();
            }
            return Err(Error::CommitFailed {
                id: transaction_id,
                source: Box::new(error),
            });
        }
        let mut state = inner.state.lock();
        if state.visible_revision < revision {
            state.visible_revision = revision;
            debug!(target: "vial::txn", transaction_id, revision, "revision visible");
            if !state.gc_running {
                state.gc_running = true;
                let worker = Arc::clone(inner);
                inner.pool.submit(move || DatabaseInner::run_gc(worker));
            }
        }
        Ok(())
    }

    /// Remove a transaction from the active set (commit and rollback both
    /// end here); the GC floor is derived from whoever remains.
    pub(crate) fn close_transaction(&self, transaction_id: u64) {
        {
            let mut state = self.state.lock();
            state.active.remove(&transaction_id);
        }
        // sweep leftover patches (a staged-nothing remove leaves an empty
        // one behind; committed and rolled-back tables already cleaned up)
        for table in self.store.tables() {
            table.close_transaction(transaction_id);
        }
    }

    /// GC worker: loop until the floor stops moving
    ///
    /// The floor is the minimum snapshot revision among live transactions,
    /// falling back to the visible revision when none are open. Bounding by
    /// the latest committed revision instead would collect versions that a
    /// slower, already-open reader can still observe.
    fn run_gc(inner: Arc<DatabaseInner>) {
        let mut last = None;
        loop {
            let floor = {
                let mut state = inner.state.lock();
                let floor = state
                    .active
                    .values()
                    .copied()
                    .min()
                    .unwrap_or(state.visible_revision);
                if last == Some(floor) {
                    state.gc_running = false;
                    return;
                }
                floor
            };
            last = Some(floor);
            debug!(target: "vial::gc", floor, "garbage collection pass");
            inner.store.garbage_collect(floor);
        }
    }
}
