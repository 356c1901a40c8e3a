//! Per-table asynchronous batched commit
//!
//! Every table gets a FIFO queue of commit requests drained by at most one
//! worker at a time, so all structural commits to one table are serialized
//! while independent tables commit in parallel. A worker applies up to the
//! configured batch quota, then either re-submits itself (queue non-empty,
//! cooperatively yielding to other tables' workers) or deregisters under the
//! registration lock so no enqueue can slip between the final check and the
//! removal.

use crate::pool::WorkerPool;
use crate::table::EntityTable;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;
use vial_core::{Error, Result};

/// Awaitable, cancellable completion of one enqueued commit
pub struct CommitHandle {
    state: Mutex<CommitState>,
    done: Condvar,
}

enum CommitState {
    Pending,
    Applying,
    Cancelled,
    Finished(Result<()>),
}

impl CommitHandle {
    fn new() -> Self {
        CommitHandle {
            state: Mutex::new(CommitState::Pending),
            done: Condvar::new(),
        }
    }

    /// Block until the commit is applied, fails, or is cancelled
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                CommitState::Pending | CommitState::Applying => self.done.wait(&mut state),
                CommitState::Cancelled => return Err(Error::CommitCancelled),
                CommitState::Finished(result) => return result.clone(),
            }
        }
    }

    /// Cancel the request if its application has not started
    ///
    /// A request already being applied (or finished) keeps its outcome.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if matches!(*state, CommitState::Pending) {
            *state = CommitState::Cancelled;
            self.done.notify_all();
        }
    }

    /// Whether the request was cancelled before application
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), CommitState::Cancelled)
    }

    /// Atomically claim the request for application
    ///
    /// This is the last cancellation point: false means the request was
    /// cancelled (or already resolved) and must not be applied.
    fn begin_apply(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, CommitState::Pending) {
            *state = CommitState::Applying;
            true
        } else {
            false
        }
    }

    fn complete(&self, result: Result<()>) {
        let mut state = self.state.lock();
        if matches!(*state, CommitState::Pending | CommitState::Applying) {
            *state = CommitState::Finished(result);
            self.done.notify_all();
        }
    }
}

struct CommitRequest {
    transaction_id: u64,
    revision: u64,
    handle: Arc<CommitHandle>,
}

#[derive(Default)]
struct CommitQueue {
    requests: Mutex<VecDeque<CommitRequest>>,
}

struct CommitterInner {
    pool: Arc<WorkerPool>,
    commit_batch_size: usize,
    queues: Mutex<HashMap<String, Arc<CommitQueue>>>,
}

/// Fans table commits out to per-table single-drainer workers
pub struct TransactionCommitter {
    inner: Arc<CommitterInner>,
}

impl TransactionCommitter {
    /// Create a committer backed by `pool`
    pub fn new(pool: Arc<WorkerPool>, commit_batch_size: usize) -> Self {
        TransactionCommitter {
            inner: Arc::new(CommitterInner {
                pool,
                commit_batch_size: commit_batch_size.max(1),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueue a commit for one table, starting a drainer if none is active
    pub fn commit(
        &self,
        table: Arc<EntityTable>,
        transaction_id: u64,
        revision: u64,
    ) -> Arc<CommitHandle> {
        debug!(
            target: "vial::commit",
            transaction_id,
            revision,
            table = table.name(),
            "commit enqueued"
        );
        let handle = Arc::new(CommitHandle::new());
        let request = CommitRequest {
            transaction_id,
            revision,
            handle: Arc::clone(&handle),
        };
        let mut queues = self.inner.queues.lock();
        match queues.get(table.name()) {
            Some(queue) => {
                queue.requests.lock().push_back(request);
            }
            None => {
                let queue = Arc::new(CommitQueue::default());
                queue.requests.lock().push_back(request);
                queues.insert(table.name().to_string(), Arc::clone(&queue));
                CommitterInner::schedule(Arc::clone(&self.inner), table, queue);
            }
        }
        handle
    }
}

impl CommitterInner {
    fn schedule(inner: Arc<CommitterInner>, table: Arc<EntityTable>, queue: Arc<CommitQueue>) {
        let pool = Arc::clone(&inner.pool);
        pool.submit(move || CommitterInner::process(inner, table, queue));
    }

    fn process(inner: Arc<CommitterInner>, table: Arc<EntityTable>, queue: Arc<CommitQueue>) {
        for _ in 0..inner.commit_batch_size {
            let request = match queue.requests.lock().pop_front() {
                Some(request) => request,
                None => {
                    // recheck under the registration lock so a racing
                    // enqueue either lands before deregistration or spawns
                    // its own drainer afterwards
                    let mut queues = inner.queues.lock();
                    match queue.requests.lock().pop_front() {
                        Some(request) => request,
                        None => {
                            queues.remove(table.name());
                            return;
                        }
                    }
                }
            };
            if !request.handle.begin_apply() {
                debug!(
                    target: "vial::commit",
                    transaction_id = request.transaction_id,
                    table = table.name(),
                    "commit cancelled, skipping"
                );
                continue;
            }
            let result = table.commit(request.transaction_id, request.revision);
            if let Err(error) = &result {
                debug!(
                    target: "vial::commit",
                    transaction_id = request.transaction_id,
                    table = table.name(),
                    %error,
                    "table commit failed"
                );
            } else {
                debug!(
                    target: "vial::commit",
                    transaction_id = request.transaction_id,
                    table = table.name(),
                    "table committed"
                );
            }
            request.handle.complete(result);
        }
        // batch quota exhausted: yield the worker and requeue ourselves
        CommitterInner::schedule(inner, table, queue);
    }
}
