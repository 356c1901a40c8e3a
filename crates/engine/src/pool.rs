//! Shared worker pool
//!
//! Executes commit processing and background garbage collection. A fixed
//! core of threads stays resident; surplus threads are spawned up to the
//! configured maximum while every worker is busy and exit again after
//! idling for the keep-alive duration.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    core: usize,
    max: usize,
    keep_alive: Duration,
    total: AtomicUsize,
    idle: AtomicUsize,
}

/// A cached thread pool with named workers
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the core workers immediately
    pub fn new(core: usize, max: usize, keep_alive: Duration) -> Self {
        let core = core.max(1);
        let max = max.max(core);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            core,
            max,
            keep_alive,
            total: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        });
        let pool = WorkerPool {
            inner,
            workers: Mutex::new(Vec::with_capacity(core)),
        };
        for _ in 0..core {
            pool.spawn_worker();
        }
        pool
    }

    /// Queue a job for execution
    ///
    /// Jobs submitted after shutdown are dropped (with a warning); nothing
    /// should be committing by then.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!(target: "vial::pool", "job submitted after shutdown, dropping");
            return;
        }
        self.inner.queue.lock().push_back(Box::new(job));
        if self.inner.idle.load(Ordering::Acquire) == 0 {
            let total = self.inner.total.load(Ordering::Acquire);
            if total < self.inner.max
                && self
                    .inner
                    .total
                    .compare_exchange(total, total + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                self.spawn_surplus_worker();
            }
        }
        self.inner.work_ready.notify_one();
    }

    /// Stop accepting work, wake every worker, and join them all
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.work_ready.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&self) {
        self.inner.total.fetch_add(1, Ordering::AcqRel);
        self.spawn_named();
    }

    fn spawn_surplus_worker(&self) {
        // total was already reserved by the caller's compare-exchange
        self.spawn_named();
    }

    fn spawn_named(&self) {
        let inner = Arc::clone(&self.inner);
        let id = self.workers.lock().len();
        let handle = std::thread::Builder::new()
            .name(format!("vial-worker-{}", id))
            .spawn(move || worker_loop(&inner))
            .expect("failed to spawn worker thread");
        self.workers.lock().push(handle);
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                inner.idle.fetch_add(1, Ordering::AcqRel);
                let timed_out = inner
                    .work_ready
                    .wait_for(&mut queue, inner.keep_alive)
                    .timed_out();
                inner.idle.fetch_sub(1, Ordering::AcqRel);
                if timed_out && queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
                    // surplus workers retire after the keep-alive window
                    let total = inner.total.load(Ordering::Acquire);
                    if total > inner.core
                        && inner
                            .total
                            .compare_exchange(total, total - 1, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        return;
                    }
                }
            }
        };
        match job {
            Some(job) => job(),
            None => {
                inner.total.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }
}
