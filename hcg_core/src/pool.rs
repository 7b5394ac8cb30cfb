use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{HcgError, Result};

/// A unit of work. Ownership moves to whichever worker runs it.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Called on the worker thread when a task fails, with the worker's name.
pub type ErrorHook = Arc<dyn Fn(&str, &TaskFailure) + Send + Sync>;

/// How a task failed.
#[derive(Debug)]
pub enum TaskFailure {
    Error(anyhow::Error),
    Panic(String),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Error(e) => write!(f, "task failed: {:#}", e),
            TaskFailure::Panic(msg) => write!(f, "task panicked: {}", msg),
        }
    }
}

/// Admission policy when every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sizing {
    /// At most `size` workers; `assign` blocks until one returns.
    Fixed,
    /// Spawn a new worker instead of blocking. Workers returning to an idle
    /// set that already holds `size` workers exit.
    Growable,
}

pub fn default_pool_size() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

enum Message {
    Run(Task),
    Stop,
}

/// An idle worker, addressed through its private channel.
struct Idle {
    id: usize,
    tx: Sender<Message>,
}

struct Shared {
    name: String,
    size: usize,
    sizing: Sizing,
    running: AtomicBool,
    idle: Mutex<VecDeque<Idle>>,
    returned: Condvar,
    live: AtomicUsize,
    next_id: AtomicUsize,
    hook: ErrorHook,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Put a worker back into the idle set. Returns false when the worker
    /// should exit instead.
    fn check_in(&self, worker: Idle) -> bool {
        let mut idle = self.idle.lock();
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        if self.sizing == Sizing::Growable && idle.len() >= self.size {
            return false;
        }
        idle.push_back(worker);
        self.returned.notify_one();
        true
    }

    fn report(&self, worker: &str, failure: &TaskFailure) {
        let hook = Arc::clone(&self.hook);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook(worker, failure)));
        if outcome.is_err() {
            error!(worker = %worker, "pool error hook panicked while reporting: {}", failure);
        }
    }
}

/// Builder for [`WorkerPool`].
pub struct PoolBuilder {
    size: usize,
    sizing: Sizing,
    name: String,
    hook: Option<ErrorHook>,
}

impl PoolBuilder {
    pub fn size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn sizing(mut self, sizing: Sizing) -> Self {
        self.sizing = sizing;
        self
    }

    /// Prefix for worker thread names (`{name}-{id}`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn on_error(mut self, hook: ErrorHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn build(self) -> WorkerPool {
        let hook: ErrorHook = match self.hook {
            Some(hook) => hook,
            None => Arc::new(|worker: &str, failure: &TaskFailure| {
                error!(worker = %worker, "{}", failure);
            }),
        };
        WorkerPool {
            shared: Arc::new(Shared {
                name: self.name,
                size: self.size,
                sizing: self.sizing,
                running: AtomicBool::new(true),
                idle: Mutex::new(VecDeque::with_capacity(self.size)),
                returned: Condvar::new(),
                live: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                hook,
                handles: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// A set of OS worker threads executing submitted [`Task`]s.
///
/// Workers are spawned lazily on first demand. Each worker owns a private
/// channel; an idle worker sits in the pool's idle set until [`assign`]
/// takes it out and hands it exactly one task. After running the task (and
/// reporting any failure through the error hook) the worker always checks
/// itself back in, so a failing task never costs the pool a worker.
///
/// Do not call a blocking [`assign`] on a fixed pool from inside one of its
/// own tasks: with every worker busy the call waits for itself.
///
/// [`assign`]: WorkerPool::assign
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            size: default_pool_size(),
            sizing: Sizing::Fixed,
            name: "hcg-worker".to_string(),
            hook: None,
        }
    }

    pub fn fixed(size: usize) -> Self {
        Self::builder().size(size).build()
    }

    pub fn growable(size: usize) -> Self {
        Self::builder().size(size).sizing(Sizing::Growable).build()
    }

    /// Process-wide fixed pool sized to the available parallelism.
    pub fn global() -> &'static WorkerPool {
        static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();
        GLOBAL.get_or_init(|| WorkerPool::builder().build())
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn sizing(&self) -> Sizing {
        self.shared.sizing
    }

    /// Worker threads currently alive.
    pub fn total_threads(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Workers waiting for a task.
    pub fn idle_threads(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Hand `task` to an idle worker.
    ///
    /// A fixed pool blocks while all `size` workers are busy; a growable pool
    /// spawns another worker instead. Fails once the pool is shut down.
    pub fn assign(&self, task: Task) -> Result<()> {
        let worker = self.acquire()?;
        worker.tx.send(Message::Run(task)).map_err(|_| {
            HcgError::Pool(format!(
                "worker {} exited before accepting its task",
                worker.id
            ))
        })
    }

    fn acquire(&self) -> Result<Idle> {
        let shared = &self.shared;
        let mut idle = shared.idle.lock();
        loop {
            if !shared.running.load(Ordering::SeqCst) {
                return Err(HcgError::Pool("pool is shutting down".into()));
            }
            if let Some(worker) = idle.pop_back() {
                return Ok(worker);
            }
            let can_spawn = match shared.sizing {
                Sizing::Growable => true,
                Sizing::Fixed => shared.live.load(Ordering::SeqCst) < shared.size,
            };
            if can_spawn {
                // Reserve the slot while still holding the lock.
                shared.live.fetch_add(1, Ordering::SeqCst);
                break;
            }
            shared.returned.wait(&mut idle);
        }
        drop(idle);
        self.spawn_worker()
    }

    fn spawn_worker(&self) -> Result<Idle> {
        let shared = Arc::clone(&self.shared);
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        let own_tx = tx.clone();
        let thread_name = format!("{}-{}", shared.name, id);

        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker_loop(shared, id, thread_name, own_tx, rx));

        match spawned {
            Ok(handle) => {
                let mut handles = self.shared.handles.lock();
                reap_finished(&mut handles);
                handles.push(handle);
                drop(handles);
                debug!(pool = %self.shared.name, id = id, "spawned worker");
                Ok(Idle { id, tx })
            }
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::SeqCst);
                self.shared.returned.notify_one();
                Err(HcgError::Io(e))
            }
        }
    }

    /// Stop accepting tasks. Idle workers exit now; busy workers exit after
    /// finishing the task they hold.
    pub fn shutdown(&self) {
        let idle: Vec<Idle> = {
            let mut idle = self.shared.idle.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.returned.notify_all();
            idle.drain(..).collect()
        };
        for worker in idle {
            let _ = worker.tx.send(Message::Stop);
        }
    }

    /// Wait for every worker thread spawned so far to exit.
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.shared.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.shared.name, "worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    id: usize,
    name: String,
    tx: Sender<Message>,
    rx: Receiver<Message>,
) {
    while let Ok(Message::Run(task)) = rx.recv() {
        let failure = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(TaskFailure::Error(e)),
            Err(payload) => Some(TaskFailure::Panic(panic_message(payload.as_ref()))),
        };
        if let Some(failure) = failure {
            shared.report(&name, &failure);
        }
        if !shared.check_in(Idle { id, tx: tx.clone() }) {
            break;
        }
    }
    shared.live.fetch_sub(1, Ordering::SeqCst);
    shared.returned.notify_all();
    debug!(worker = %name, "worker exiting");
}

/// Join workers that already exited, e.g. retired growable workers.
fn reap_finished(handles: &mut Vec<JoinHandle<()>>) {
    let mut i = 0;
    while i < handles.len() {
        if handles[i].is_finished() {
            if handles.swap_remove(i).join().is_err() {
                warn!("worker thread terminated abnormally");
            }
        } else {
            i += 1;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    #[test]
    fn more_tasks_than_workers_all_run_once() {
        let pool = WorkerPool::fixed(2);
        let runs: Arc<Vec<AtomicU32>> = Arc::new((0..64).map(|_| AtomicU32::new(0)).collect());

        for i in 0..64 {
            let runs = Arc::clone(&runs);
            pool.assign(Box::new(move || -> anyhow::Result<()> {
                thread::sleep(Duration::from_millis(1));
                runs[i].fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        assert!(pool.total_threads() <= 2);

        pool.shutdown();
        pool.join();
        assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn failing_tasks_report_and_keep_the_worker() {
        let failures = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&failures);
        let pool = WorkerPool::builder()
            .size(1)
            .on_error(Arc::new(move |_worker: &str, _failure: &TaskFailure| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .build();

        pool.assign(Box::new(|| -> anyhow::Result<()> { anyhow::bail!("boom") }))
            .unwrap();
        pool.assign(Box::new(|| -> anyhow::Result<()> { panic!("kaboom") }))
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        pool.assign(Box::new(move || -> anyhow::Result<()> {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        pool.shutdown();
        pool.join();
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn growable_pool_spawns_instead_of_blocking_then_shrinks() {
        let pool = WorkerPool::growable(1);
        let barrier = Arc::new(Barrier::new(4));

        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            pool.assign(Box::new(move || -> anyhow::Result<()> {
                barrier.wait();
                Ok(())
            }))
            .unwrap();
        }
        // Only reachable if three workers run concurrently.
        barrier.wait();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.total_threads() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.total_threads(), 1);
        assert!(pool.idle_threads() <= 1);
    }

    #[test]
    fn retired_workers_do_not_accumulate_handles() {
        let pool = WorkerPool::growable(1);
        for _ in 0..50 {
            let barrier = Arc::new(Barrier::new(4));
            for _ in 0..4 {
                let barrier = Arc::clone(&barrier);
                pool.assign(Box::new(move || -> anyhow::Result<()> {
                    barrier.wait();
                    Ok(())
                }))
                .unwrap();
            }
            let deadline = Instant::now() + Duration::from_secs(5);
            while pool.total_threads() > 1 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
        }
        assert_eq!(pool.total_threads(), 1);
        // Retired workers are joined on the next spawn; only the last
        // burst's stragglers may still be listed.
        assert!(pool.shared.handles.lock().len() <= 8);
    }

    #[test]
    fn assign_after_shutdown_fails() {
        let pool = WorkerPool::fixed(1);
        pool.shutdown();
        let err = pool.assign(Box::new(|| -> anyhow::Result<()> { Ok(()) })).unwrap_err();
        assert!(matches!(err, HcgError::Pool(_)));
    }
}
