//! # Worker Task Scheduler
//!
//! Offloads CPU-heavy kernels to a small pool of dedicated OS threads.
//!
//! ## Core Functionality:
//!
//! - **Priority queue**: higher numeric priority first, FIFO among equals.
//!   Idle workers pull from the queue as soon as they are free.
//! - **Fallback**: with no live worker (pool disabled or every thread gone) or
//!   a saturated queue, the task runs on the calling task through the same
//!   kernel, so callers cannot tell where it ran.
//! - **Timeout**: a task that does not settle within the deadline is rejected
//!   and forgotten. The computation is not interrupted; its late result is
//!   discarded and the worker stays in the pool.
//! - **Crash recovery**: a worker thread that panics rejects the tasks it was
//!   running with [`ResourceError::ContextCrash`] and is replaced lazily on
//!   the next submission.
//!
//! Every task is in exactly one place at a time: the queue, the active map, or
//! settled. The active entry is removed before the reply is sent.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::configs::WorkerSettings;
use crate::error::{ResourceError, ResourceResult};
use crate::sync::{condvar_wait, mutex_lock};
use crate::workers::kernels::{self, TaskKind};

const SOURCE: &str = "workers::scheduler";

/// Function executing one task. The default is [`kernels::run`].
pub type TaskRunner = Arc<dyn Fn(TaskKind, &Value) -> ResourceResult<Value> + Send + Sync>;

type Reply = oneshot::Sender<ResourceResult<Value>>;

enum Route {
    Fallback(Value),
    Queued((u64, oneshot::Receiver<ResourceResult<Value>>)),
}

/// Counters describing scheduler behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted by [`WorkerScheduler::execute`].
    pub submitted: u64,
    /// Tasks whose result came from a background worker.
    pub completed_on_workers: u64,
    /// Tasks run on the calling task.
    pub completed_on_fallback: u64,
    /// Tasks rejected for exceeding the deadline.
    pub timeouts: u64,
    /// Worker threads lost to a panic.
    pub crashes: u64,
    /// Replacement threads started.
    pub respawns: u64,
    /// Workers currently able to take tasks.
    pub live_workers: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
}

struct QueuedTask {
    id: u64,
    seq: u64,
    priority: i32,
    kind: TaskKind,
    payload: Value,
    reply: Reply,
    enqueued_at: Instant,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority wins, then the earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ActiveTask {
    worker: usize,
    kind: TaskKind,
    reply: Reply,
}

#[derive(Default)]
struct WorkerSlot {
    alive: bool,
    handle: Option<JoinHandle<()>>,
}

struct SchedState {
    queue: BinaryHeap<QueuedTask>,
    active: HashMap<u64, ActiveTask>,
    slots: Vec<WorkerSlot>,
    next_id: u64,
    next_seq: u64,
    shutdown: bool,
    stats: SchedulerStats,
}

impl SchedState {
    fn live_workers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.alive).count()
    }
}

struct SchedulerInner {
    settings: WorkerSettings,
    runner: TaskRunner,
    state: Mutex<SchedState>,
    work_ready: Condvar,
}

/// # Worker Scheduler
///
/// Cheap to clone; clones share the pool. Worker threads keep the pool alive
/// until [`WorkerScheduler::shutdown`] is called.
#[derive(Clone)]
pub struct WorkerScheduler {
    inner: Arc<SchedulerInner>,
}

impl WorkerScheduler {
    /// Starts a pool running the built-in kernels.
    pub fn new(settings: WorkerSettings) -> Self {
        Self::with_runner(settings, Arc::new(kernels::run))
    }

    /// Starts a pool running `runner` instead of the built-in kernels.
    pub fn with_runner(settings: WorkerSettings, runner: TaskRunner) -> Self {
        let pool_size = settings.effective_pool_size();
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                settings,
                runner,
                state: Mutex::new(SchedState {
                    queue: BinaryHeap::new(),
                    active: HashMap::new(),
                    slots: (0..pool_size).map(|_| WorkerSlot::default()).collect(),
                    next_id: 0,
                    next_seq: 0,
                    shutdown: false,
                    stats: SchedulerStats::default(),
                }),
                work_ready: Condvar::new(),
            }),
        };
        {
            let mut state = mutex_lock(&scheduler.inner.state, SOURCE, "new");
            scheduler.inner.ensure_workers(&mut state);
        }
        info!(pool_size, "Worker scheduler started");
        scheduler
    }

    /// # Execute
    ///
    /// Runs task `kind` on `payload`. Suspends until the task settles or its
    /// deadline passes.
    pub async fn execute(&self, kind: &str, payload: Value, priority: i32) -> ResourceResult<Value> {
        let kind = TaskKind::parse(kind).ok_or_else(|| ResourceError::UnknownTaskKind(kind.to_string()))?;

        let route = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "execute");
            if state.shutdown {
                return Err(ResourceError::Shutdown);
            }
            state.stats.submitted += 1;
            state.next_id += 1;
            let id = state.next_id;
            self.inner.ensure_workers(&mut state);

            let saturated = state.queue.len() >= self.inner.settings.max_queue;
            if state.live_workers() == 0 || saturated {
                state.stats.completed_on_fallback += 1;
                debug!(id, %kind, saturated, "Running task on fallback path");
                Route::Fallback(payload)
            } else {
                Route::Queued(self.enqueue(&mut state, id, kind, payload, priority))
            }
        };

        let (id, receiver) = match route {
            Route::Fallback(payload) => return self.run_fallback(kind, payload).await,
            Route::Queued(queued) => queued,
        };

        let deadline = self.inner.settings.task_timeout;
        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResourceError::Shutdown),
            Err(_) => {
                let mut state = mutex_lock(&self.inner.state, SOURCE, "execute.timeout");
                let was_active = state.active.remove(&id).is_some();
                state.queue.retain(|task| task.id != id);
                state.stats.timeouts += 1;
                warn!(id, %kind, was_active, timeout_ms = deadline.as_millis() as u64, "Worker task timed out");
                Err(ResourceError::Timeout {
                    task_id: id,
                    kind: kind.to_string(),
                    elapsed: deadline,
                })
            }
        }
    }

    fn enqueue(
        &self,
        state: &mut SchedState,
        id: u64,
        kind: TaskKind,
        payload: Value,
        priority: i32,
    ) -> (u64, oneshot::Receiver<ResourceResult<Value>>) {
        let (reply, receiver) = oneshot::channel();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.queue.push(QueuedTask {
            id,
            seq,
            priority,
            kind,
            payload,
            reply,
            enqueued_at: Instant::now(),
        });
        self.inner.work_ready.notify_one();
        (id, receiver)
    }

    async fn run_fallback(&self, kind: TaskKind, payload: Value) -> ResourceResult<Value> {
        // Give other tasks a turn before blocking this one on the kernel.
        tokio::task::yield_now().await;
        (self.inner.runner)(kind, &payload)
    }

    /// Stops accepting tasks, rejects everything still queued and lets the
    /// worker threads exit once their current task is done.
    pub fn shutdown(&self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "shutdown");
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let rejected = state.queue.len();
        for task in state.queue.drain() {
            let _ = task.reply.send(Err(ResourceError::Shutdown));
        }
        for slot in state.slots.iter_mut() {
            // Detach: a worker may still be finishing a long kernel.
            slot.handle.take();
        }
        self.inner.work_ready.notify_all();
        info!(rejected, "Worker scheduler shut down");
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SchedulerStats {
        let state = mutex_lock(&self.inner.state, SOURCE, "stats");
        SchedulerStats {
            live_workers: state.live_workers(),
            queued: state.queue.len(),
            ..state.stats
        }
    }

    /// Configured pool size (live or not).
    pub fn pool_size(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "pool_size").slots.len()
    }
}

impl SchedulerInner {
    /// Starts a thread for every slot that has none.
    fn ensure_workers(self: &Arc<Self>, state: &mut SchedState) {
        if state.shutdown {
            return;
        }
        for worker in 0..state.slots.len() {
            if state.slots[worker].alive {
                continue;
            }
            let replacing = state.slots[worker].handle.take().is_some();
            let inner = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("resman-worker-{worker}"))
                .spawn(move || worker_loop(inner, worker));
            match spawned {
                Ok(handle) => {
                    state.slots[worker] = WorkerSlot {
                        alive: true,
                        handle: Some(handle),
                    };
                    if replacing {
                        state.stats.respawns += 1;
                        info!(worker, "Replaced crashed worker");
                    }
                }
                Err(err) => {
                    error!(worker, error = %err, "Failed to start worker thread");
                }
            }
        }
    }
}

/// Rejects the worker's in-flight tasks if its thread unwinds.
struct CrashGuard {
    inner: Arc<SchedulerInner>,
    worker: usize,
}

impl Drop for CrashGuard {
    fn drop(&mut self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "crash_guard");
        if let Some(slot) = state.slots.get_mut(self.worker) {
            slot.alive = false;
        }
        if !thread::panicking() {
            return;
        }

        state.stats.crashes += 1;
        let crashed: Vec<u64> = state
            .active
            .iter()
            .filter(|(_, task)| task.worker == self.worker)
            .map(|(id, _)| *id)
            .collect();
        for id in crashed {
            if let Some(task) = state.active.remove(&id) {
                warn!(worker = self.worker, task_id = id, kind = %task.kind, "Worker crashed with task in flight");
                let _ = task.reply.send(Err(ResourceError::ContextCrash {
                    task_id: id,
                    worker: self.worker,
                }));
            }
        }
    }
}

fn worker_loop(inner: Arc<SchedulerInner>, worker: usize) {
    let _guard = CrashGuard {
        inner: Arc::clone(&inner),
        worker,
    };
    debug!(worker, "Worker started");

    loop {
        // --- Wait for work ---
        let task = {
            let mut state = mutex_lock(&inner.state, SOURCE, "worker.wait");
            loop {
                if state.shutdown {
                    debug!(worker, "Worker exiting");
                    return;
                }
                match state.queue.pop() {
                    // The caller already gave up (timeout or dropped future).
                    Some(task) if task.reply.is_closed() => continue,
                    Some(task) => {
                        state.active.insert(
                            task.id,
                            ActiveTask {
                                worker,
                                kind: task.kind,
                                reply: task.reply,
                            },
                        );
                        break (task.id, task.kind, task.payload, task.enqueued_at);
                    }
                    None => state = condvar_wait(&inner.work_ready, state, SOURCE),
                }
            }
        };
        let (id, kind, payload, enqueued_at) = task;

        // --- Run ---
        let started = Instant::now();
        let outcome = (inner.runner)(kind, &payload);

        // --- Settle ---
        let reply = {
            let mut state = mutex_lock(&inner.state, SOURCE, "worker.settle");
            let reply = state.active.remove(&id).map(|task| task.reply);
            if reply.is_some() {
                state.stats.completed_on_workers += 1;
            }
            reply
        };
        match reply {
            Some(reply) => {
                debug!(
                    worker,
                    id,
                    %kind,
                    queued_ms = started.duration_since(enqueued_at).as_millis() as u64,
                    run_ms = started.elapsed().as_millis() as u64,
                    "Task settled on worker"
                );
                let _ = reply.send(outcome);
            }
            None => debug!(worker, id, %kind, "Discarding result of timed-out task"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;

    fn settings(pool_size: usize) -> WorkerSettings {
        WorkerSettings {
            pool_size: Some(pool_size),
            ..WorkerSettings::default()
        }
    }

    #[tokio::test]
    async fn runs_kernels_on_workers() {
        let scheduler = WorkerScheduler::new(settings(2));
        let out = scheduler
            .execute("xp-calculation", json!({ "totalXp": 450 }), 0)
            .await
            .unwrap();

        assert_eq!(out["level"], 3);
        let stats = scheduler.stats();
        assert_eq!(stats.completed_on_workers, 1);
        assert_eq!(stats.completed_on_fallback, 0);
        assert_eq!(stats.live_workers, 2);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn disabled_pool_falls_back_with_identical_results() {
        let pooled = WorkerScheduler::new(settings(2));
        let inline = WorkerScheduler::new(settings(0));
        let payload = json!({ "totalXp": 12_345 });

        let a = pooled.execute("xp-calculation", payload.clone(), 0).await.unwrap();
        let b = inline.execute("xp-calculation", payload, 0).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(inline.stats().completed_on_fallback, 1);
        assert_eq!(inline.pool_size(), 0);
        pooled.shutdown();
    }

    #[tokio::test]
    async fn unknown_kinds_are_rejected() {
        let scheduler = WorkerScheduler::new(settings(1));
        let err = scheduler.execute("render-video", json!({}), 0).await.unwrap_err();
        assert!(matches!(err, ResourceError::UnknownTaskKind(kind) if kind == "render-video"));
        scheduler.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn higher_priority_runs_first_fifo_within_priority() {
        let (release, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let order = Arc::new(Mutex::new(Vec::new()));
        let runner: TaskRunner = {
            let order = Arc::clone(&order);
            Arc::new(move |kind, payload: &Value| {
                if payload.get("gate").is_some() {
                    let _ = gate.lock().unwrap().recv();
                }
                if let Some(tag) = payload.get("tag").and_then(Value::as_str) {
                    order.lock().unwrap().push(tag.to_string());
                }
                kernels::run(kind, &json!({ "totalXp": 1 }))
            })
        };
        let scheduler = WorkerScheduler::with_runner(settings(1), runner);

        let blocker = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.execute("xp-calculation", json!({ "gate": true }), 0).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut waiting = Vec::new();
        for (tag, priority) in [("low", 1), ("high-a", 5), ("high-b", 5)] {
            let scheduler = scheduler.clone();
            waiting.push(tokio::spawn(async move {
                scheduler.execute("xp-calculation", json!({ "tag": tag }), priority).await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scheduler.stats().queued, 3);

        release.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for handle in waiting {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high-a", "high-b", "low"]);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn timeout_rejects_but_keeps_the_worker() {
        let runner: TaskRunner = Arc::new(|kind, payload: &Value| {
            if payload.get("slow").is_some() {
                thread::sleep(Duration::from_millis(300));
            }
            kernels::run(kind, &json!({ "totalXp": 0 }))
        });
        let scheduler = WorkerScheduler::with_runner(
            WorkerSettings {
                pool_size: Some(1),
                task_timeout: Duration::from_millis(100),
                ..WorkerSettings::default()
            },
            runner,
        );

        let err = scheduler
            .execute("xp-calculation", json!({ "slow": true }), 0)
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // Same worker, once the slow kernel finishes on its own.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let out = scheduler.execute("xp-calculation", json!({}), 0).await.unwrap();
        assert_eq!(out["level"], 1);

        let stats = scheduler.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.crashes, 0);
        assert_eq!(stats.live_workers, 1);
        scheduler.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn task_timing_out_in_queue_is_removed_from_it() {
        let (release, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let runner: TaskRunner = Arc::new(move |kind, payload: &Value| {
            if payload.get("gate").is_some() {
                let _ = gate.lock().unwrap().recv();
            }
            kernels::run(kind, &json!({ "totalXp": 0 }))
        });
        let scheduler = WorkerScheduler::with_runner(
            WorkerSettings {
                pool_size: Some(1),
                task_timeout: Duration::from_millis(100),
                ..WorkerSettings::default()
            },
            runner,
        );

        let blocker = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.execute("xp-calculation", json!({ "gate": true }), 0).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiting = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.execute("xp-calculation", json!({}), 9).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.stats().queued, 1);

        assert!(waiting.await.unwrap().unwrap_err().is_timeout());
        assert_eq!(scheduler.stats().queued, 0);
        assert!(blocker.await.unwrap().unwrap_err().is_timeout());

        release.send(()).unwrap();
        let out = scheduler.execute("xp-calculation", json!({}), 0).await.unwrap();
        assert_eq!(out["level"], 1);

        let stats = scheduler.stats();
        assert_eq!(stats.timeouts, 2);
        assert_eq!(stats.completed_on_workers, 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn crashed_worker_rejects_in_flight_task_and_is_replaced() {
        let runner: TaskRunner = Arc::new(|kind, payload: &Value| {
            if payload.get("crash").is_some() {
                panic!("kernel bug");
            }
            kernels::run(kind, &json!({ "totalXp": 100 }))
        });
        let scheduler = WorkerScheduler::with_runner(settings(1), runner);

        let err = scheduler
            .execute("xp-calculation", json!({ "crash": true }), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::ContextCrash { worker: 0, .. }));

        let out = scheduler.execute("xp-calculation", json!({}), 0).await.unwrap();
        assert_eq!(out["level"], 2);

        let stats = scheduler.stats();
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.respawns, 1);
        assert_eq!(stats.completed_on_workers, 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_tasks() {
        let scheduler = WorkerScheduler::new(settings(1));
        scheduler.shutdown();
        let err = scheduler.execute("xp-calculation", json!({ "totalXp": 1 }), 0).await.unwrap_err();
        assert!(matches!(err, ResourceError::Shutdown));
    }
}
