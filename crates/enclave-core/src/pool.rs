//! Worker pool with bounded FIFO admission.
//!
//! Each slot is an actor task owning one [`Slot`] and an inbound job
//! channel. The pool keeps slot states, the idle list, and the wait queue
//! under one lock, so a slot is assigned by exactly one path: either
//! `submit` finds it idle, or the slot picks up the head of the queue when
//! it finishes.
//!
//! **Security invariant**: every execution runs in a fresh V8 isolate.
//! Workers are reused across executions, never isolates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::EnclaveError;
use crate::governor::MessageLimits;
use crate::host::{ProcessSpawner, ThreadSpawner, WorkerSpawner};
use crate::slot::{Slot, SlotJob, SlotOutcome, SlotSettings, SlotState};

/// Where slot workers run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotBackend {
    /// Dedicated OS thread per slot.
    #[default]
    Thread,
    /// `enclave-worker` child process per slot.
    Process,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of slots.
    pub slots: usize,
    /// Executions allowed to wait for a slot. `0` rejects when all are busy.
    pub queue_capacity: usize,
    /// How long a queued execution may wait.
    pub queue_timeout: Duration,
    /// Recycle a worker after this many executions.
    pub max_executions_per_slot: u64,
    /// Extra time past the execution timeout before the host kills a worker.
    pub kill_grace: Duration,
    /// Worker backend.
    pub backend: SlotBackend,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            queue_capacity: 64,
            queue_timeout: Duration::from_secs(30),
            max_executions_per_slot: 100,
            kill_grace: Duration::from_secs(2),
            backend: SlotBackend::Thread,
        }
    }
}

impl PoolConfig {
    /// Spawner for the configured backend.
    pub fn spawner(&self, message_limits: &MessageLimits) -> Arc<dyn WorkerSpawner> {
        match self.backend {
            SlotBackend::Thread => Arc::new(ThreadSpawner::new(message_limits.max_message_bytes)),
            SlotBackend::Process => Arc::new(ProcessSpawner::new(message_limits.max_message_bytes)),
        }
    }
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Workers started.
    pub spawned: AtomicU64,
    /// Workers retired after `max_executions_per_slot`.
    pub recycled: AtomicU64,
    /// Workers lost to crashes and messaging faults.
    pub crashed: AtomicU64,
    /// Workers killed by the host deadline.
    pub timed_out: AtomicU64,
    /// Executions that had to wait for a slot.
    pub queued: AtomicU64,
    /// Executions rejected because the queue was full.
    pub rejected: AtomicU64,
    /// Executions that gave up waiting.
    pub queue_timeouts: AtomicU64,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    /// Slot index.
    pub id: usize,
    /// Current state.
    pub state: SlotState,
    /// Execution running on it, if busy.
    pub execution_id: Option<String>,
}

type Reply = oneshot::Sender<Result<SlotOutcome, EnclaveError>>;

struct Assignment {
    job: SlotJob,
    reply: Reply,
}

struct QueueEntry {
    id: u64,
    assignment: Assignment,
    dispatched: oneshot::Sender<()>,
}

struct SlotEntry {
    state: SlotState,
    execution_id: Option<String>,
    inbox: Option<mpsc::UnboundedSender<Assignment>>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<SlotEntry>,
    idle: VecDeque<usize>,
    queue: VecDeque<QueueEntry>,
    next_entry: u64,
    disposed: bool,
}

impl PoolState {
    fn assign(&mut self, idx: usize, assignment: Assignment) {
        let slot = &mut self.slots[idx];
        slot.state = SlotState::Busy;
        slot.execution_id = Some(assignment.job.execution_id.clone());
        let Some(inbox) = &slot.inbox else {
            let _ = assignment.reply.send(Err(EnclaveError::WorkerPoolDisposed));
            return;
        };
        if let Err(mpsc::error::SendError(assignment)) = inbox.send(assignment) {
            slot.state = SlotState::Disposed;
            let _ = assignment.reply.send(Err(EnclaveError::WorkerCrashed {
                reason: format!("slot {idx} is gone"),
            }));
        }
    }
}

struct Shared {
    config: PoolConfig,
    settings: Arc<SlotSettings>,
    metrics: Arc<PoolMetrics>,
    state: Mutex<PoolState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, idx: usize, state: SlotState) {
        let mut st = self.lock();
        if st.slots[idx].state != SlotState::Disposed {
            st.slots[idx].state = state;
        }
    }

    /// Hand the head of the queue to `idx`, or park it as idle.
    fn release(&self, idx: usize) {
        let mut st = self.lock();
        st.slots[idx].execution_id = None;
        if st.disposed {
            st.slots[idx].state = SlotState::Disposed;
            return;
        }
        // Skip waiters whose caller went away.
        while let Some(entry) = st.queue.pop_front() {
            if entry.assignment.reply.is_closed() {
                continue;
            }
            let _ = entry.dispatched.send(());
            st.assign(idx, entry.assignment);
            return;
        }
        st.slots[idx].state = SlotState::Idle;
        st.idle.push_back(idx);
    }
}

/// A waiter's place in the queue. Dropping it withdraws the entry, so an
/// abandoned `submit` never reaches a slot.
struct QueueTicket<'a> {
    shared: &'a Shared,
    id: u64,
}

impl QueueTicket<'_> {
    /// Remove the entry if it is still queued.
    fn withdraw(&self) -> bool {
        let mut st = self.shared.lock();
        match st.queue.iter().position(|e| e.id == self.id) {
            Some(pos) => {
                st.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.withdraw() {
            tracing::debug!(entry = self.id, "queued execution abandoned by caller");
        }
    }
}

/// Fixed-size pool of worker slots.
pub struct WorkerPool {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Start `config.slots` slot actors using `spawner`. Workers start in
    /// the background; a slot whose worker fails to start retries on its
    /// first job.
    pub fn new(
        config: PoolConfig,
        message_limits: MessageLimits,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Result<Self, EnclaveError> {
        if config.slots == 0 {
            return Err(EnclaveError::Configuration("pool needs at least one slot".into()));
        }
        let settings = Arc::new(SlotSettings {
            spawner,
            message_limits,
            kill_grace: config.kill_grace,
            max_executions: config.max_executions_per_slot.max(1),
        });
        let shared = Arc::new(Shared {
            config: config.clone(),
            settings,
            metrics: Arc::new(PoolMetrics::default()),
            state: Mutex::new(PoolState::default()),
        });

        let mut tasks = Vec::with_capacity(config.slots);
        {
            let mut st = shared.lock();
            for idx in 0..config.slots {
                let (tx, rx) = mpsc::unbounded_channel();
                st.slots.push(SlotEntry {
                    state: SlotState::Idle,
                    execution_id: None,
                    inbox: Some(tx),
                });
                st.idle.push_back(idx);
                tasks.push(tokio::spawn(slot_task(idx, shared.clone(), rx)));
            }
        }
        tracing::info!(slots = config.slots, backend = ?config.backend, "worker pool started");

        Ok(Self {
            shared,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    /// Pool counters.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.shared.metrics
    }

    /// Configuration in force.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Executions waiting for a slot.
    pub fn queue_depth(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Slots currently running an execution.
    pub fn busy_slots(&self) -> usize {
        self.shared
            .lock()
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Busy)
            .count()
    }

    /// Per-slot view.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.shared
            .lock()
            .slots
            .iter()
            .enumerate()
            .map(|(id, s)| SlotSnapshot {
                id,
                state: s.state,
                execution_id: s.execution_id.clone(),
            })
            .collect()
    }

    /// Run `job` on the next free slot.
    ///
    /// # Errors
    ///
    /// - [`EnclaveError::WorkerPoolDisposed`] after [`dispose`](Self::dispose)
    /// - [`EnclaveError::QueueFull`] when every slot is busy and the queue is at capacity
    /// - [`EnclaveError::QueueTimeout`] when no slot frees up within `queue_timeout`
    ///
    /// Faults during the run are inside the returned [`SlotOutcome`].
    pub async fn submit(&self, job: SlotJob) -> Result<SlotOutcome, EnclaveError> {
        let (reply, outcome) = oneshot::channel();
        let assignment = Assignment { job, reply };

        let waiting = {
            let mut st = self.shared.lock();
            if st.disposed {
                return Err(EnclaveError::WorkerPoolDisposed);
            }
            if let Some(idx) = st.idle.pop_front() {
                st.assign(idx, assignment);
                None
            } else if st.queue.len() >= self.shared.config.queue_capacity {
                self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(EnclaveError::QueueFull {
                    capacity: self.shared.config.queue_capacity,
                });
            } else {
                let id = st.next_entry;
                st.next_entry += 1;
                let (dispatched, on_dispatch) = oneshot::channel();
                st.queue.push_back(QueueEntry {
                    id,
                    assignment,
                    dispatched,
                });
                self.shared.metrics.queued.fetch_add(1, Ordering::Relaxed);
                Some((id, on_dispatch))
            }
        };

        if let Some((id, on_dispatch)) = waiting {
            let ticket = QueueTicket {
                shared: &self.shared,
                id,
            };
            let wait = self.shared.config.queue_timeout;
            if tokio::time::timeout(wait, on_dispatch).await.is_err() && ticket.withdraw() {
                self.shared.metrics.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(EnclaveError::QueueTimeout {
                    waited_ms: wait.as_millis() as u64,
                });
            }
            // Dispatched, possibly while the timer fired.
        }

        outcome.await.unwrap_or_else(|_| {
            Err(EnclaveError::WorkerCrashed {
                reason: "slot dropped the execution".into(),
            })
        })
    }

    /// Stop accepting work, reject queued executions, let running ones
    /// finish, then terminate every worker. Idempotent.
    pub async fn dispose(&self) {
        let rejected = {
            let mut st = self.shared.lock();
            st.disposed = true;
            st.idle.clear();
            for slot in st.slots.iter_mut() {
                slot.inbox = None;
                if slot.state != SlotState::Busy {
                    slot.state = SlotState::Disposed;
                }
            }
            std::mem::take(&mut st.queue)
        };
        for entry in rejected {
            let _ = entry.assignment.reply.send(Err(EnclaveError::WorkerPoolDisposed));
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("worker pool disposed");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Slot tasks hold the shared state; closing inboxes lets them exit.
        let mut st = self.shared.lock();
        st.disposed = true;
        for slot in st.slots.iter_mut() {
            slot.inbox = None;
        }
    }
}

async fn slot_task(idx: usize, shared: Arc<Shared>, mut inbox: mpsc::UnboundedReceiver<Assignment>) {
    let mut slot = Slot::new(idx, shared.settings.clone(), shared.metrics.clone());
    if let Err(e) = slot.warm().await {
        tracing::warn!(slot_id = idx, error = %e, "initial worker start failed");
    }

    while let Some(Assignment { job, reply }) = inbox.recv().await {
        if reply.is_closed() {
            tracing::debug!(slot_id = idx, execution_id = %job.execution_id, "caller gone, skipping execution");
            shared.release(idx);
            continue;
        }
        let started = Instant::now();
        let outcome = slot.execute(&job).await;
        tracing::debug!(
            slot_id = idx,
            execution_id = %job.execution_id,
            ok = outcome.result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "slot finished execution"
        );
        let _ = reply.send(Ok(outcome));

        if slot.needs_respawn() {
            shared.set_state(idx, SlotState::Crashed);
            if let Err(e) = slot.warm().await {
                tracing::error!(slot_id = idx, error = %e, "worker respawn failed");
            }
        }
        shared.release(idx);
    }

    slot.shutdown().await;
    shared.set_state(idx, SlotState::Disposed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::WorkerHandle;
    use crate::ipc::{
        read_message_with_limit, write_message, ChildMessage, ParentMessage, ToolCallOutcome,
        DEFAULT_MAX_MESSAGE_BYTES,
    };
    use crate::request::{ExecutionLimits, ExecutionStats};
    use crate::slot::ToolHandler;
    use async_trait::async_trait;
    use serde_json::Value;

    /// Completes each execution after `delay`, returning its execution id.
    struct DelayedSpawner {
        delay: Duration,
    }

    #[async_trait]
    impl WorkerSpawner for DelayedSpawner {
        async fn spawn(&self) -> Result<WorkerHandle, EnclaveError> {
            let (host_io, worker_io) = tokio::io::duplex(64 * 1024);
            let (host_r, host_w) = tokio::io::split(host_io);
            let (mut r, mut w) = tokio::io::split(worker_io);
            let delay = self.delay;
            let task = tokio::spawn(async move {
                while let Ok(Some(ParentMessage::Execute { execution_id, .. })) =
                    read_message_with_limit::<ParentMessage, _>(&mut r, DEFAULT_MAX_MESSAGE_BYTES).await
                {
                    tokio::time::sleep(delay).await;
                    let msg = ChildMessage::ExecutionComplete {
                        result: Ok(Value::String(execution_id)),
                        stats: ExecutionStats::default(),
                    };
                    if write_message(&mut w, &msg).await.is_err() {
                        return;
                    }
                }
            });
            Ok(WorkerHandle::from_task(host_r, host_w, task, DEFAULT_MAX_MESSAGE_BYTES))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolHandler for NoTools {
        async fn invoke(&self, _tool: String, _args: Value) -> ToolCallOutcome {
            ToolCallOutcome::failed("tool_not_available", "no tools")
        }
    }

    fn job(id: &str) -> SlotJob {
        SlotJob {
            execution_id: id.into(),
            code: String::new(),
            limits: ExecutionLimits::default(),
            tools: Arc::new(NoTools),
        }
    }

    fn pool(slots: usize, queue_capacity: usize, delay_ms: u64) -> Arc<WorkerPool> {
        let config = PoolConfig {
            slots,
            queue_capacity,
            queue_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        Arc::new(
            WorkerPool::new(
                config,
                MessageLimits::default(),
                Arc::new(DelayedSpawner {
                    delay: Duration::from_millis(delay_ms),
                }),
            )
            .unwrap(),
        )
    }

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.slots, 4);
        assert_eq!(config.backend, SlotBackend::Thread);
        assert!(config.queue_capacity > 0);
    }

    #[tokio::test]
    async fn zero_slots_is_a_configuration_error() {
        let err = WorkerPool::new(
            PoolConfig {
                slots: 0,
                ..PoolConfig::default()
            },
            MessageLimits::default(),
            Arc::new(DelayedSpawner {
                delay: Duration::ZERO,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, EnclaveError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_without_queue_rejects_immediately() {
        let pool = pool(2, 0, 1_000);
        let a = tokio::spawn({
            let p = pool.clone();
            async move { p.submit(job("a")).await }
        });
        let b = tokio::spawn({
            let p = pool.clone();
            async move { p.submit(job("b")).await }
        });
        tokio::task::yield_now().await;
        while pool.busy_slots() < 2 {
            tokio::task::yield_now().await;
        }

        let err = pool.submit(job("c")).await.unwrap_err();
        assert!(matches!(err, EnclaveError::QueueFull { capacity: 0 }));
        assert_eq!(pool.metrics().rejected.load(Ordering::Relaxed), 1);

        assert_eq!(a.await.unwrap().unwrap().result.unwrap(), "a");
        assert_eq!(b.await.unwrap().unwrap().result.unwrap(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn queued_execution_runs_when_a_slot_frees() {
        let pool = pool(1, 1, 100);
        let first = tokio::spawn({
            let p = pool.clone();
            async move { p.submit(job("first")).await }
        });
        while pool.busy_slots() < 1 {
            tokio::task::yield_now().await;
        }
        let second = pool.submit(job("second")).await.unwrap();
        assert_eq!(second.result.unwrap(), "second");
        assert_eq!(first.await.unwrap().unwrap().result.unwrap(), "first");
        assert_eq!(pool.metrics().queued.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_is_fifo() {
        let pool = pool(1, 8, 10);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let p = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let out = p.submit(job(&format!("j{i}"))).await.unwrap();
                order.lock().unwrap().push(out.result.unwrap());
            }));
            // Let each submission reach the queue before the next.
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
        }
        for h in handles {
            h.await.unwrap();
        }
        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["j0", "j1", "j2", "j3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_execution_times_out() {
        let config = PoolConfig {
            slots: 1,
            queue_capacity: 1,
            queue_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let pool = Arc::new(
            WorkerPool::new(
                config,
                MessageLimits::default(),
                Arc::new(DelayedSpawner {
                    delay: Duration::from_secs(10),
                }),
            )
            .unwrap(),
        );
        let _busy = tokio::spawn({
            let p = pool.clone();
            async move { p.submit(job("long")).await }
        });
        while pool.busy_slots() < 1 {
            tokio::task::yield_now().await;
        }
        let err = pool.submit(job("waiting")).await.unwrap_err();
        assert!(matches!(err, EnclaveError::QueueTimeout { waited_ms: 50 }));
        assert_eq!(pool.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_drains_running_and_rejects_queued() {
        let pool = pool(1, 4, 100);
        let running = tokio::spawn({
            let p = pool.clone();
            async move { p.submit(job("running")).await }
        });
        while pool.busy_slots() < 1 {
            tokio::task::yield_now().await;
        }
        let queued = tokio::spawn({
            let p = pool.clone();
            async move { p.submit(job("queued")).await }
        });
        while pool.queue_depth() < 1 {
            tokio::task::yield_now().await;
        }

        pool.dispose().await;

        assert_eq!(running.await.unwrap().unwrap().result.unwrap(), "running");
        assert!(matches!(
            queued.await.unwrap().unwrap_err(),
            EnclaveError::WorkerPoolDisposed
        ));
        assert!(matches!(
            pool.submit(job("late")).await.unwrap_err(),
            EnclaveError::WorkerPoolDisposed
        ));
        assert!(pool.snapshot().iter().all(|s| s.state == SlotState::Disposed));
    }
}
