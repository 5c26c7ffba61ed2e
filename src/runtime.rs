//! Canonical task lifecycle: the state machine, FIFO admission under a
//! global running cap, cancellation and deadlines, monotone progress, and
//! write-behind persistence.
//!
//! In-memory state is authoritative for a live task. Every transition is
//! applied in memory first and then persisted with at-least-once semantics;
//! a failed store write is retried in the background and never blocks the
//! transition. On process restart the store reconciliation marks anything
//! left non-terminal as failed/abandoned (see `Db::mark_abandoned_tasks`).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::DbHandle;
use crate::errors::{Error, Result};
use crate::logbus::LogBus;
use crate::models::{BuildTask, TaskStatus};

/// The work a task performs once admitted. Wired to the build pipeline at
/// startup; tests substitute stubs.
pub type TaskExecutor = Arc<
    dyn Fn(BuildTask, TaskContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync,
>;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_running: usize,
    pub deadline: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_running: 3,
            deadline: Duration::from_secs(30 * 60),
        }
    }
}

/// Handed to the executor. Cancellation is cooperative: the pipeline calls
/// [`TaskContext::check_cancelled`] at stage boundaries and read iterations.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: i64,
    pub cancel: CancellationToken,
    pub runtime: TaskRuntime,
    timed_out: Arc<AtomicBool>,
    deadline_secs: u64,
}

impl TaskContext {
    /// The error the cancellation pathway resolved to: a deadline expiry
    /// surfaces as `Timeout`, a user cancel as `Cancelled`.
    pub fn cancel_error(&self) -> Error {
        if self.timed_out.load(Ordering::Relaxed) {
            Error::Timeout {
                limit_secs: self.deadline_secs,
            }
        } else {
            Error::Cancelled
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(self.cancel_error())
        } else {
            Ok(())
        }
    }
}

struct LiveTask {
    status: TaskStatus,
    progress: u8,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
}

struct RuntimeState {
    live: HashMap<i64, LiveTask>,
    /// Pending tasks awaiting a running slot, in submission order.
    queue: VecDeque<i64>,
    running: usize,
}

struct RuntimeInner {
    state: Mutex<RuntimeState>,
    config: RuntimeConfig,
    db: DbHandle,
    bus: LogBus,
    executor: TaskExecutor,
}

#[derive(Clone)]
pub struct TaskRuntime {
    inner: Arc<RuntimeInner>,
}

impl TaskRuntime {
    pub fn new(db: DbHandle, bus: LogBus, config: RuntimeConfig, executor: TaskExecutor) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                state: Mutex::new(RuntimeState {
                    live: HashMap::new(),
                    queue: VecDeque::new(),
                    running: 0,
                }),
                config,
                db,
                bus,
                executor,
            }),
        }
    }

    /// Track a freshly created task. Called by the HTTP layer right after
    /// the record is inserted.
    pub fn register(&self, task_id: i64) {
        let mut state = self.lock();
        state.live.entry(task_id).or_insert_with(|| LiveTask {
            status: TaskStatus::Pending,
            progress: 0,
            cancel: CancellationToken::new(),
            timed_out: Arc::new(AtomicBool::new(false)),
        });
    }

    pub fn status(&self, task_id: i64) -> Option<TaskStatus> {
        self.lock().live.get(&task_id).map(|t| t.status)
    }

    pub fn progress(&self, task_id: i64) -> Option<u8> {
        self.lock().live.get(&task_id).map(|t| t.progress)
    }

    /// Queue a pending task for execution. Admission is FIFO as running
    /// slots free up.
    pub fn start(&self, task_id: i64) -> Result<TaskStatus> {
        {
            let mut state = self.lock();
            let task = state
                .live
                .get(&task_id)
                .ok_or_else(|| Error::Internal(format!("task {} is not tracked", task_id)))?;
            if task.status != TaskStatus::Pending {
                return Err(Error::Internal(format!(
                    "task {} is {}, not pending",
                    task_id,
                    task.status.as_str()
                )));
            }
            if state.queue.contains(&task_id) {
                return Ok(TaskStatus::Pending);
            }
            state.queue.push_back(task_id);
        }
        self.pump();
        Ok(self.status(task_id).unwrap_or(TaskStatus::Pending))
    }

    /// Cancel a task. Pending tasks finish immediately; running tasks get
    /// their token cancelled and conclude at the next checkpoint.
    pub fn cancel(&self, task_id: i64) -> Result<TaskStatus> {
        enum Action {
            Immediate,
            Signalled,
            Terminal(TaskStatus),
        }
        let action = {
            let mut state = self.lock();
            let task = state
                .live
                .get(&task_id)
                .ok_or_else(|| Error::Internal(format!("task {} is not tracked", task_id)))?;
            match task.status {
                TaskStatus::Pending => {
                    state.queue.retain(|id| *id != task_id);
                    Action::Immediate
                }
                TaskStatus::Running => {
                    task.cancel.cancel();
                    Action::Signalled
                }
                status => Action::Terminal(status),
            }
        };
        match action {
            Action::Immediate => {
                self.conclude(task_id, Err(Error::Cancelled));
                Ok(TaskStatus::Cancelled)
            }
            Action::Signalled => Ok(TaskStatus::Running),
            Action::Terminal(status) => Ok(status),
        }
    }

    /// Monotone progress update: a stale lower value never wins.
    pub fn update_progress(&self, task_id: i64, progress: u8) {
        let progress = progress.min(100);
        let changed = {
            let mut state = self.lock();
            match state.live.get_mut(&task_id) {
                Some(task) if progress > task.progress => {
                    task.progress = progress;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist(move |db| db.update_task_progress(task_id, progress));
        }
    }

    // ── Admission ─────────────────────────────────────────────────────

    fn pump(&self) {
        loop {
            let task_id = {
                let mut state = self.lock();
                if state.running >= self.inner.config.max_running {
                    break;
                }
                match state.queue.pop_front() {
                    Some(id) => {
                        state.running += 1;
                        id
                    }
                    None => break,
                }
            };
            self.spawn_task(task_id);
        }
    }

    fn spawn_task(&self, task_id: i64) {
        let (cancel, timed_out) = {
            let mut state = self.lock();
            match state.live.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Running;
                    (task.cancel.clone(), Arc::clone(&task.timed_out))
                }
                // Cancelled out from under the queue; give the slot back.
                _ => {
                    state.running -= 1;
                    return;
                }
            }
        };

        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.drive(task_id, cancel, timed_out).await;
        });
    }

    async fn drive(&self, task_id: i64, cancel: CancellationToken, timed_out: Arc<AtomicBool>) {
        self.persist(move |db| db.mark_task_started(task_id));

        let task = match self.inner.db.call(move |db| db.get_task(task_id)).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.conclude(task_id, Err(Error::Internal("task record missing".into())));
                return;
            }
            Err(e) => {
                self.conclude(task_id, Err(Error::Internal(e.to_string())));
                return;
            }
        };

        // The deadline routes through the same cancellation pathway as a
        // user cancel, but resolves to failed/timeout.
        let deadline = self.inner.config.deadline;
        let watchdog = {
            let cancel = cancel.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                timed_out.store(true, Ordering::Relaxed);
                cancel.cancel();
            })
        };

        let ctx = TaskContext {
            task_id,
            cancel,
            runtime: self.clone(),
            timed_out,
            deadline_secs: deadline.as_secs(),
        };
        info!(task_id, "task admitted");
        let result = (self.inner.executor)(task, ctx).await;
        watchdog.abort();
        self.conclude(task_id, result);
    }

    // ── Completion ────────────────────────────────────────────────────

    fn conclude(&self, task_id: i64, result: Result<serde_json::Value>) {
        let (final_status, error_kind, error_message, payload) = match result {
            Ok(value) => (TaskStatus::Completed, None, None, Some(value)),
            Err(Error::Cancelled) => {
                (TaskStatus::Cancelled, Some("cancelled"), None, None)
            }
            Err(e) => {
                let kind = e.kind();
                (TaskStatus::Failed, Some(kind), Some(e.to_string()), None)
            }
        };

        let was_running = {
            let mut state = self.lock();
            let was_running = match state.live.get_mut(&task_id) {
                Some(task) => {
                    let was_running = task.status == TaskStatus::Running;
                    if !TaskStatus::is_valid_transition(task.status, final_status) {
                        warn!(
                            task_id,
                            from = task.status.as_str(),
                            to = final_status.as_str(),
                            "refusing illegal task transition"
                        );
                        return;
                    }
                    task.status = final_status;
                    if final_status == TaskStatus::Completed {
                        task.progress = 100;
                    }
                    was_running
                }
                None => false,
            };
            if was_running {
                state.running -= 1;
            }
            was_running
        };

        match final_status {
            TaskStatus::Completed => info!(task_id, "task completed"),
            status => warn!(
                task_id,
                status = status.as_str(),
                error = error_message.as_deref().unwrap_or(""),
                "task finished unsuccessfully"
            ),
        }

        let payload_clone = payload.clone();
        let error_kind_owned = error_kind.map(str::to_string);
        let error_message_owned = error_message.clone();
        self.persist(move |db| {
            if final_status == TaskStatus::Completed {
                db.update_task_progress(task_id, 100)?;
            }
            db.finish_task(
                task_id,
                final_status,
                error_kind_owned.as_deref(),
                error_message_owned.as_deref(),
                payload_clone.as_ref(),
            )
        });

        self.inner.bus.close(task_id, final_status);
        if was_running {
            self.pump();
        }
    }

    // ── Persistence ───────────────────────────────────────────────────

    /// Apply a store write with at-least-once semantics. The in-memory
    /// transition has already happened; failures here are retried in the
    /// background and logged, never surfaced to the transition.
    fn persist<F>(&self, write: F)
    where
        F: Fn(&crate::db::Db) -> anyhow::Result<()> + Clone + Send + Sync + 'static,
    {
        let db = self.inner.db.clone();
        tokio::spawn(async move {
            for attempt in 1..=3u32 {
                let write = write.clone();
                match db.call(move |db| write(db)).await {
                    Ok(()) => return,
                    Err(e) if attempt < 3 => {
                        warn!(attempt, error = %e, "store write failed; retrying");
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                    }
                    Err(e) => {
                        error!(error = %e, "store write failed after retries; in-memory state is authoritative");
                    }
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.inner.state.lock().expect("runtime state poisoned")
    }
}
