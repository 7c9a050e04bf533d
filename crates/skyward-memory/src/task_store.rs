//! [`TaskStore`] – observation task records and their lifecycle.
//!
//! Every task moves through a fixed state machine:
//!
//! ```text
//!            ┌──────────────── retry (budget left, retryable) ───────────┐
//!            ▼                                                           │
//!   Pending ──► Scheduled ──► Running ──► Completed                      │
//!      │            │            ├──────► Failed ────────────────────────┘
//!      │            │            └──────► Aborted
//!      │            └───────────────────► Aborted
//!      └──► Failed (WindowExpired / Cancelled only)
//! ```
//!
//! Completed and Aborted are terminal.  Failed is terminal once the retry
//! budget is spent or the reason is not retryable.  Any transition outside
//! this graph is rejected with [`SkyError::InvalidTransition`].
//!
//! Each task lives behind its own mutex.  [`TaskStore::transition_with`]
//! runs a caller-supplied precondition (the executor's lease acquisition)
//! inside that lock, so "lease the modules and mark the task Scheduled"
//! happens as one step.
//!
//! When a [`StateStore`] is attached every change is written through as a
//! JSON snapshot under kind `"task"`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skyward_types::{CapabilitySet, FailureReason, SchedulingWindow, SkyError, TaskId, TaskStatus};
use tracing::{debug, info, warn};

use crate::store::{StateStore, StoreError};

const TASK_KIND: &str = "task";

// ─────────────────────────────────────────────────────────────────────────────
// Task records
// ─────────────────────────────────────────────────────────────────────────────

/// One entry in a task's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<FailureReason>,
}

/// Everything a caller supplies to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub priority: i32,
    pub capabilities: CapabilitySet,
    pub window: SchedulingWindow,
    /// Opaque target description forwarded to modules.
    pub payload: Value,
    pub max_retries: u32,
}

/// Snapshot of an observation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub priority: i32,
    pub capabilities: CapabilitySet,
    pub window: SchedulingWindow,
    pub payload: Value,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<FailureReason>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<TransitionRecord>,
}

impl Task {
    /// A Failed task that may still go back to Pending.
    pub fn awaiting_retry(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.retry_count < self.max_retries
            && self.last_error.as_ref().is_some_and(FailureReason::is_retryable)
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Aborted => true,
            TaskStatus::Failed => !self.awaiting_retry(),
            _ => false,
        }
    }

    /// Whether `to` (with `reason`) is an edge of the lifecycle graph from
    /// the current state.
    pub fn can_transition(&self, to: TaskStatus, reason: Option<&FailureReason>) -> bool {
        use TaskStatus::*;
        match (self.status, to) {
            (Pending, Scheduled) | (Scheduled, Running) | (Running, Completed) => true,
            (Pending, Failed) => reason.is_some_and(|r| !r.is_retryable()),
            (Running, Failed) => reason.is_some(),
            (Scheduled, Aborted) | (Running, Aborted) => true,
            (Failed, Pending) => self.awaiting_retry(),
            _ => false,
        }
    }
}

/// Result of [`TaskStore::cancel`].
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The task was not in flight and is now terminal.
    Cancelled(Task),
    /// The task is Scheduled or Running; its executor must abort it.
    InFlight(TaskStatus),
}

// ─────────────────────────────────────────────────────────────────────────────
// TaskStore
// ─────────────────────────────────────────────────────────────────────────────

type Record = Arc<Mutex<Task>>;

/// Concurrent task table with optional write-through persistence.
///
/// # Example
///
/// ```rust
/// use chrono::{Duration, Utc};
/// use serde_json::json;
/// use skyward_memory::task_store::{NewTask, TaskStore};
/// use skyward_types::{Capability, SchedulingWindow, TaskStatus};
///
/// let store = TaskStore::new();
/// let now = Utc::now();
/// let id = store.submit(NewTask {
///     priority: 5,
///     capabilities: [Capability::Imaging].into(),
///     window: SchedulingWindow::new(now, now + Duration::hours(1)),
///     payload: json!({ "target": "M31" }),
///     max_retries: 2,
/// }, now);
///
/// store.transition(id, TaskStatus::Scheduled, None).unwrap();
/// // Completed is only reachable from Running.
/// assert!(store.transition(id, TaskStatus::Completed, None).is_err());
/// ```
pub struct TaskStore {
    tasks: RwLock<BTreeMap<TaskId, Record>>,
    next_id: AtomicU64,
    persistence: Option<Arc<dyn StateStore>>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            persistence: None,
        }
    }

    /// Write every task snapshot through to `store`.
    pub fn with_persistence(store: Arc<dyn StateStore>) -> Self {
        Self {
            persistence: Some(store),
            ..Self::new()
        }
    }

    /// Rebuild a store from the tasks persisted in `store`.
    ///
    /// Tasks that were Scheduled or Running when the process stopped are
    /// marked Aborted with [`FailureReason::Interrupted`].  Failed tasks
    /// still awaiting a retry lost their backoff timer with the process, so
    /// they go straight back to Pending.  New ids continue after the highest
    /// restored one.
    pub fn restore(store: Arc<dyn StateStore>, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let mut tasks = BTreeMap::new();
        let mut max_id = 0;
        for (key, body) in store.list(TASK_KIND)? {
            let mut task: Task = serde_json::from_value(body)?;
            if matches!(task.status, TaskStatus::Scheduled | TaskStatus::Running) {
                warn!(task = %task.id, status = %task.status, "task interrupted by restart");
                apply(&mut task, TaskStatus::Aborted, Some(FailureReason::Interrupted), now);
                store.put(TASK_KIND, &key, &serde_json::to_value(&task)?)?;
            } else if task.awaiting_retry() {
                info!(task = %task.id, retry = task.retry_count + 1, "re-queueing retry after restart");
                apply(&mut task, TaskStatus::Pending, None, now);
                store.put(TASK_KIND, &key, &serde_json::to_value(&task)?)?;
            }
            max_id = max_id.max(task.id.0);
            tasks.insert(task.id, Arc::new(Mutex::new(task)));
        }
        info!(count = tasks.len(), "tasks restored");
        Ok(Self {
            tasks: RwLock::new(tasks),
            next_id: AtomicU64::new(max_id + 1),
            persistence: Some(store),
        })
    }

    /// Store a new Pending task and return its id.  Validation (capability
    /// availability, window sanity) is the caller's job.
    pub fn submit(&self, new: NewTask, now: DateTime<Utc>) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let task = Task {
            id,
            priority: new.priority,
            capabilities: new.capabilities,
            window: new.window,
            payload: new.payload,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            last_error: None,
            submitted_at: now,
            updated_at: now,
            history: Vec::new(),
        };
        self.persist(&task);
        info!(task = %id, priority = task.priority, capabilities = ?task.capabilities, "task submitted");
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(task)));
        id
    }

    pub fn get(&self, id: TaskId) -> Result<Task, SkyError> {
        Ok(lock(&self.record(id)?).clone())
    }

    /// Snapshots of every task, optionally filtered by status, in id order.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.records()
            .iter()
            .map(|r| lock(r).clone())
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect()
    }

    /// Number of tasks currently Scheduled or Running.
    pub fn in_flight(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(lock(r).status, TaskStatus::Scheduled | TaskStatus::Running))
            .count()
    }

    /// Move task `id` to `to`.
    ///
    /// # Errors
    ///
    /// - [`SkyError::NotFound`] – unknown id.
    /// - [`SkyError::InvalidTransition`] – not an edge of the lifecycle graph.
    pub fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        reason: Option<FailureReason>,
    ) -> Result<Task, SkyError> {
        self.transition_with(id, to, reason, |_| Ok(()))
            .map(|(task, ())| task)
    }

    /// Like [`transition`](Self::transition), but first runs `precondition`
    /// against the current snapshot while holding the task lock.  When the
    /// precondition fails the task is left untouched and its error is
    /// returned.
    pub fn transition_with<R>(
        &self,
        id: TaskId,
        to: TaskStatus,
        reason: Option<FailureReason>,
        precondition: impl FnOnce(&Task) -> Result<R, SkyError>,
    ) -> Result<(Task, R), SkyError> {
        let record = self.record(id)?;
        let mut task = lock(&record);
        if !task.can_transition(to, reason.as_ref()) {
            debug!(task = %id, from = %task.status, %to, "transition rejected");
            return Err(SkyError::InvalidTransition {
                task_id: id,
                from: task.status,
                to,
            });
        }
        let extra = precondition(&task)?;
        let from = task.status;
        apply(&mut task, to, reason, Utc::now());
        info!(task = %id, %from, %to, reason = ?task.last_error, retry = task.retry_count, "task transition");
        let snapshot = task.clone();
        drop(task);
        self.persist(&snapshot);
        Ok((snapshot, extra))
    }

    /// Operator cancellation.
    ///
    /// A Pending task fails with [`FailureReason::Cancelled`]; a Failed task
    /// waiting for its retry has its retry withdrawn.  Scheduled and Running
    /// tasks are reported as [`CancelOutcome::InFlight`] for the executor to
    /// abort.
    ///
    /// # Errors
    ///
    /// [`SkyError::NotFound`] or [`SkyError::AlreadyTerminal`].
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome, SkyError> {
        let record = self.record(id)?;
        let mut task = lock(&record);
        if task.is_terminal() {
            return Err(SkyError::AlreadyTerminal(id));
        }
        match task.status {
            TaskStatus::Pending => {
                apply(&mut task, TaskStatus::Failed, Some(FailureReason::Cancelled), Utc::now());
            }
            TaskStatus::Failed => {
                task.last_error = Some(FailureReason::Cancelled);
                task.updated_at = Utc::now();
            }
            status => return Ok(CancelOutcome::InFlight(status)),
        }
        info!(task = %id, "task cancelled");
        let snapshot = task.clone();
        drop(task);
        self.persist(&snapshot);
        Ok(CancelOutcome::Cancelled(snapshot))
    }

    /// Drop a terminal task from memory and from the attached store.
    pub fn purge(&self, id: TaskId) -> Result<Task, SkyError> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let record = tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| SkyError::NotFound(id.to_string()))?;
        let task = lock(&record).clone();
        if !task.is_terminal() {
            return Err(SkyError::NotTerminal(id));
        }
        tasks.remove(&id);
        drop(tasks);
        if let Some(store) = &self.persistence {
            store.delete(TASK_KIND, &id.to_string())?;
        }
        info!(task = %id, "task purged");
        Ok(task)
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn record(&self, id: TaskId) -> Result<Record, SkyError> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| SkyError::NotFound(id.to_string()))
    }

    fn records(&self) -> Vec<Record> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Persistence failures are logged, not propagated: the in-memory state
    /// stays authoritative.
    fn persist(&self, task: &Task) {
        let Some(store) = &self.persistence else {
            return;
        };
        let result = serde_json::to_value(task)
            .map_err(StoreError::from)
            .and_then(|body| store.put(TASK_KIND, &task.id.to_string(), &body));
        if let Err(e) = result {
            warn!(task = %task.id, error = %e, "failed to persist task");
        }
    }
}

fn lock(record: &Record) -> MutexGuard<'_, Task> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

fn apply(task: &mut Task, to: TaskStatus, reason: Option<FailureReason>, now: DateTime<Utc>) {
    let from = task.status;
    if (from, to) == (TaskStatus::Failed, TaskStatus::Pending) {
        task.retry_count += 1;
    }
    if reason.is_some() {
        task.last_error = reason.clone();
    }
    task.status = to;
    task.updated_at = now;
    task.history.push(TransitionRecord {
        from,
        to,
        at: now,
        reason,
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
