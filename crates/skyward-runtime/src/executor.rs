//! [`Executor`] – drives dispatched tasks through their modules.
//!
//! For every dispatched task the executor:
//!
//! 1. leases the chosen modules and moves the task Pending → Scheduled in
//!    one step, under the task's record lock;
//! 2. spawns a driver that re-checks safety, moves the task to Running and
//!    sends an `Observe` command to every leased module;
//! 3. resolves the task from the command outcomes: Completed when all
//!    succeed, Failed on the first failure or timeout;
//! 4. releases the leases on every exit path through a [`LeaseGuard`];
//! 5. re-queues a retryable failure (Failed → Pending) after a linear
//!    backoff while the retry budget lasts.
//!
//! A running task can be aborted at any time through a per-run `watch`
//! channel ([`Executor::abort`], [`Executor::abort_motion_tasks`],
//! [`Executor::abort_holding`]).  The driver then sends a best-effort `Stop`
//! to every module that is not Offline, waits at most `stop_timeout` for the
//! acknowledgements, and marks the task Aborted.  Aborted tasks are never
//! retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use skyward_hal::ModuleRegistry;
use skyward_kernel::SafetyMonitor;
use skyward_memory::{Task, TaskStore};
use skyward_middleware::{EventBus, MessagingGateway};
use skyward_types::{
    requires_motion, CapabilitySet, Command, CommandOutcome, EventPayload, FailureReason,
    ModuleId, ModuleStatus, SafetyVerdict, SkyError, TaskId, TaskStatus,
};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::FacilityConfig;
use crate::events::{emit, emit_module, emit_task};

const SOURCE: &str = "skyward-runtime::executor";

/// Timing knobs of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub command_timeout: Duration,
    pub stop_timeout: Duration,
    pub retry_backoff: Duration,
}

impl From<&FacilityConfig> for ExecutorSettings {
    fn from(cfg: &FacilityConfig) -> Self {
        Self {
            command_timeout: cfg.command_timeout(),
            stop_timeout: cfg.stop_timeout(),
            retry_backoff: cfg.retry_backoff(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Leases
// ────────────────────────────────────────────────────────────────────────────

/// Releases a task's module leases when dropped.
///
/// Only leases still held by the owning task are released, so a guard that
/// outlives an operator intervention cannot free somebody else's lease.
pub struct LeaseGuard {
    registry: Arc<ModuleRegistry>,
    bus: EventBus,
    task_id: TaskId,
    modules: Vec<ModuleId>,
}

impl LeaseGuard {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        bus: EventBus,
        task_id: TaskId,
        modules: Vec<ModuleId>,
    ) -> Self {
        Self {
            registry,
            bus,
            task_id,
            modules,
        }
    }

    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        for module in &self.modules {
            if let Some(t) = self.registry.release_if_held(module, self.task_id) {
                emit_module(&self.bus, SOURCE, &t);
            }
        }
        debug!(task = %self.task_id, modules = ?self.modules, "leases released");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Run bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Book-keeping for one dispatched task.
struct ActiveRun {
    modules: Vec<ModuleId>,
    motion: bool,
    abort: watch::Sender<Option<FailureReason>>,
}

impl ActiveRun {
    /// Request an abort; the first reason wins.
    fn signal(&self, reason: FailureReason) {
        self.abort.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

/// How one attempt ended.
enum Attempt {
    Completed,
    Failed(FailureReason),
    Aborted {
        reason: FailureReason,
        /// Whether Observe commands went out (and Stop is needed).
        commanded: bool,
    },
}

struct Shared {
    tasks: Arc<TaskStore>,
    registry: Arc<ModuleRegistry>,
    safety: Arc<SafetyMonitor>,
    gateway: Arc<dyn MessagingGateway>,
    bus: EventBus,
    settings: ExecutorSettings,
    runs: Mutex<HashMap<TaskId, ActiveRun>>,
}

impl Shared {
    fn runs(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Executor
// ────────────────────────────────────────────────────────────────────────────

/// Cheaply cloneable handle; clones share the same run table.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub fn new(
        tasks: Arc<TaskStore>,
        registry: Arc<ModuleRegistry>,
        safety: Arc<SafetyMonitor>,
        gateway: Arc<dyn MessagingGateway>,
        bus: EventBus,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks,
                registry,
                safety,
                gateway,
                bus,
                settings,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Lease `modules` for `task_id`, mark it Scheduled and spawn its
    /// driver.  Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`SkyError::SafetyAbort`] – the site is not Safe.
    /// - [`SkyError::NoCapableModule`] – `modules` do not cover the task.
    /// - [`SkyError::Conflict`] / [`SkyError::UnknownModule`] – leasing failed.
    /// - [`SkyError::InvalidTransition`] / [`SkyError::NotFound`] – the task
    ///   is not Pending.
    ///
    /// On error nothing is leased and the task is unchanged.
    #[instrument(skip(self, modules), fields(task = %task_id))]
    pub fn start(&self, task_id: TaskId, modules: Vec<ModuleId>) -> Result<(), SkyError> {
        let shared = &self.shared;
        // Held across the transition so an abort issued right after the
        // lease cannot miss this run.
        let mut runs = shared.runs();

        let (task, leased) =
            shared
                .tasks
                .transition_with(task_id, TaskStatus::Scheduled, None, |task| {
                    if shared.safety.verdict() != SafetyVerdict::Safe {
                        return Err(SkyError::SafetyAbort(task_id));
                    }
                    let offered: CapabilitySet = modules
                        .iter()
                        .filter_map(|m| shared.registry.get(m).ok())
                        .flat_map(|info| info.capabilities)
                        .collect();
                    if let Some(missing) = task.capabilities.iter().find(|c| !offered.contains(*c)) {
                        return Err(SkyError::NoCapableModule(missing.clone()));
                    }
                    shared.registry.lease_all(&modules, task_id)
                })?;

        let motion = requires_motion(&task.capabilities)
            || modules
                .iter()
                .any(|m| shared.registry.get(m).is_ok_and(|i| i.is_motion_capable()));
        let (abort_tx, abort_rx) = watch::channel(None);
        runs.insert(
            task_id,
            ActiveRun {
                modules: modules.clone(),
                motion,
                abort: abort_tx,
            },
        );
        drop(runs);

        emit_task(&shared.bus, SOURCE, &task);
        for t in &leased {
            emit_module(&shared.bus, SOURCE, t);
        }
        info!(modules = ?modules, motion, "task dispatched");

        let guard = LeaseGuard::new(
            Arc::clone(&shared.registry),
            shared.bus.clone(),
            task_id,
            modules,
        );
        tokio::spawn(self.clone().drive(task, guard, abort_rx));
        Ok(())
    }

    /// Ask the driver of `task_id` to abort.  Returns `false` when the task
    /// is not being executed.
    #[instrument(skip(self), fields(task = %task_id))]
    pub fn abort(&self, task_id: TaskId, reason: FailureReason) -> bool {
        match self.shared.runs().get(&task_id) {
            Some(run) => {
                warn!(%reason, "abort requested");
                run.signal(reason);
                true
            }
            None => false,
        }
    }

    /// Abort every active task that involves motion-capable hardware.
    pub fn abort_motion_tasks(&self, reason: FailureReason) -> Vec<TaskId> {
        self.abort_where(|run| run.motion, reason)
    }

    /// Abort the task holding a lease on `module_id`, if any.
    pub fn abort_holding(&self, module_id: &ModuleId, reason: FailureReason) -> Option<TaskId> {
        self.abort_where(|run| run.modules.contains(module_id), reason)
            .into_iter()
            .next()
    }

    /// Abort everything (process shutdown).
    pub fn abort_all(&self, reason: FailureReason) -> Vec<TaskId> {
        self.abort_where(|_| true, reason)
    }

    /// Ids of tasks currently being driven.
    pub fn active(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.shared.runs().keys().copied().collect();
        ids.sort();
        ids
    }

    fn abort_where(&self, predicate: impl Fn(&ActiveRun) -> bool, reason: FailureReason) -> Vec<TaskId> {
        let runs = self.shared.runs();
        let mut aborted: Vec<TaskId> = runs
            .iter()
            .filter(|(_, run)| predicate(run))
            .map(|(id, run)| {
                run.signal(reason.clone());
                *id
            })
            .collect();
        aborted.sort();
        if !aborted.is_empty() {
            warn!(tasks = ?aborted, %reason, "aborting tasks");
        }
        aborted
    }

    // ── driver ───────────────────────────────────────────────────────────────

    #[instrument(skip_all, fields(task = %task.id))]
    async fn drive(
        self,
        task: Task,
        guard: LeaseGuard,
        mut abort_rx: watch::Receiver<Option<FailureReason>>,
    ) {
        let id = task.id;
        let finished = match self.attempt(&task, guard.modules(), &mut abort_rx).await {
            Attempt::Completed => self.finish(id, TaskStatus::Completed, None),
            Attempt::Failed(reason) => self.finish(id, TaskStatus::Failed, Some(reason)),
            Attempt::Aborted { reason, commanded } => {
                if commanded {
                    self.stop_modules(id, guard.modules()).await;
                }
                self.finish(id, TaskStatus::Aborted, Some(reason))
            }
        };
        self.shared.runs().remove(&id);
        drop(guard);

        if let Some(task) = finished
            && task.awaiting_retry()
        {
            self.requeue(task).await;
        }
    }

    async fn attempt(
        &self,
        task: &Task,
        modules: &[ModuleId],
        abort_rx: &mut watch::Receiver<Option<FailureReason>>,
    ) -> Attempt {
        let shared = &self.shared;
        let id = task.id;

        let mut blocked: Option<FailureReason> = None;
        let started = shared
            .tasks
            .transition_with(id, TaskStatus::Running, None, |_| {
                blocked = abort_rx.borrow().clone().or_else(|| {
                    (shared.safety.verdict() != SafetyVerdict::Safe)
                        .then_some(FailureReason::SafetyAbort)
                });
                match blocked {
                    Some(_) => Err(SkyError::SafetyAbort(id)),
                    None => Ok(()),
                }
            });
        if let Some(reason) = blocked {
            return Attempt::Aborted {
                reason,
                commanded: false,
            };
        }
        match started {
            Ok((running, ())) => emit_task(&shared.bus, SOURCE, &running),
            Err(e) => {
                warn!(error = %e, "task could not start");
                return Attempt::Aborted {
                    reason: FailureReason::Interrupted,
                    commanded: false,
                };
            }
        }

        let handles = join_all(modules.iter().map(|module| async move {
            let command = Command::Observe {
                task_id: id,
                payload: task.payload.clone(),
            };
            emit(
                &shared.bus,
                SOURCE,
                EventPayload::CommandIssued {
                    module_id: module.clone(),
                    command: command.clone(),
                },
            );
            (module.clone(), shared.gateway.send_command(module, command).await)
        }))
        .await;

        let limit = shared.settings.command_timeout;
        let outcomes = join_all(
            handles
                .into_iter()
                .map(|(module, handle)| async move { (module, handle.outcome_within(limit).await) }),
        );

        tokio::select! {
            results = outcomes => {
                let mut failure = None;
                for (module, outcome) in results {
                    emit(&shared.bus, SOURCE, EventPayload::CommandResolved {
                        module_id: module.clone(),
                        task_id: id,
                        outcome: outcome.clone(),
                    });
                    let reason = match outcome {
                        CommandOutcome::Success => continue,
                        CommandOutcome::Failure(why) => FailureReason::CommandFailure(format!("{module}: {why}")),
                        CommandOutcome::Timeout => FailureReason::Timeout,
                    };
                    warn!(module = %module, %reason, "command failed");
                    failure.get_or_insert(reason);
                }
                match failure {
                    Some(reason) => Attempt::Failed(reason),
                    None => Attempt::Completed,
                }
            }
            reason = wait_for_abort(abort_rx) => Attempt::Aborted { reason, commanded: true },
        }
    }

    /// Best-effort `Stop` to every module that is still reachable, bounded
    /// by `stop_timeout`.
    async fn stop_modules(&self, id: TaskId, modules: &[ModuleId]) {
        let shared = &self.shared;
        let limit = shared.settings.stop_timeout;
        let reachable: Vec<&ModuleId> = modules
            .iter()
            .filter(|m| {
                shared
                    .registry
                    .status(m)
                    .is_ok_and(|s| s != ModuleStatus::Offline)
            })
            .collect();

        let stops = join_all(reachable.into_iter().map(|module| async move {
            let command = Command::Stop { task_id: id };
            emit(
                &shared.bus,
                SOURCE,
                EventPayload::CommandIssued {
                    module_id: module.clone(),
                    command: command.clone(),
                },
            );
            let outcome = shared
                .gateway
                .send_command(module, command)
                .await
                .outcome_within(limit)
                .await;
            (module.clone(), outcome)
        }));

        match tokio::time::timeout(limit, stops).await {
            Ok(results) => {
                for (module, outcome) in results {
                    if outcome != CommandOutcome::Success {
                        warn!(module = %module, ?outcome, "stop not acknowledged");
                    }
                    emit(
                        &shared.bus,
                        SOURCE,
                        EventPayload::CommandResolved {
                            module_id: module,
                            task_id: id,
                            outcome,
                        },
                    );
                }
            }
            Err(_) => warn!(task = %id, "stop acknowledgements timed out"),
        }
    }

    fn finish(&self, id: TaskId, to: TaskStatus, reason: Option<FailureReason>) -> Option<Task> {
        match self.shared.tasks.transition(id, to, reason) {
            Ok(task) => {
                emit_task(&self.shared.bus, SOURCE, &task);
                Some(task)
            }
            Err(e) => {
                warn!(task = %id, %to, error = %e, "could not record task outcome");
                None
            }
        }
    }

    async fn requeue(&self, task: Task) {
        let attempt = task.retry_count + 1;
        let delay = self.shared.settings.retry_backoff * attempt;
        info!(task = %task.id, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
        tokio::time::sleep(delay).await;
        match self.shared.tasks.transition(task.id, TaskStatus::Pending, None) {
            Ok(task) => emit_task(&self.shared.bus, SOURCE, &task),
            Err(e) => info!(task = %task.id, error = %e, "retry withdrawn"),
        }
    }
}

/// Resolves with the first abort reason sent on `rx`.  Never resolves if the
/// sender goes away without one.
async fn wait_for_abort(rx: &mut watch::Receiver<Option<FailureReason>>) -> FailureReason {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use skyward_hal::{FaultPolicyTable, HeartbeatPolicy};
    use skyward_kernel::SensorSpec;
    use skyward_memory::NewTask;
    use skyward_middleware::{SimBehavior, SimGateway};
    use skyward_types::{Capability, SchedulingWindow};

    struct Rig {
        tasks: Arc<TaskStore>,
        registry: Arc<ModuleRegistry>,
        gateway: SimGateway,
        executor: Executor,
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            command_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(10),
        }
    }

    fn rig_with(safety: SafetyMonitor, settings: ExecutorSettings) -> Rig {
        let tasks = Arc::new(TaskStore::new());
        let registry = Arc::new(ModuleRegistry::new(
            HeartbeatPolicy::default(),
            FaultPolicyTable::default(),
        ));
        let gateway = SimGateway::new();
        let executor = Executor::new(
            Arc::clone(&tasks),
            Arc::clone(&registry),
            Arc::new(safety),
            Arc::new(gateway.clone()),
            EventBus::default(),
            settings,
        );
        let now = Utc::now();
        registry.register(&"mount".into(), [Capability::Mount].into(), now);
        registry.register(&"camera".into(), [Capability::Imaging].into(), now);
        Rig {
            tasks,
            registry,
            gateway,
            executor,
        }
    }

    fn safe_monitor() -> SafetyMonitor {
        let monitor = SafetyMonitor::new(1, []);
        monitor.refresh(Utc::now());
        monitor
    }

    fn rig() -> Rig {
        rig_with(safe_monitor(), settings())
    }

    fn submit(rig: &Rig, caps: &[Capability], max_retries: u32) -> TaskId {
        let now = Utc::now();
        rig.tasks.submit(
            NewTask {
                priority: 1,
                capabilities: caps.iter().cloned().collect(),
                window: SchedulingWindow::new(now, now + ChronoDuration::hours(1)),
                payload: json!({"target": "M42"}),
                max_retries,
            },
            now,
        )
    }

    async fn wait_for(rig: &Rig, id: TaskId, pred: impl Fn(&Task) -> bool) -> Task {
        for _ in 0..400 {
            let task = rig.tasks.get(id).unwrap();
            if pred(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", rig.tasks.get(id));
    }

    fn ids(list: &[&str]) -> Vec<ModuleId> {
        list.iter().map(|s| ModuleId::from(*s)).collect()
    }

    #[tokio::test]
    async fn task_runs_to_completion_and_releases_leases() {
        let rig = rig();
        let id = submit(&rig, &[Capability::Mount, Capability::Imaging], 0);
        rig.executor.start(id, ids(&["camera", "mount"])).unwrap();
        assert_eq!(rig.registry.status(&"mount".into()).unwrap(), ModuleStatus::Leased);

        let task = wait_for(&rig, id, Task::is_terminal).await;
        assert_eq!(task.status, TaskStatus::Completed);
        // The guard is dropped right after the terminal transition.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.executor.active().is_empty());
        for m in ["mount", "camera"] {
            let info = rig.registry.get(&m.into()).unwrap();
            assert_eq!(info.status, ModuleStatus::Idle);
            assert_eq!(info.lease, None);
        }
        assert!(matches!(
            rig.gateway.sent_to(&"camera".into())[..],
            [Command::Observe { .. }]
        ));
    }

    #[tokio::test]
    async fn failure_is_requeued_with_incremented_retry_count() {
        let rig = rig();
        rig.gateway.script(
            &"camera".into(),
            [SimBehavior::Resolve(CommandOutcome::Failure("shutter jam".into()))],
        );
        let id = submit(&rig, &[Capability::Imaging], 2);
        rig.executor.start(id, ids(&["camera"])).unwrap();

        let task = wait_for(&rig, id, |t| t.status == TaskStatus::Pending && t.retry_count == 1).await;
        assert!(matches!(task.last_error, Some(FailureReason::CommandFailure(_))));
        assert_eq!(rig.registry.status(&"camera".into()).unwrap(), ModuleStatus::Idle);

        // Second attempt succeeds (script exhausted).
        rig.executor.start(id, ids(&["camera"])).unwrap();
        let task = wait_for(&rig, id, Task::is_terminal).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn timeout_with_no_budget_is_terminal() {
        let rig = rig_with(
            safe_monitor(),
            ExecutorSettings {
                command_timeout: Duration::from_millis(50),
                ..settings()
            },
        );
        rig.gateway.script(&"camera".into(), [SimBehavior::Hang]);
        let id = submit(&rig, &[Capability::Imaging], 0);
        rig.executor.start(id, ids(&["camera"])).unwrap();
        let task = wait_for(&rig, id, Task::is_terminal).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error, Some(FailureReason::Timeout));
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn motion_abort_stops_modules_and_marks_aborted() {
        let rig = rig();
        rig.gateway.script(&"mount".into(), [SimBehavior::Hang]);
        let id = submit(&rig, &[Capability::Mount], 3);
        rig.executor.start(id, ids(&["mount"])).unwrap();
        wait_for(&rig, id, |t| t.status == TaskStatus::Running).await;

        let started = std::time::Instant::now();
        assert_eq!(rig.executor.abort_motion_tasks(FailureReason::SafetyAbort), vec![id]);
        let task = wait_for(&rig, id, Task::is_terminal).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.last_error, Some(FailureReason::SafetyAbort));
        assert_eq!(task.retry_count, 0);

        let sent = rig.gateway.sent_to(&"mount".into());
        assert!(matches!(sent.last(), Some(Command::Stop { task_id }) if *task_id == id));
    }

    #[tokio::test]
    async fn non_motion_task_survives_motion_abort() {
        let rig = rig();
        rig.gateway.script(&"camera".into(), [SimBehavior::Hang]);
        let id = submit(&rig, &[Capability::Imaging], 0);
        rig.executor.start(id, ids(&["camera"])).unwrap();
        wait_for(&rig, id, |t| t.status == TaskStatus::Running).await;
        assert!(rig.executor.abort_motion_tasks(FailureReason::SafetyAbort).is_empty());
        assert_eq!(rig.executor.active(), vec![id]);
    }

    #[tokio::test]
    async fn start_refused_while_not_safe() {
        let unknown = SafetyMonitor::new(
            1,
            [SensorSpec::required("weather", Duration::from_secs(60))],
        );
        let rig = rig_with(unknown, settings());
        let id = submit(&rig, &[Capability::Imaging], 0);
        let err = rig.executor.start(id, ids(&["camera"])).unwrap_err();
        assert_eq!(err, SkyError::SafetyAbort(id));
        assert_eq!(rig.tasks.get(id).unwrap().status, TaskStatus::Pending);
        assert_eq!(rig.registry.status(&"camera".into()).unwrap(), ModuleStatus::Idle);
    }

    #[tokio::test]
    async fn start_refused_on_lease_conflict() {
        let rig = rig();
        rig.registry.lease(&"camera".into(), TaskId(999)).unwrap();
        let id = submit(&rig, &[Capability::Mount, Capability::Imaging], 0);
        let err = rig.executor.start(id, ids(&["camera", "mount"])).unwrap_err();
        assert_eq!(err, SkyError::Conflict("camera".into()));
        assert_eq!(rig.tasks.get(id).unwrap().status, TaskStatus::Pending);
        assert_eq!(rig.registry.status(&"mount".into()).unwrap(), ModuleStatus::Idle);
    }

    #[tokio::test]
    async fn start_refused_when_modules_do_not_cover_task() {
        let rig = rig();
        let id = submit(&rig, &[Capability::Mount, Capability::Imaging], 0);
        let err = rig.executor.start(id, ids(&["camera"])).unwrap_err();
        assert_eq!(err, SkyError::NoCapableModule(Capability::Mount));
    }

    #[tokio::test]
    async fn lost_module_gets_no_stop_command() {
        let rig = rig();
        rig.gateway.script(&"mount".into(), [SimBehavior::Hang]);
        let id = submit(&rig, &[Capability::Mount], 0);
        rig.executor.start(id, ids(&["mount"])).unwrap();
        wait_for(&rig, id, |t| t.status == TaskStatus::Running).await;

        let later = Utc::now() + ChronoDuration::hours(1);
        let lost = rig.registry.sweep(later);
        assert!(lost.iter().any(|t| t.strands_lease()));
        let mount: ModuleId = "mount".into();
        assert_eq!(
            rig.executor.abort_holding(&mount, FailureReason::ModuleLost(mount.clone())),
            Some(id)
        );
        let task = wait_for(&rig, id, Task::is_terminal).await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.last_error, Some(FailureReason::ModuleLost(mount.clone())));
        assert!(rig
            .gateway
            .sent_to(&mount)
            .iter()
            .all(|c| matches!(c, Command::Observe { .. })));
    }

    #[tokio::test]
    async fn abort_unknown_task_returns_false() {
        let rig = rig();
        assert!(!rig.executor.abort(TaskId(42), FailureReason::Cancelled));
    }
}
