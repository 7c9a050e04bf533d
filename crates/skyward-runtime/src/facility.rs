//! [`Facility`] – the orchestration core, assembled.
//!
//! The facility owns one instance of every component and exposes the
//! operator-facing API:
//!
//! | Area     | Operations |
//! |----------|------------|
//! | Tasks    | [`submit_task`](Facility::submit_task), [`get_task_status`](Facility::get_task_status), [`cancel_task`](Facility::cancel_task), [`list_tasks`](Facility::list_tasks), [`purge_task`](Facility::purge_task) |
//! | Modules  | [`register_module`](Facility::register_module), [`heartbeat`](Facility::heartbeat), [`disable_module`](Facility::disable_module), [`enable_module`](Facility::enable_module), [`clear_module_faults`](Facility::clear_module_faults), [`attach_module_events`](Facility::attach_module_events) |
//! | Safety   | [`report_sensor`](Facility::report_sensor), [`safety_state`](Facility::safety_state) |
//!
//! Every state change is published on the [`EventBus`].  [`Facility::run`]
//! listens to the module-health, safety and task-lifecycle topics plus a
//! periodic tick and calls [`Facility::evaluate`] on each wake-up, which
//! sweeps heartbeats, refreshes sensor staleness, expires tasks and hands
//! the scheduler's picks to the [`Executor`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use serde_json::json;
//! use skyward_middleware::SimGateway;
//! use skyward_runtime::{Facility, FacilityConfig};
//! use skyward_types::{Capability, SchedulingWindow};
//!
//! # async fn demo() -> Result<(), skyward_types::SkyError> {
//! let facility = Arc::new(Facility::new(FacilityConfig::default(), Arc::new(SimGateway::new()))?);
//! facility.register_module([Capability::Imaging].into());
//!
//! let now = Utc::now();
//! let id = facility.submit_task(
//!     5,
//!     [Capability::Imaging].into(),
//!     SchedulingWindow::new(now, now + Duration::hours(2)),
//!     json!({ "target": "M51", "exposure_s": 120 }),
//! )?;
//! facility.evaluate(Utc::now());
//! println!("{:?}", facility.get_task_status(id)?.status);
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use skyward_hal::{ModuleInfo, ModuleRegistry, ModuleTransition};
use skyward_kernel::{SafetyMonitor, SafetyState, SensorReading};
use skyward_memory::{CancelOutcome, NewTask, StateStore, Task, TaskStore};
use skyward_middleware::{EventBus, MessagingGateway, Topic};
use skyward_types::{
    CapabilitySet, EventPayload, FailureReason, HealthInfo, ModuleId, SafetyVerdict,
    SchedulingWindow, SkyError, StatusEvent, TaskId, TaskStatus,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::FacilityConfig;
use crate::events::{emit, emit_module, emit_task};
use crate::executor::{Executor, ExecutorSettings};
use crate::scheduler::{self, Plan, SchedulerInput};

const SOURCE: &str = "skyward-runtime::facility";

pub struct Facility {
    config: FacilityConfig,
    tasks: Arc<TaskStore>,
    registry: Arc<ModuleRegistry>,
    safety: Arc<SafetyMonitor>,
    gateway: Arc<dyn MessagingGateway>,
    bus: EventBus,
    executor: Executor,
    /// Serialises evaluation passes so two passes never dispatch against
    /// the same capacity.
    evaluating: Mutex<()>,
}

impl Facility {
    /// Build a facility with an in-memory task table.
    pub fn new(config: FacilityConfig, gateway: Arc<dyn MessagingGateway>) -> Result<Self, SkyError> {
        Self::assemble(config, gateway, TaskStore::new())
    }

    /// Build a facility whose tasks are persisted in `store`, restoring the
    /// tasks already there.
    pub fn with_store(
        config: FacilityConfig,
        gateway: Arc<dyn MessagingGateway>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, SkyError> {
        let tasks = TaskStore::restore(store, Utc::now())?;
        Self::assemble(config, gateway, tasks)
    }

    fn assemble(
        config: FacilityConfig,
        gateway: Arc<dyn MessagingGateway>,
        tasks: TaskStore,
    ) -> Result<Self, SkyError> {
        config.validate()?;
        let tasks = Arc::new(tasks);
        let registry = Arc::new(ModuleRegistry::new(
            config.heartbeat_policy(),
            config.faults.clone(),
        ));
        let safety = Arc::new(SafetyMonitor::new(
            config.safety_debounce,
            config.sensors.iter().cloned(),
        ));
        let bus = EventBus::default();
        let executor = Executor::new(
            Arc::clone(&tasks),
            Arc::clone(&registry),
            Arc::clone(&safety),
            Arc::clone(&gateway),
            bus.clone(),
            ExecutorSettings::from(&config),
        );

        // Runs on the reporting thread right after the monitor lock is
        // released; it only signals, never waits.
        let (abort_executor, safety_bus) = (executor.clone(), bus.clone());
        safety.subscribe(move |t| {
            emit(
                &safety_bus,
                SOURCE,
                EventPayload::SafetyVerdictChanged {
                    from: t.from,
                    to: t.to,
                },
            );
            if t.to == SafetyVerdict::Unsafe {
                abort_executor.abort_motion_tasks(FailureReason::SafetyAbort);
            }
        });

        info!(
            sensors = config.sensors.len(),
            max_concurrent = config.max_concurrent_tasks,
            "facility assembled"
        );
        Ok(Self {
            config,
            tasks,
            registry,
            safety,
            gateway,
            bus,
            executor,
            evaluating: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &FacilityConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    // ────────────────────────────────────────────────────────────────────────
    // Task API
    // ────────────────────────────────────────────────────────────────────────

    /// Submit a task with the configured retry budget.
    ///
    /// # Errors
    ///
    /// - [`SkyError::NoCapabilities`] – empty capability set.
    /// - [`SkyError::NoCapableModule`] – no registered module advertises one
    ///   of the capabilities.
    /// - [`SkyError::InvalidWindow`] – `earliest > latest`, or `latest` has
    ///   already passed.
    ///
    /// A rejected task is never stored.
    pub fn submit_task(
        &self,
        priority: i32,
        capabilities: CapabilitySet,
        window: SchedulingWindow,
        payload: Value,
    ) -> Result<TaskId, SkyError> {
        self.submit(NewTask {
            priority,
            capabilities,
            window,
            payload,
            max_retries: self.config.max_retries,
        })
    }

    /// Submit a fully specified task.
    #[instrument(skip(self, new), fields(priority = new.priority))]
    pub fn submit(&self, new: NewTask) -> Result<TaskId, SkyError> {
        let now = Utc::now();
        if new.capabilities.is_empty() {
            return Err(SkyError::NoCapabilities);
        }
        if let Some(missing) = new
            .capabilities
            .iter()
            .find(|c| !self.registry.advertises(c))
        {
            return Err(SkyError::NoCapableModule(missing.clone()));
        }
        if new.window.earliest > new.window.latest {
            return Err(SkyError::InvalidWindow(format!(
                "earliest {} is after latest {}",
                new.window.earliest, new.window.latest
            )));
        }
        if new.window.has_expired(now) {
            return Err(SkyError::InvalidWindow(format!(
                "latest {} is already in the past",
                new.window.latest
            )));
        }
        let id = self.tasks.submit(new, now);
        emit(&self.bus, SOURCE, EventPayload::TaskSubmitted { task_id: id });
        Ok(id)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<Task, SkyError> {
        self.tasks.get(id)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.tasks.list(status)
    }

    /// Cancel a task.  Pending tasks fail immediately, a pending retry is
    /// withdrawn, and a Scheduled or Running task is aborted by its driver.
    ///
    /// # Errors
    ///
    /// [`SkyError::NotFound`] or [`SkyError::AlreadyTerminal`].
    #[instrument(skip(self))]
    pub fn cancel_task(&self, id: TaskId) -> Result<(), SkyError> {
        // The driver may finish between the two reads; one retry settles it.
        for _ in 0..2 {
            match self.tasks.cancel(id)? {
                CancelOutcome::Cancelled(task) => {
                    if task
                        .history
                        .last()
                        .is_some_and(|h| h.reason == Some(FailureReason::Cancelled))
                    {
                        emit_task(&self.bus, SOURCE, &task);
                    }
                    return Ok(());
                }
                CancelOutcome::InFlight(_) => {
                    if self.executor.abort(id, FailureReason::Cancelled) {
                        return Ok(());
                    }
                }
            }
        }
        // Lease granted but the driver not yet registered, or the task was
        // re-queued in between; report the state we see.
        let task = self.tasks.get(id)?;
        if task.is_terminal() {
            Err(SkyError::AlreadyTerminal(id))
        } else {
            Err(SkyError::InvalidTransition {
                task_id: id,
                from: task.status,
                to: TaskStatus::Aborted,
            })
        }
    }

    pub fn purge_task(&self, id: TaskId) -> Result<Task, SkyError> {
        self.tasks.purge(id)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Module API
    // ────────────────────────────────────────────────────────────────────────

    /// Register a module under a freshly generated id.
    pub fn register_module(&self, capabilities: CapabilitySet) -> ModuleId {
        let id = ModuleId::generate();
        self.register_named_module(&id, capabilities);
        id
    }

    pub fn register_named_module(&self, id: &ModuleId, capabilities: CapabilitySet) {
        if let Some(t) = self.registry.register(id, capabilities, Utc::now()) {
            emit_module(&self.bus, SOURCE, &t);
        }
    }

    /// # Errors
    ///
    /// [`SkyError::UnknownModule`] for unregistered modules and for Offline
    /// modules that have not re-registered.
    pub fn heartbeat(&self, id: &ModuleId, health: &HealthInfo) -> Result<(), SkyError> {
        let transition = self.registry.heartbeat(id, health, Utc::now())?;
        self.apply_module_transition(transition);
        Ok(())
    }

    pub fn disable_module(&self, id: &ModuleId) -> Result<(), SkyError> {
        let transition = self.registry.disable(id)?;
        self.apply_module_transition(transition);
        Ok(())
    }

    pub fn enable_module(&self, id: &ModuleId) -> Result<(), SkyError> {
        let transition = self.registry.enable(id, Utc::now())?;
        self.apply_module_transition(transition);
        Ok(())
    }

    pub fn clear_module_faults(&self, id: &ModuleId) -> Result<(), SkyError> {
        let transition = self.registry.clear_faults(id)?;
        self.apply_module_transition(transition);
        Ok(())
    }

    pub fn module(&self, id: &ModuleId) -> Result<ModuleInfo, SkyError> {
        self.registry.get(id)
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.registry.snapshot()
    }

    /// Pump the gateway's status stream for `id` into heartbeat and fault
    /// handling.  The returned task ends when the stream does.
    pub fn attach_module_events(self: &Arc<Self>, id: &ModuleId) -> JoinHandle<()> {
        let mut events = self.gateway.subscribe_events(id);
        let facility = Arc::clone(self);
        let module = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let health = match event {
                    StatusEvent::Heartbeat { health, .. } => health,
                    StatusEvent::Fault { code, .. } => HealthInfo::with_fault(code),
                };
                if let Err(e) = facility.heartbeat(&module, &health) {
                    debug!(module = %module, error = %e, "status event rejected");
                }
            }
            debug!(module = %module, "module event stream ended");
        })
    }

    fn apply_module_transition(&self, transition: Option<ModuleTransition>) {
        let Some(t) = transition else {
            return;
        };
        emit_module(&self.bus, SOURCE, &t);
        if t.strands_lease() {
            self.executor
                .abort_holding(&t.module_id, FailureReason::ModuleLost(t.module_id.clone()));
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Safety API
    // ────────────────────────────────────────────────────────────────────────

    /// Feed an environmental reading.  Returns the verdict afterwards.
    pub fn report_sensor(
        &self,
        source: &str,
        reading: SensorReading,
        timestamp: DateTime<Utc>,
    ) -> SafetyVerdict {
        self.safety.update_sensor(source, reading, timestamp);
        self.safety.verdict()
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety.current()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Scheduling loop
    // ────────────────────────────────────────────────────────────────────────

    /// One scheduling pass at `now`.  Must be called from within a Tokio
    /// runtime (dispatch spawns drivers).
    pub fn evaluate(&self, now: DateTime<Utc>) -> Plan {
        let _pass = self.evaluating.lock().unwrap_or_else(PoisonError::into_inner);

        for t in self.registry.sweep(now) {
            self.apply_module_transition(Some(t));
        }
        self.safety.refresh(now);

        let tasks = self.tasks.list(None);
        let modules = self.registry.snapshot();
        let plan = scheduler::plan(SchedulerInput {
            tasks: &tasks,
            modules: &modules,
            verdict: self.safety.verdict(),
            in_flight: self.tasks.in_flight(),
            max_concurrent: self.config.max_concurrent_tasks,
            now,
        });

        for &id in &plan.expired {
            match self
                .tasks
                .transition(id, TaskStatus::Failed, Some(FailureReason::WindowExpired))
            {
                Ok(task) => {
                    warn!(task = %id, "scheduling window expired");
                    emit_task(&self.bus, SOURCE, &task);
                }
                Err(e) => debug!(task = %id, error = %e, "expiry skipped"),
            }
        }
        for dispatch in &plan.dispatch {
            if let Err(e) = self.executor.start(dispatch.task_id, dispatch.modules.clone()) {
                debug!(task = %dispatch.task_id, error = %e, "dispatch skipped");
            }
        }
        plan
    }

    /// Event loop: re-evaluate on every relevant bus event and on every
    /// tick until `shutdown` turns `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut health = self.bus.subscribe_to(Topic::ModuleHealth);
        let mut safety = self.bus.subscribe_to(Topic::Safety);
        let mut lifecycle = self.bus.subscribe_to(Topic::TaskLifecycle);
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(tick_ms = self.config.tick_interval_ms, "scheduler loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tick.tick() => {}
                Some(_) = health.next_event() => {}
                Some(_) = safety.next_event() => {}
                Some(_) = lifecycle.next_event() => {}
            }
            self.evaluate(Utc::now());
        }
        info!("scheduler loop stopped");
    }

    /// Abort everything in flight and wait up to the safety grace period
    /// for the drivers to settle.
    pub async fn shutdown(&self) -> Vec<TaskId> {
        let aborted = self.executor.abort_all(FailureReason::Interrupted);
        let deadline = tokio::time::Instant::now() + self.config.safety_grace();
        while !self.executor.active().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.executor.active().is_empty() {
            warn!(tasks = ?self.executor.active(), "tasks still active at shutdown");
        }
        aborted
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
