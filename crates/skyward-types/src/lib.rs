use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A capability label advertised by a module and required by a task.
///
/// Modules of very different kinds are treated uniformly by the core: a
/// module is just a set of these labels plus a command endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Telescope mount (slewing / tracking).
    Mount,
    /// Camera or any other image-producing instrument.
    Imaging,
    /// Focus drive.
    Focuser,
    /// Dome or roof.
    Dome,
    /// Filter wheel.
    FilterWheel,
    /// Environmental sensor station.
    Weather,
    /// Site-specific capability not known to the core.
    Other(String),
}

impl Capability {
    /// `true` for capabilities backed by hardware that physically moves and
    /// must be halted when the site becomes unsafe.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Capability::Mount | Capability::Dome | Capability::Focuser | Capability::FilterWheel
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Mount => write!(f, "mount"),
            Capability::Imaging => write!(f, "imaging"),
            Capability::Focuser => write!(f, "focuser"),
            Capability::Dome => write!(f, "dome"),
            Capability::FilterWheel => write!(f, "filter_wheel"),
            Capability::Weather => write!(f, "weather"),
            Capability::Other(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for Capability {
    type Err = SkyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_ascii_lowercase();
        if label.is_empty() {
            return Err(SkyError::Config("empty capability label".to_string()));
        }
        Ok(match label.as_str() {
            "mount" => Capability::Mount,
            "imaging" | "camera" => Capability::Imaging,
            "focuser" => Capability::Focuser,
            "dome" => Capability::Dome,
            "filter_wheel" | "filterwheel" => Capability::FilterWheel,
            "weather" => Capability::Weather,
            _ => Capability::Other(label),
        })
    }
}

/// Ordered set of capability labels.
pub type CapabilitySet = BTreeSet<Capability>;

/// `true` when any capability in `caps` is motion-capable.
pub fn requires_motion(caps: &CapabilitySet) -> bool {
    caps.iter().any(Capability::is_motion)
}

/// Stable identifier of a hardware module (e.g. `"mount-1"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier for a module that registered
    /// without a name.
    pub fn generate() -> Self {
        Self(format!("module-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an observation task.  Assigned in submission order, so the
/// numeric ordering doubles as the final scheduling tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = SkyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("task-");
        digits
            .parse::<u64>()
            .map(TaskId)
            .map_err(|_| SkyError::NotFound(s.to_string()))
    }
}

/// Lifecycle state of a module as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Offline,
    Idle,
    Leased,
    Error,
    Disabled,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleStatus::Offline => "offline",
            ModuleStatus::Idle => "idle",
            ModuleStatus::Leased => "leased",
            ModuleStatus::Error => "error",
            ModuleStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = SkyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "aborted" => Ok(TaskStatus::Aborted),
            other => Err(SkyError::Config(format!("unknown task status '{other}'"))),
        }
    }
}

/// Aggregated site safety judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyVerdict {
    Safe,
    Unsafe,
    Unknown,
}

impl fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyVerdict::Safe => "safe",
            SafetyVerdict::Unsafe => "unsafe",
            SafetyVerdict::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Health payload carried by a module heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthInfo {
    /// Fault codes currently raised by the module (e.g. `"ERR_Azimuth_ETELError"`).
    #[serde(default)]
    pub faults: Vec<String>,
}

impl HealthInfo {
    /// A heartbeat with no faults raised.
    pub fn nominal() -> Self {
        Self::default()
    }

    pub fn with_fault(code: impl Into<String>) -> Self {
        Self {
            faults: vec![code.into()],
        }
    }
}

/// Earliest / latest start bounds of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingWindow {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl SchedulingWindow {
    pub fn new(earliest: DateTime<Utc>, latest: DateTime<Utc>) -> Self {
        Self { earliest, latest }
    }

    /// Inclusive on both bounds.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.earliest <= now && now <= self.latest
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.latest
    }
}

/// Why a task left the happy path.  Recorded on the task as `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The latest-start bound passed before the task started.
    WindowExpired,
    /// A module command did not resolve in time.
    Timeout,
    /// A module command resolved with an error.
    CommandFailure(String),
    /// Forced termination because the site became unsafe.
    SafetyAbort,
    /// A leased module went offline, faulted or was disabled.
    ModuleLost(ModuleId),
    /// Operator cancellation.
    Cancelled,
    /// The process stopped while the task was in flight.
    Interrupted,
}

impl FailureReason {
    /// Only gateway-level failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::CommandFailure(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::WindowExpired => write!(f, "window expired"),
            FailureReason::Timeout => write!(f, "command timeout"),
            FailureReason::CommandFailure(reason) => write!(f, "command failure: {reason}"),
            FailureReason::SafetyAbort => write!(f, "safety abort"),
            FailureReason::ModuleLost(id) => write!(f, "module {id} lost"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Uniform command sent to any module through the messaging gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    /// Perform the module's share of an observation.  The payload is the
    /// task's opaque target description.
    Observe {
        task_id: TaskId,
        payload: serde_json::Value,
    },
    /// Halt motion and abandon the given task.
    Stop { task_id: TaskId },
}

impl Command {
    pub fn task_id(&self) -> TaskId {
        match self {
            Command::Observe { task_id, .. } | Command::Stop { task_id } => *task_id,
        }
    }
}

/// Resolution of a single module command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CommandOutcome {
    Success,
    Failure(String),
    Timeout,
}

/// Asynchronous status notification emitted by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Heartbeat {
        module_id: ModuleId,
        health: HealthInfo,
    },
    Fault {
        module_id: ModuleId,
        code: String,
    },
}

impl StatusEvent {
    pub fn module_id(&self) -> &ModuleId {
        match self {
            StatusEvent::Heartbeat { module_id, .. } | StatusEvent::Fault { module_id, .. } => {
                module_id
            }
        }
    }
}

/// Unified event wrapper for the facility event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "skyward-runtime::executor"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// State changes routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    ModuleStatusChanged {
        module_id: ModuleId,
        from: ModuleStatus,
        to: ModuleStatus,
    },
    SafetyVerdictChanged {
        from: SafetyVerdict,
        to: SafetyVerdict,
    },
    TaskSubmitted {
        task_id: TaskId,
    },
    TaskTransitioned {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<FailureReason>,
    },
    CommandIssued {
        module_id: ModuleId,
        command: Command,
    },
    CommandResolved {
        module_id: ModuleId,
        task_id: TaskId,
        outcome: CommandOutcome,
    },
}

/// Global error type spanning lease contention, lifecycle violations,
/// gateway failures and persistence.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkyError {
    #[error("Lease conflict on module {0}")]
    Conflict(ModuleId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown module: {0}")]
    UnknownModule(ModuleId),

    #[error("Invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("No registered module advertises capability {0}")]
    NoCapableModule(Capability),

    #[error("Task requires no capabilities")]
    NoCapabilities,

    #[error("Invalid scheduling window: {0}")]
    InvalidWindow(String),

    #[error("Task {0} is already terminal")]
    AlreadyTerminal(TaskId),

    #[error("Task {0} is still active")]
    NotTerminal(TaskId),

    #[error("Task {0} missed its scheduling window")]
    WindowExpired(TaskId),

    #[error("Command to {0} timed out")]
    Timeout(ModuleId),

    #[error("Command to {module_id} failed: {reason}")]
    CommandFailure { module_id: ModuleId, reason: String },

    #[error("Task {0} aborted: site unsafe")]
    SafetyAbort(TaskId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
