//! `skyward-runtime` – scheduling, execution and the facility facade.
//!
//! This crate wires the lower layers together and drives them over time.
//!
//! # Modules
//!
//! - [`config`] – [`FacilityConfig`][config::FacilityConfig]: heartbeat,
//!   safety, retry and concurrency policy, with serde defaults for every
//!   field.
//! - [`scheduler`] – [`plan`][scheduler::plan]: a pure function from task,
//!   module and safety snapshots to the tasks to expire and the tasks to
//!   dispatch.
//! - [`executor`] – [`Executor`][executor::Executor]: one driver per
//!   dispatched task.  Leases modules, issues `Observe` commands, enforces
//!   the command timeout, handles aborts (`Stop` within the stop timeout)
//!   and retries with linear backoff.
//! - [`facility`] – [`Facility`][facility::Facility]: the composition root
//!   and operator API (submit, cancel, register, heartbeat, sensors) plus
//!   the event-driven scheduler loop.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.
//!
//! # Safety gating
//!
//! No task moves to `Running` unless the [`SafetyMonitor`] verdict is
//! `Safe` at that instant, and an `Unsafe` verdict aborts every task that
//! holds a motion-capable module.  [`SafetyMonitor`] is re-exported so
//! callers can name it without depending on `skyward-kernel`.

pub mod config;
mod events;
pub mod executor;
pub mod facility;
pub mod scheduler;
pub mod telemetry;

pub use config::FacilityConfig;
pub use executor::{Executor, ExecutorSettings, LeaseGuard};
pub use facility::Facility;
pub use scheduler::{plan, Dispatch, Plan, SchedulerInput};
pub use telemetry::{init_tracing, TracerProviderGuard};

pub use skyward_kernel::SafetyMonitor;
