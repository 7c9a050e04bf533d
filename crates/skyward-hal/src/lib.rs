//! `skyward-hal` – Hardware Module Registry
//!
//! Tracks every hardware module attached to the facility: what it can do,
//! whether it is alive, and which task currently holds it.
//!
//! # Modules
//!
//! - [`registry`] – [`ModuleRegistry`]: module records, atomic multi-module
//!   leases, heartbeat sweeps and operator controls, plus the [`allocate`]
//!   set-cover helper used by the scheduler.
//! - [`health`] – [`HeartbeatPolicy`]: interval / miss-limit liveness rules.
//! - [`fault`] – [`FaultPolicy`] and [`FaultHistory`]: decides when repeated
//!   fault codes reported in heartbeats take a module out of service.

pub mod fault;
pub mod health;
pub mod registry;

pub use fault::{FaultHistory, FaultPolicy, FaultPolicyTable, FaultVerdict};
pub use health::{HeartbeatHealth, HeartbeatPolicy};
pub use registry::{allocate, ModuleInfo, ModuleRegistry, ModuleTransition};
