//! `skyward-kernel` – Environmental Safety
//!
//! Decides whether the sky is fit for moving hardware.  It does not schedule
//! anything; it only publishes a verdict that everything else must obey.
//!
//! # Modules
//!
//! - [`safety`] – [`SafetyMonitor`][safety::SafetyMonitor]: folds readings
//!   from every environmental sensor into one debounced
//!   [`SafetyVerdict`][skyward_types::SafetyVerdict] and notifies
//!   subscribers on every transition.
//! - [`rules`] – [`ReadingVerifier`][rules::ReadingVerifier]: facility limit
//!   rules (wind speed, humidity, ...) that can override a sensor's own
//!   safe flag.

pub mod rules;
pub mod safety;

pub use rules::{LimitRule, ReadingVerifier, Rule, RuleViolation, SensorReading};
pub use safety::{SafetyCallback, SafetyMonitor, SafetyState, SafetyTransition, SensorSpec, SourceState};
