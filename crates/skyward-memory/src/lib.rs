//! `skyward-memory` – The Task Ledger.
//!
//! Owns observation tasks from submission to purge and persists them,
//! utilizing a local SQLite substrate when durability is wanted.
//!
//! # Modules
//!
//! - [`task_store`] – [`TaskStore`][task_store::TaskStore]: per-task locked
//!   records, the task lifecycle state machine, cancellation and restart
//!   recovery.
//! - [`store`] – the [`StateStore`][store::StateStore] persistence contract
//!   with in-memory and SQLite backends.

pub mod store;
pub mod task_store;

pub use store::{MemoryStore, SqliteStore, StateStore, StoreError};
pub use task_store::{CancelOutcome, NewTask, Task, TaskStore, TransitionRecord};
