//! `skyward-middleware` – The Nervous System
//!
//! Routes asynchronous traffic between the orchestration core and the
//! outside world without caring about its meaning.
//!
//! # Modules
//!
//! - [`bus`] – headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.
//! - [`gateway`] – the [`MessagingGateway`] contract every transport
//!   implements, and the [`CommandHandle`] returned for each command.
//! - [`sim_gateway`] – [`SimGateway`], an in-process gateway with scripted
//!   outcomes for tests and hardware-free runs.

pub mod bus;
pub mod gateway;
pub mod sim_gateway;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use gateway::{CommandHandle, MessagingGateway};
pub use sim_gateway::{SimBehavior, SimGateway};
