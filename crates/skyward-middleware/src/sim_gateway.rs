//! In-process simulated gateway for CI and hardware-free operation.
//!
//! [`SimGateway`] answers every command after a configurable latency.  Tests
//! script per-module behaviour ([`SimBehavior`]) to produce failures,
//! timeouts or commands that never resolve, inspect the command log, and
//! inject [`StatusEvent`]s into the per-module event streams.
//!
//! # Example
//!
//! ```rust
//! use skyward_middleware::sim_gateway::{SimBehavior, SimGateway};
//! use skyward_types::{CommandOutcome, ModuleId};
//!
//! let gateway = SimGateway::new();
//! gateway.script(
//!     &ModuleId::from("camera-1"),
//!     [SimBehavior::Resolve(CommandOutcome::Failure("shutter stuck".into()))],
//! );
//! assert!(gateway.sent().is_empty());
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use skyward_types::{Command, CommandOutcome, ModuleId, StatusEvent};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::gateway::{CommandHandle, MessagingGateway};

const EVENT_CAPACITY: usize = 64;

/// Scripted reaction of a simulated module to one `Observe` command.
#[derive(Debug, Clone)]
pub enum SimBehavior {
    /// Resolve with the given outcome after the gateway latency.
    Resolve(CommandOutcome),
    /// Never resolve.  Lets the caller's own timeout fire.
    Hang,
}

#[derive(Default)]
struct SimState {
    latency: Duration,
    scripts: HashMap<ModuleId, VecDeque<SimBehavior>>,
    unreachable: HashSet<ModuleId>,
    sent: Vec<(ModuleId, Command)>,
    events: HashMap<ModuleId, broadcast::Sender<StatusEvent>>,
    /// Senders of hung commands, kept alive so their handles stay pending.
    hung: Vec<oneshot::Sender<CommandOutcome>>,
}

/// Simulated [`MessagingGateway`].  Clones share state.
#[derive(Clone, Default)]
pub struct SimGateway {
    state: Arc<Mutex<SimState>>,
}

impl SimGateway {
    /// A gateway that answers every command successfully with a 5 ms latency.
    pub fn new() -> Self {
        Self::with_latency(Duration::from_millis(5))
    }

    pub fn with_latency(latency: Duration) -> Self {
        let gateway = Self::default();
        gateway.lock().latency = latency;
        gateway
    }

    /// Queue behaviours for the next `Observe` commands sent to `module_id`.
    /// Once the queue is drained the module answers with success again.
    pub fn script(&self, module_id: &ModuleId, behaviors: impl IntoIterator<Item = SimBehavior>) {
        self.lock()
            .scripts
            .entry(module_id.clone())
            .or_default()
            .extend(behaviors);
    }

    /// Make every command to `module_id` fail immediately, stop commands
    /// included.
    pub fn set_unreachable(&self, module_id: &ModuleId, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(module_id.clone());
        } else {
            state.unreachable.remove(module_id);
        }
    }

    /// Every command sent so far, in order.
    pub fn sent(&self) -> Vec<(ModuleId, Command)> {
        self.lock().sent.clone()
    }

    /// Commands sent to one module.
    pub fn sent_to(&self, module_id: &ModuleId) -> Vec<Command> {
        self.lock()
            .sent
            .iter()
            .filter(|(id, _)| id == module_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Inject a status event into the module's event stream.  Returns the
    /// number of live subscribers.
    pub fn emit(&self, event: StatusEvent) -> usize {
        let sender = self.event_sender(event.module_id());
        sender.send(event).unwrap_or(0)
    }

    fn event_sender(&self, module_id: &ModuleId) -> broadcast::Sender<StatusEvent> {
        self.lock()
            .events
            .entry(module_id.clone())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessagingGateway for SimGateway {
    async fn send_command(&self, module_id: &ModuleId, command: Command) -> CommandHandle {
        let (behavior, latency) = {
            let mut state = self.lock();
            state.sent.push((module_id.clone(), command.clone()));
            if state.unreachable.contains(module_id) {
                return CommandHandle::resolved(CommandOutcome::Failure(format!(
                    "{module_id} unreachable"
                )));
            }
            let behavior = match command {
                Command::Observe { .. } => state
                    .scripts
                    .get_mut(module_id)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(SimBehavior::Resolve(CommandOutcome::Success)),
                Command::Stop { .. } => SimBehavior::Resolve(CommandOutcome::Success),
            };
            (behavior, state.latency)
        };

        debug!(module = %module_id, ?command, ?behavior, "sim gateway command");
        let (tx, handle) = CommandHandle::channel();
        match behavior {
            SimBehavior::Resolve(outcome) => {
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    let _ = tx.send(outcome);
                });
            }
            SimBehavior::Hang => {
                let mut state = self.lock();
                state.hung.retain(|tx| !tx.is_closed());
                state.hung.push(tx);
            }
        }
        handle
    }

    fn subscribe_events(&self, module_id: &ModuleId) -> BoxStream<'static, StatusEvent> {
        let receiver = self.event_sender(module_id).subscribe();
        stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyward_types::{HealthInfo, TaskId};

    fn observe(task: u64) -> Command {
        Command::Observe {
            task_id: TaskId(task),
            payload: serde_json::json!({ "target": "M31" }),
        }
    }

    #[tokio::test]
    async fn default_behavior_is_success() {
        let gateway = SimGateway::new();
        let mount = ModuleId::from("mount-1");
        let handle = gateway.send_command(&mount, observe(1)).await;
        assert_eq!(handle.outcome().await, CommandOutcome::Success);
        assert_eq!(gateway.sent_to(&mount), vec![observe(1)]);
    }

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let gateway = SimGateway::with_latency(Duration::from_millis(1));
        let camera = ModuleId::from("camera-1");
        gateway.script(
            &camera,
            [
                SimBehavior::Resolve(CommandOutcome::Failure("readout error".into())),
                SimBehavior::Resolve(CommandOutcome::Timeout),
            ],
        );

        let first = gateway.send_command(&camera, observe(1)).await.outcome().await;
        let second = gateway.send_command(&camera, observe(1)).await.outcome().await;
        let third = gateway.send_command(&camera, observe(1)).await.outcome().await;
        assert_eq!(first, CommandOutcome::Failure("readout error".into()));
        assert_eq!(second, CommandOutcome::Timeout);
        assert_eq!(third, CommandOutcome::Success);
    }

    #[tokio::test]
    async fn stop_commands_ignore_the_script() {
        let gateway = SimGateway::new();
        let dome = ModuleId::from("dome");
        gateway.script(&dome, [SimBehavior::Hang]);
        let outcome = gateway
            .send_command(&dome, Command::Stop { task_id: TaskId(2) })
            .await
            .outcome()
            .await;
        assert_eq!(outcome, CommandOutcome::Success);
    }

    #[tokio::test]
    async fn hung_command_never_resolves() {
        let gateway = SimGateway::new();
        let focuser = ModuleId::from("focuser");
        gateway.script(&focuser, [SimBehavior::Hang]);
        let outcome = gateway
            .send_command(&focuser, observe(3))
            .await
            .outcome_within(Duration::from_millis(30))
            .await;
        assert_eq!(outcome, CommandOutcome::Timeout);
    }

    #[tokio::test]
    async fn abandoned_hung_commands_are_released() {
        let gateway = SimGateway::new();
        let focuser = ModuleId::from("focuser");
        gateway.script(&focuser, [SimBehavior::Hang, SimBehavior::Hang, SimBehavior::Hang]);

        for task in 1..=2 {
            let handle = gateway.send_command(&focuser, observe(task)).await;
            drop(handle);
        }
        let kept = gateway.send_command(&focuser, observe(3)).await;
        assert_eq!(gateway.lock().hung.len(), 1);

        let outcome = kept.outcome_within(Duration::from_millis(20)).await;
        assert_eq!(outcome, CommandOutcome::Timeout);
    }

    #[tokio::test]
    async fn unreachable_module_fails_fast() {
        let gateway = SimGateway::new();
        let mount = ModuleId::from("mount-1");
        gateway.set_unreachable(&mount, true);
        let outcome = gateway.send_command(&mount, observe(4)).await.outcome().await;
        assert!(matches!(outcome, CommandOutcome::Failure(_)));
    }

    #[tokio::test]
    async fn emitted_events_reach_subscribers() {
        let gateway = SimGateway::new();
        let weather = ModuleId::from("weather");
        let mut events = gateway.subscribe_events(&weather);
        let event = StatusEvent::Heartbeat {
            module_id: weather.clone(),
            health: HealthInfo::nominal(),
        };
        assert_eq!(gateway.emit(event.clone()), 1);
        assert_eq!(events.next().await, Some(event));
    }
}
