//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::ModuleHealth`] | Module status transitions (idle, leased, offline, error) |
//! | [`Topic::Safety`] | Safety verdict transitions |
//! | [`Topic::TaskLifecycle`] | Task submissions and state-machine transitions |
//! | [`Topic::Commands`] | Commands issued to modules and their resolutions |

use skyward_types::{Event, SkyError};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all first-class routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Module status transitions reported by the registry.
    ModuleHealth,
    /// Safety verdict transitions.
    Safety,
    /// Task submissions and lifecycle transitions.
    TaskLifecycle,
    /// Module command traffic.
    Commands,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::ModuleHealth,
        Topic::Safety,
        Topic::TaskLifecycle,
        Topic::Commands,
    ];
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    module_health: broadcast::Sender<Event>,
    safety: broadcast::Sender<Event>,
    task_lifecycle: broadcast::Sender<Event>,
    commands: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (module_health, _) = broadcast::channel(capacity);
        let (safety, _) = broadcast::channel(capacity);
        let (task_lifecycle, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        Self {
            module_health,
            safety,
            task_lifecycle,
            commands,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`SkyError::Channel`] when nobody is listening on the topic.  Most
    /// publishers treat the latter as a normal condition and ignore it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, SkyError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| SkyError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn receiver_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::ModuleHealth => &self.module_health,
            Topic::Safety => &self.safety,
            Topic::TaskLifecycle => &self.task_lifecycle,
            Topic::Commands => &self.commands,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, skipping over lag notifications.
    ///
    /// Returns `None` once the bus is closed.  Consumers that only use events
    /// as a wake-up signal (and re-read state afterwards) lose nothing by
    /// skipping lagged messages.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyward_types::{EventPayload, TaskId};

    fn make_event(task: u64) -> Event {
        Event::new(
            "skyward-middleware::test",
            EventPayload::TaskSubmitted {
                task_id: TaskId(task),
            },
        )
    }

    #[test]
    fn publish_no_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::TaskLifecycle, make_event(1));
        assert!(matches!(result, Err(SkyError::Channel(_))));
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::TaskLifecycle);
        let mut subscriber2 = bus.subscribe_to(Topic::TaskLifecycle);

        let event = make_event(7);
        assert_eq!(bus.publish_to(Topic::TaskLifecycle, event.clone())?, 2);

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    /// A subscriber on `Safety` must not receive events published to
    /// `TaskLifecycle` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut safety_sub = bus.subscribe_to(Topic::Safety);
        let _tasks_sub = bus.subscribe_to(Topic::TaskLifecycle);

        bus.publish_to(Topic::TaskLifecycle, make_event(1))?;

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            safety_sub.recv(),
        )
        .await;
        assert!(result.is_err(), "Safety subscriber must not receive a task event");
        Ok(())
    }

    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        let bus = EventBus::new(16);
        let mut slow_sub = bus.subscribe_to(Topic::Commands);
        for i in 0..1_000 {
            let _ = bus.publish_to(Topic::Commands, make_event(i));
        }
        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn next_event_skips_lag() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_to(Topic::ModuleHealth);
        for i in 0..10 {
            let _ = bus.publish_to(Topic::ModuleHealth, make_event(i));
        }
        let event = sub.next_event().await.expect("bus still open");
        match event.payload {
            EventPayload::TaskSubmitted { task_id } => assert_eq!(task_id, TaskId(6)),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(sub.topic(), Topic::ModuleHealth);
    }
}
