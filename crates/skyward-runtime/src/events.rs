//! Publishing helpers shared by the executor and the facility.

use skyward_hal::ModuleTransition;
use skyward_memory::Task;
use skyward_middleware::{EventBus, Topic};
use skyward_types::{Event, EventPayload};
use tracing::trace;

/// Topic an event payload belongs on.
pub(crate) fn topic_for(payload: &EventPayload) -> Topic {
    match payload {
        EventPayload::ModuleStatusChanged { .. } => Topic::ModuleHealth,
        EventPayload::SafetyVerdictChanged { .. } => Topic::Safety,
        EventPayload::TaskSubmitted { .. } | EventPayload::TaskTransitioned { .. } => {
            Topic::TaskLifecycle
        }
        EventPayload::CommandIssued { .. } | EventPayload::CommandResolved { .. } => {
            Topic::Commands
        }
    }
}

/// Publish `payload`.  Having no subscriber is normal (headless runs).
pub(crate) fn emit(bus: &EventBus, source: &str, payload: EventPayload) {
    let topic = topic_for(&payload);
    if let Err(e) = bus.publish_to(topic, Event::new(source, payload)) {
        trace!(?topic, error = %e, "event not delivered");
    }
}

pub(crate) fn emit_module(bus: &EventBus, source: &str, t: &ModuleTransition) {
    emit(
        bus,
        source,
        EventPayload::ModuleStatusChanged {
            module_id: t.module_id.clone(),
            from: t.from,
            to: t.to,
        },
    );
}

/// Publish the most recent transition recorded on `task`.
pub(crate) fn emit_task(bus: &EventBus, source: &str, task: &Task) {
    if let Some(last) = task.history.last() {
        emit(
            bus,
            source,
            EventPayload::TaskTransitioned {
                task_id: task.id,
                from: last.from,
                to: last.to,
                reason: last.reason.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyward_types::{ModuleStatus, SafetyVerdict, TaskId};

    #[test]
    fn payloads_route_to_their_topics() {
        assert_eq!(
            topic_for(&EventPayload::SafetyVerdictChanged {
                from: SafetyVerdict::Unknown,
                to: SafetyVerdict::Safe
            }),
            Topic::Safety
        );
        assert_eq!(
            topic_for(&EventPayload::TaskSubmitted { task_id: TaskId(1) }),
            Topic::TaskLifecycle
        );
        assert_eq!(
            topic_for(&EventPayload::ModuleStatusChanged {
                module_id: "dome".into(),
                from: ModuleStatus::Idle,
                to: ModuleStatus::Leased
            }),
            Topic::ModuleHealth
        );
    }

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::TaskLifecycle);
        emit(&bus, "test", EventPayload::TaskSubmitted { task_id: TaskId(3) });
        let event = rx.next_event().await.unwrap();
        assert!(matches!(event.payload, EventPayload::TaskSubmitted { task_id } if task_id == TaskId(3)));
    }
}
