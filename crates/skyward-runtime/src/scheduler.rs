//! Scheduling decision function.
//!
//! [`plan`] is a pure function over snapshots: it takes copies of the task
//! table and the module registry, the current safety verdict and the clock,
//! and returns what should happen next.  It holds no locks and keeps no
//! state between invocations; the facility calls it after every relevant
//! event and on every tick, then applies the [`Plan`].
//!
//! Decision rules, in order:
//!
//! 1. Pending tasks whose latest start has passed are expired.
//! 2. Nothing is dispatched unless the verdict is `Safe`.
//! 3. Pending tasks inside their window are ranked by priority (high first),
//!    then submission time, then id.
//! 4. Walking that ranking, each task gets a greedy allocation from the
//!    still-unclaimed Idle modules; a task that cannot be covered is skipped
//!    and the next one is tried.  At most `max_concurrent - in_flight` tasks
//!    are dispatched.

use chrono::{DateTime, Utc};
use skyward_hal::{allocate, ModuleInfo};
use skyward_memory::Task;
use skyward_types::{ModuleId, SafetyVerdict, TaskId, TaskStatus};
use tracing::debug;

/// Snapshot of everything the scheduler looks at.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerInput<'a> {
    pub tasks: &'a [Task],
    pub modules: &'a [ModuleInfo],
    pub verdict: SafetyVerdict,
    /// Tasks already Scheduled or Running.
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub now: DateTime<Utc>,
}

/// Start `task_id` on `modules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub modules: Vec<ModuleId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Pending tasks to fail with `WindowExpired`.
    pub expired: Vec<TaskId>,
    pub dispatch: Vec<Dispatch>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.dispatch.is_empty()
    }
}

pub fn plan(input: SchedulerInput<'_>) -> Plan {
    let pending: Vec<&Task> = input
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();

    let expired: Vec<TaskId> = pending
        .iter()
        .filter(|t| t.window.has_expired(input.now))
        .map(|t| t.id)
        .collect();

    let mut plan = Plan {
        expired,
        dispatch: Vec::new(),
    };

    if input.verdict != SafetyVerdict::Safe {
        if !pending.is_empty() {
            debug!(verdict = %input.verdict, pending = pending.len(), "dispatch held: site not safe");
        }
        return plan;
    }

    let mut capacity = input.max_concurrent.saturating_sub(input.in_flight);
    if capacity == 0 {
        return plan;
    }

    let mut ready: Vec<&Task> = pending
        .into_iter()
        .filter(|t| t.window.contains(input.now))
        .collect();
    ready.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.submitted_at.cmp(&b.submitted_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut pool: Vec<ModuleInfo> = input
        .modules
        .iter()
        .filter(|m| m.is_available())
        .cloned()
        .collect();

    for task in ready {
        if capacity == 0 {
            break;
        }
        let Some(chosen) = allocate(&task.capabilities, &pool) else {
            debug!(task = %task.id, priority = task.priority, "no module set available; trying next task");
            continue;
        };
        pool.retain(|m| !chosen.contains(&m.id));
        debug!(task = %task.id, modules = ?chosen, "task selected for dispatch");
        plan.dispatch.push(Dispatch {
            task_id: task.id,
            modules: chosen,
        });
        capacity -= 1;
    }

    plan
}
