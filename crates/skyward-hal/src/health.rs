//! [`HeartbeatPolicy`] – module liveness judgement.
//!
//! Every module must heartbeat at least once per `interval`.  The policy
//! counts how many whole intervals have passed since the last heartbeat and
//! declares the module lost once `miss_limit` consecutive intervals were
//! missed.  The registry applies the policy from its periodic
//! [`sweep`][crate::registry::ModuleRegistry::sweep].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness state derived from the last heartbeat timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatHealth {
    /// Heartbeat received within the current interval.
    Healthy,
    /// Some intervals were missed, but fewer than the limit.
    Late { missed: u32 },
    /// `miss_limit` or more consecutive intervals were missed.
    Expired { missed: u32 },
}

/// Heartbeat interval and tolerated number of consecutive misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub miss_limit: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            miss_limit: 3,
        }
    }
}

impl HeartbeatPolicy {
    pub fn new(interval: Duration, miss_limit: u32) -> Self {
        Self {
            interval,
            miss_limit,
        }
    }

    /// Number of whole intervals elapsed since `last`.  Clock skew (a `last`
    /// in the future) counts as zero.
    pub fn missed_intervals(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
        let interval_ms = self.interval.as_millis().max(1) as i64;
        let elapsed_ms = now.signed_duration_since(last).num_milliseconds();
        if elapsed_ms <= 0 {
            return 0;
        }
        u32::try_from(elapsed_ms / interval_ms).unwrap_or(u32::MAX)
    }

    pub fn health(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> HeartbeatHealth {
        match self.missed_intervals(last, now) {
            0 => HeartbeatHealth::Healthy,
            missed if missed >= self.miss_limit.max(1) => HeartbeatHealth::Expired { missed },
            missed => HeartbeatHealth::Late { missed },
        }
    }

    pub fn is_expired(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        matches!(self.health(last, now), HeartbeatHealth::Expired { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn policy() -> HeartbeatPolicy {
        HeartbeatPolicy::new(Duration::from_secs(2), 3)
    }

    #[test]
    fn fresh_heartbeat_is_healthy() {
        let now = Utc::now();
        assert_eq!(policy().health(now, now), HeartbeatHealth::Healthy);
        assert_eq!(
            policy().health(now, now + ChronoDuration::milliseconds(1_999)),
            HeartbeatHealth::Healthy
        );
    }

    #[test]
    fn missing_fewer_than_limit_is_late() {
        let last = Utc::now();
        assert_eq!(
            policy().health(last, last + ChronoDuration::seconds(5)),
            HeartbeatHealth::Late { missed: 2 }
        );
    }

    #[test]
    fn missing_limit_intervals_expires() {
        let last = Utc::now();
        let now = last + ChronoDuration::seconds(6);
        assert_eq!(policy().health(last, now), HeartbeatHealth::Expired { missed: 3 });
        assert!(policy().is_expired(last, now));
    }

    #[test]
    fn future_heartbeat_counts_as_zero_missed() {
        let now = Utc::now();
        assert_eq!(policy().missed_intervals(now + ChronoDuration::seconds(30), now), 0);
    }

    #[test]
    fn zero_miss_limit_behaves_like_one() {
        let p = HeartbeatPolicy::new(Duration::from_secs(1), 0);
        let last = Utc::now();
        assert!(!p.is_expired(last, last));
        assert!(p.is_expired(last, last + ChronoDuration::seconds(1)));
    }
}
