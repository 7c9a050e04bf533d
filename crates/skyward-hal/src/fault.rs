//! Per-module fault accounting.
//!
//! Modules report fault codes with their heartbeats.  A single fault is
//! usually harmless (the module clears it and carries on), but a fault that
//! keeps coming back means the hardware needs a human.  Each code is judged
//! by a [`FaultPolicy`]; once a code turns *fatal* the registry moves the
//! module to [`ModuleStatus::Error`][skyward_types::ModuleStatus::Error].
//!
//! A code is fatal when any of these holds:
//!
//! 1. it occurred more than `reset_max` times since the history was cleared;
//! 2. its last two occurrences are closer than `reset_timeout`;
//! 3. more than `accum_max` occurrences fall within the trailing `accum_span`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a fault code is tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    /// Ignored codes are never counted.
    #[serde(default)]
    pub ignore: bool,
    #[serde(default = "default_reset_max")]
    pub reset_max: usize,
    #[serde(default = "default_reset_timeout", with = "secs")]
    pub reset_timeout: Duration,
    #[serde(default = "default_accum_max")]
    pub accum_max: usize,
    #[serde(default = "default_accum_span", with = "secs")]
    pub accum_span: Duration,
}

fn default_reset_max() -> usize {
    10
}
fn default_reset_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_accum_max() -> usize {
    5
}
fn default_accum_span() -> Duration {
    Duration::from_secs(86_400)
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            ignore: false,
            reset_max: default_reset_max(),
            reset_timeout: default_reset_timeout(),
            accum_max: default_accum_max(),
            accum_span: default_accum_span(),
        }
    }
}

impl FaultPolicy {
    pub fn ignored() -> Self {
        Self {
            ignore: true,
            ..Self::default()
        }
    }
}

/// Durations expressed as whole seconds in config files.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Default policy plus per-code overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicyTable {
    #[serde(default)]
    pub default: FaultPolicy,
    #[serde(default)]
    pub codes: HashMap<String, FaultPolicy>,
}

impl FaultPolicyTable {
    pub fn policy_for(&self, code: &str) -> &FaultPolicy {
        self.codes.get(code).unwrap_or(&self.default)
    }
}

/// Result of recording one fault occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    Ignored,
    Tolerated,
    Fatal,
}

/// Occurrence timestamps per fault code for one module.
#[derive(Debug, Clone, Default)]
pub struct FaultHistory {
    occurrences: HashMap<String, Vec<DateTime<Utc>>>,
}

impl FaultHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `code` occurred at `at` and judge it under `policy`.
    pub fn record(&mut self, code: &str, at: DateTime<Utc>, policy: &FaultPolicy) -> FaultVerdict {
        if policy.ignore {
            return FaultVerdict::Ignored;
        }
        let dates = self.occurrences.entry(code.to_string()).or_default();
        dates.push(at);

        if dates.len() > policy.reset_max {
            warn!(code, count = dates.len(), "fault occurred more often than allowed");
            return FaultVerdict::Fatal;
        }

        if let [.., previous, last] = dates.as_slice() {
            let gap = last.signed_duration_since(*previous).num_milliseconds();
            if gap < policy.reset_timeout.as_millis() as i64 {
                warn!(code, gap_ms = gap, "fault recurred faster than allowed");
                return FaultVerdict::Fatal;
            }
        }

        let span_ms = policy.accum_span.as_millis() as i64;
        let last = at;
        dates.retain(|d| last.signed_duration_since(*d).num_milliseconds() < span_ms);
        if dates.len() > policy.accum_max {
            warn!(
                code,
                count = dates.len(),
                span_s = policy.accum_span.as_secs(),
                "too many faults within accumulation span"
            );
            return FaultVerdict::Fatal;
        }

        FaultVerdict::Tolerated
    }

    /// Number of remembered occurrences of `code`.
    pub fn count(&self, code: &str) -> usize {
        self.occurrences.get(code).map_or(0, Vec::len)
    }

    /// Forget every recorded occurrence (operator cleared the faults).
    pub fn clear(&mut self) {
        self.occurrences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn lenient() -> FaultPolicy {
        FaultPolicy {
            ignore: false,
            reset_max: 10,
            reset_timeout: Duration::ZERO,
            accum_max: 3,
            accum_span: Duration::from_secs(60),
        }
    }

    #[test]
    fn ignored_codes_are_not_counted() {
        let mut history = FaultHistory::new();
        let now = Utc::now();
        for _ in 0..20 {
            assert_eq!(
                history.record("ERR_GPS_PositionLost", now, &FaultPolicy::ignored()),
                FaultVerdict::Ignored
            );
        }
        assert_eq!(history.count("ERR_GPS_PositionLost"), 0);
    }

    #[test]
    fn single_fault_is_tolerated() {
        let mut history = FaultHistory::new();
        assert_eq!(
            history.record("ERR_Oil_TemperatureLow", Utc::now(), &FaultPolicy::default()),
            FaultVerdict::Tolerated
        );
    }

    #[test]
    fn rapid_recurrence_is_fatal() {
        let mut history = FaultHistory::new();
        let policy = FaultPolicy::default();
        let t0 = Utc::now();
        assert_eq!(history.record("ERR_Brake", t0, &policy), FaultVerdict::Tolerated);
        assert_eq!(
            history.record("ERR_Brake", t0 + ChronoDuration::seconds(10), &policy),
            FaultVerdict::Fatal
        );
    }

    #[test]
    fn accumulation_within_span_is_fatal() {
        let mut history = FaultHistory::new();
        let policy = lenient();
        let t0 = Utc::now();
        for i in 0..3 {
            assert_eq!(
                history.record("ERR_Azimuth", t0 + ChronoDuration::seconds(i * 10), &policy),
                FaultVerdict::Tolerated
            );
        }
        assert_eq!(
            history.record("ERR_Azimuth", t0 + ChronoDuration::seconds(30), &policy),
            FaultVerdict::Fatal
        );
    }

    #[test]
    fn occurrences_outside_span_are_forgotten() {
        let mut history = FaultHistory::new();
        let policy = lenient();
        let t0 = Utc::now();
        for i in 0..3 {
            history.record("ERR_Azimuth", t0 + ChronoDuration::seconds(i), &policy);
        }
        let later = t0 + ChronoDuration::seconds(600);
        assert_eq!(history.record("ERR_Azimuth", later, &policy), FaultVerdict::Tolerated);
        assert_eq!(history.count("ERR_Azimuth"), 1);
    }

    #[test]
    fn exceeding_reset_max_is_fatal() {
        let mut history = FaultHistory::new();
        let policy = FaultPolicy {
            reset_max: 2,
            accum_max: 100,
            ..lenient()
        };
        let t0 = Utc::now();
        history.record("ERR_Filter", t0, &policy);
        history.record("ERR_Filter", t0 + ChronoDuration::seconds(1), &policy);
        assert_eq!(
            history.record("ERR_Filter", t0 + ChronoDuration::seconds(2), &policy),
            FaultVerdict::Fatal
        );
    }

    #[test]
    fn clear_resets_history() {
        let mut history = FaultHistory::new();
        history.record("ERR_X", Utc::now(), &FaultPolicy::default());
        history.clear();
        assert_eq!(history.count("ERR_X"), 0);
    }

    #[test]
    fn table_falls_back_to_default() {
        let mut table = FaultPolicyTable::default();
        table
            .codes
            .insert("ERR_GPS_LeapSecond".into(), FaultPolicy::ignored());
        assert!(table.policy_for("ERR_GPS_LeapSecond").ignore);
        assert!(!table.policy_for("ERR_Unlisted").ignore);
    }

    #[test]
    fn policy_table_reads_durations_as_seconds() {
        let table: FaultPolicyTable = serde_json::from_value(serde_json::json!({
            "codes": {
                "ERR_Brake_ClosedFromOther": { "reset_max": 2, "reset_timeout": 30 }
            }
        }))
        .unwrap();
        assert_eq!(table.default, FaultPolicy::default());
        let brake = table.policy_for("ERR_Brake_ClosedFromOther");
        assert_eq!(brake.reset_max, 2);
        assert_eq!(brake.reset_timeout, Duration::from_secs(30));
        assert_eq!(brake.accum_span, Duration::from_secs(86_400));

        let written = serde_json::to_value(brake).unwrap();
        assert_eq!(written["reset_timeout"], 30);
        assert_eq!(written["accum_span"], 86_400);
    }
}
