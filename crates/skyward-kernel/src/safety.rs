//! [`SafetyMonitor`] – aggregate environmental safety verdict.
//!
//! Every environmental sensor (weather station, cloud sensor, rain detector,
//! ...) feeds readings through [`SafetyMonitor::update_sensor`].  The monitor
//! folds them into one process-wide [`SafetyVerdict`]:
//!
//! | Condition                                              | Verdict  |
//! |--------------------------------------------------------|----------|
//! | any fresh reading is unsafe (own flag or limit rule)   | Unsafe   |
//! | any required source has gone stale                     | Unsafe   |
//! | any required source has never reported                 | Unknown  |
//! | otherwise                                              | Safe     |
//!
//! Going Unsafe is immediate.  Coming back from Unsafe is debounced: every
//! contributing source must deliver `debounce` consecutive safe readings.
//! Leaving Unknown only needs one fresh safe reading per required source.
//!
//! Subscribers are called on verdict *transitions*, never on plain readings,
//! after the monitor lock has been released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyward_types::SafetyVerdict;
use tracing::{debug, info, warn};

use crate::rules::{LimitRule, ReadingVerifier, SensorReading};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Per-source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub source: String,
    /// Required sources must report (and stay fresh) for the verdict to be
    /// Safe.
    #[serde(default = "default_required")]
    pub required: bool,
    /// A reading older than this no longer counts.
    #[serde(default = "default_staleness", with = "secs")]
    pub staleness: Duration,
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

fn default_required() -> bool {
    true
}

fn default_staleness() -> Duration {
    Duration::from_secs(120)
}

impl SensorSpec {
    pub fn required(source: impl Into<String>, staleness: Duration) -> Self {
        Self {
            source: source.into(),
            required: true,
            staleness,
            limits: Vec::new(),
        }
    }

    pub fn optional(source: impl Into<String>, staleness: Duration) -> Self {
        Self {
            required: false,
            ..Self::required(source, staleness)
        }
    }

    pub fn with_limit(mut self, limit: LimitRule) -> Self {
        self.limits.push(limit);
        self
    }
}

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

// ────────────────────────────────────────────────────────────────────────────
// Snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Latest accepted reading of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceState {
    pub reading: SensorReading,
    pub timestamp: DateTime<Utc>,
    /// Sensor flag combined with the source's limit rules.
    pub effective_safe: bool,
    /// Limit rule violation, if any.
    pub violation: Option<String>,
    pub consecutive_safe: u32,
}

/// Copy of the monitor state returned by [`SafetyMonitor::current`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyState {
    pub verdict: SafetyVerdict,
    /// Time of the last verdict transition.
    pub since: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceState>,
}

/// Delivered to subscribers on every verdict change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyTransition {
    pub from: SafetyVerdict,
    pub to: SafetyVerdict,
    pub at: DateTime<Utc>,
    pub reason: String,
}

pub type SafetyCallback = Arc<dyn Fn(&SafetyTransition) + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct SourceConfig {
    required: bool,
    staleness: Duration,
    verifier: ReadingVerifier,
}

struct Inner {
    verdict: SafetyVerdict,
    since: DateTime<Utc>,
    sources: BTreeMap<String, SourceState>,
}

/// Raw verdict before debouncing, with a human-readable cause.
enum Assessment {
    Unsafe(String),
    Unknown(String),
    Safe,
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe aggregator of environmental sensor readings.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use chrono::Utc;
/// use skyward_kernel::rules::SensorReading;
/// use skyward_kernel::safety::{SafetyMonitor, SensorSpec};
/// use skyward_types::SafetyVerdict;
///
/// let monitor = SafetyMonitor::new(3, [SensorSpec::required("weather", Duration::from_secs(60))]);
/// assert_eq!(monitor.verdict(), SafetyVerdict::Unknown);
///
/// monitor.update_sensor("weather", SensorReading::safe(), Utc::now());
/// assert_eq!(monitor.verdict(), SafetyVerdict::Safe);
/// ```
pub struct SafetyMonitor {
    debounce: u32,
    configs: HashMap<String, SourceConfig>,
    default_staleness: Duration,
    inner: Mutex<Inner>,
    subscribers: Mutex<Vec<SafetyCallback>>,
}

impl SafetyMonitor {
    /// `debounce` is the number of consecutive safe readings every source
    /// must deliver before Unsafe clears (values below 1 act as 1).
    pub fn new(debounce: u32, sensors: impl IntoIterator<Item = SensorSpec>) -> Self {
        let configs = sensors
            .into_iter()
            .map(|spec| {
                let config = SourceConfig {
                    required: spec.required,
                    staleness: spec.staleness,
                    verifier: ReadingVerifier::from_limits(spec.limits),
                };
                (spec.source, config)
            })
            .collect();
        Self {
            debounce: debounce.max(1),
            configs,
            default_staleness: default_staleness(),
            inner: Mutex::new(Inner {
                verdict: SafetyVerdict::Unknown,
                since: Utc::now(),
                sources: BTreeMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Staleness applied to sources that have no [`SensorSpec`].
    pub fn with_default_staleness(mut self, staleness: Duration) -> Self {
        self.default_staleness = staleness;
        self
    }

    /// Register a callback invoked on every verdict transition.
    pub fn subscribe(&self, callback: impl Fn(&SafetyTransition) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn verdict(&self) -> SafetyVerdict {
        self.lock().verdict
    }

    pub fn current(&self) -> SafetyState {
        let inner = self.lock();
        SafetyState {
            verdict: inner.verdict,
            since: inner.since,
            sources: inner.sources.clone(),
        }
    }

    /// Feed one reading from `source` taken at `timestamp`.
    ///
    /// Readings older than the latest accepted reading of the same source
    /// are ignored.  Sources without a [`SensorSpec`] are treated as
    /// optional.  Returns the verdict transition this reading caused.
    pub fn update_sensor(
        &self,
        source: &str,
        reading: SensorReading,
        timestamp: DateTime<Utc>,
    ) -> Option<SafetyTransition> {
        let transition = {
            let mut inner = self.lock();
            if let Some(prev) = inner.sources.get(source)
                && timestamp < prev.timestamp
            {
                debug!(source, %timestamp, latest = %prev.timestamp, "out-of-order reading ignored");
                return None;
            }

            let violation = self
                .configs
                .get(source)
                .and_then(|c| c.verifier.verify(&reading).err())
                .map(|v| v.to_string());
            let effective_safe = reading.safe && violation.is_none();
            let consecutive_safe = match inner.sources.get(source) {
                Some(prev) if effective_safe => prev.consecutive_safe.saturating_add(1),
                None if effective_safe => 1,
                _ => 0,
            };
            if let Some(v) = &violation {
                warn!(source, violation = %v, "sensor reading violates limit");
            }
            inner.sources.insert(
                source.to_string(),
                SourceState {
                    reading,
                    timestamp,
                    effective_safe,
                    violation,
                    consecutive_safe,
                },
            );
            self.evaluate(&mut inner, timestamp)
        };
        if let Some(t) = &transition {
            self.notify(t);
        }
        transition
    }

    /// Re-evaluate staleness at `now`.  Call periodically; a sensor that
    /// simply stops reporting never calls [`update_sensor`](Self::update_sensor).
    pub fn refresh(&self, now: DateTime<Utc>) -> Option<SafetyTransition> {
        let transition = {
            let mut inner = self.lock();
            self.evaluate(&mut inner, now)
        };
        if let Some(t) = &transition {
            self.notify(t);
        }
        transition
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn staleness(&self, source: &str) -> Duration {
        self.configs
            .get(source)
            .map_or(self.default_staleness, |c| c.staleness)
    }

    fn is_stale(&self, source: &str, state: &SourceState, now: DateTime<Utc>) -> bool {
        let age_ms = now.signed_duration_since(state.timestamp).num_milliseconds();
        age_ms > self.staleness(source).as_millis() as i64
    }

    fn assess(&self, inner: &Inner, now: DateTime<Utc>) -> Assessment {
        for (source, state) in &inner.sources {
            if !state.effective_safe && !self.is_stale(source, state, now) {
                let cause = state
                    .violation
                    .clone()
                    .unwrap_or_else(|| "sensor reports unsafe".to_string());
                return Assessment::Unsafe(format!("{source}: {cause}"));
            }
        }
        for (source, config) in &self.configs {
            if !config.required {
                continue;
            }
            if let Some(state) = inner.sources.get(source)
                && self.is_stale(source, state, now)
            {
                return Assessment::Unsafe(format!("{source}: reading is stale"));
            }
        }
        if let Some((source, _)) = self
            .configs
            .iter()
            .find(|(source, config)| config.required && !inner.sources.contains_key(*source))
        {
            return Assessment::Unknown(format!("{source}: no reading yet"));
        }
        Assessment::Safe
    }

    /// `true` when every source that is fresh (or required) has delivered
    /// enough consecutive safe readings.
    fn debounce_satisfied(&self, inner: &Inner, now: DateTime<Utc>) -> bool {
        inner.sources.iter().all(|(source, state)| {
            let required = self.configs.get(source).is_some_and(|c| c.required);
            let counts = required || !self.is_stale(source, state, now);
            !counts || state.consecutive_safe >= self.debounce
        })
    }

    fn evaluate(&self, inner: &mut Inner, now: DateTime<Utc>) -> Option<SafetyTransition> {
        // A stale source has to start its safe streak over.
        let stale: Vec<String> = inner
            .sources
            .iter()
            .filter(|(source, state)| self.is_stale(source, state, now))
            .map(|(source, _)| source.clone())
            .collect();
        for source in stale {
            if let Some(state) = inner.sources.get_mut(&source) {
                state.consecutive_safe = 0;
            }
        }

        let from = inner.verdict;
        let (to, reason) = match self.assess(inner, now) {
            Assessment::Unsafe(reason) => (SafetyVerdict::Unsafe, reason),
            // Unsafe only clears through the debounced path.
            Assessment::Unknown(_) if from == SafetyVerdict::Unsafe => return None,
            Assessment::Unknown(reason) => (SafetyVerdict::Unknown, reason),
            Assessment::Safe => match from {
                SafetyVerdict::Unsafe if !self.debounce_satisfied(inner, now) => return None,
                SafetyVerdict::Unsafe => (
                    SafetyVerdict::Safe,
                    format!("{} consecutive safe readings", self.debounce),
                ),
                _ => (SafetyVerdict::Safe, "all required sources safe".to_string()),
            },
        };
        if to == from {
            return None;
        }

        if to == SafetyVerdict::Unsafe {
            for state in inner.sources.values_mut() {
                state.consecutive_safe = 0;
            }
            warn!(%from, %reason, "safety verdict now UNSAFE");
        } else {
            info!(%from, %to, %reason, "safety verdict changed");
        }
        inner.verdict = to;
        inner.since = now;
        Some(SafetyTransition {
            from,
            to,
            at: now,
            reason,
        })
    }

    fn notify(&self, transition: &SafetyTransition) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in subscribers {
            callback(transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    fn monitor(debounce: u32) -> SafetyMonitor {
        SafetyMonitor::new(
            debounce,
            [
                SensorSpec::required("weather", Duration::from_secs(60))
                    .with_limit(LimitRule::at_most("wind_speed", 15.0)),
                SensorSpec::required("rain", Duration::from_secs(60)),
            ],
        )
    }

    fn safe() -> SensorReading {
        SensorReading::safe()
    }

    fn unsafe_reading() -> SensorReading {
        SensorReading::new(false)
    }

    #[test]
    fn starts_unknown_until_every_required_source_reports() {
        let m = monitor(3);
        let t0 = Utc::now();
        assert_eq!(m.verdict(), SafetyVerdict::Unknown);
        assert!(m.update_sensor("weather", safe(), t0).is_none());
        assert_eq!(m.verdict(), SafetyVerdict::Unknown);
        let t = m.update_sensor("rain", safe(), t0).unwrap();
        assert_eq!((t.from, t.to), (SafetyVerdict::Unknown, SafetyVerdict::Safe));
    }

    #[test]
    fn single_unsafe_reading_forces_unsafe() {
        let m = monitor(3);
        let t0 = Utc::now();
        m.update_sensor("weather", safe(), t0);
        m.update_sensor("rain", safe(), t0);
        let t = m.update_sensor("rain", unsafe_reading(), t0 + secs(1)).unwrap();
        assert_eq!(t.to, SafetyVerdict::Unsafe);
        assert!(t.reason.contains("rain"));
    }

    #[test]
    fn unsafe_before_all_sources_report_is_unsafe() {
        let m = monitor(3);
        let t = m.update_sensor("weather", unsafe_reading(), Utc::now()).unwrap();
        assert_eq!((t.from, t.to), (SafetyVerdict::Unknown, SafetyVerdict::Unsafe));
    }

    #[test]
    fn limit_rule_overrides_sensor_flag() {
        let m = monitor(3);
        let t0 = Utc::now();
        m.update_sensor("rain", safe(), t0);
        let t = m
            .update_sensor("weather", safe().with_value("wind_speed", 21.0), t0)
            .unwrap();
        assert_eq!(t.to, SafetyVerdict::Unsafe);
        let state = m.current();
        assert!(!state.sources["weather"].effective_safe);
        assert!(state.sources["weather"].violation.is_some());
    }

    #[test]
    fn recovery_requires_k_consecutive_safe_readings_from_every_source() {
        let m = monitor(3);
        let t0 = Utc::now();
        m.update_sensor("weather", safe(), t0);
        m.update_sensor("rain", unsafe_reading(), t0);
        assert_eq!(m.verdict(), SafetyVerdict::Unsafe);

        for i in 1..=3 {
            assert!(m.update_sensor("rain", safe(), t0 + secs(i)).is_none());
        }
        // Rain has its streak, weather does not yet.
        assert_eq!(m.verdict(), SafetyVerdict::Unsafe);
        m.update_sensor("weather", safe(), t0 + secs(4));
        m.update_sensor("weather", safe(), t0 + secs(5));
        let t = m.update_sensor("weather", safe(), t0 + secs(6)).unwrap();
        assert_eq!((t.from, t.to), (SafetyVerdict::Unsafe, SafetyVerdict::Safe));
    }

    #[test]
    fn unsafe_reading_during_recovery_restarts_streak() {
        let m = monitor(2);
        let t0 = Utc::now();
        m.update_sensor("weather", safe(), t0);
        m.update_sensor("rain", unsafe_reading(), t0);
        m.update_sensor("weather", safe(), t0 + secs(1));
        m.update_sensor("weather", safe(), t0 + secs(2));
        m.update_sensor("rain", safe(), t0 + secs(3));
        m.update_sensor("rain", unsafe_reading(), t0 + secs(4));
        m.update_sensor("rain", safe(), t0 + secs(5));
        assert_eq!(m.verdict(), SafetyVerdict::Unsafe);
        // The verdict never left Unsafe, so only rain's streak restarted.
        let t = m.update_sensor("rain", safe(), t0 + secs(6)).unwrap();
        assert_eq!(t.to, SafetyVerdict::Safe);
    }

    #[test]
    fn stale_required_source_forces_unsafe_on_refresh() {
        let m = monitor(1);
        let t0 = Utc::now();
        m.update_sensor("weather", safe(), t0);
        m.update_sensor("rain", safe(), t0);
        assert!(m.refresh(t0 + secs(59)).is_none());
        m.update_sensor("weather", safe(), t0 + secs(59));
        let t = m.refresh(t0 + secs(61)).unwrap();
        assert_eq!(t.to, SafetyVerdict::Unsafe);
        assert!(t.reason.contains("rain"));
    }

    #[test]
    fn out_of_order_reading_is_ignored() {
        let m = monitor(3);
        let t0 = Utc::now();
        m.update_sensor("weather", safe(), t0 + secs(10));
        m.update_sensor("rain", safe(), t0 + secs(10));
        assert!(m.update_sensor("rain", unsafe_reading(), t0).is_none());
        assert_eq!(m.verdict(), SafetyVerdict::Safe);
    }

    #[test]
    fn unconfigured_source_is_optional() {
        let m = monitor(1);
        let t0 = Utc::now();
        m.update_sensor("weather", safe(), t0);
        m.update_sensor("rain", safe(), t0);
        let t = m.update_sensor("cloud", unsafe_reading(), t0).unwrap();
        assert_eq!(t.to, SafetyVerdict::Unsafe);

        // Once its reading goes stale it no longer blocks recovery.
        let later = t0 + secs(200);
        m.update_sensor("weather", safe(), later);
        let t = m.update_sensor("rain", safe(), later).unwrap();
        assert_eq!(t.to, SafetyVerdict::Safe);
    }

    #[test]
    fn subscribers_see_transitions_only() {
        let m = monitor(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        m.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let t0 = Utc::now();
        m.update_sensor("weather", safe(), t0);
        m.update_sensor("rain", safe(), t0);
        m.update_sensor("rain", safe(), t0 + secs(1));
        m.update_sensor("rain", safe(), t0 + secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_may_query_the_monitor() {
        let m = Arc::new(monitor(1));
        let observed = Arc::new(Mutex::new(None));
        let (m2, slot) = (Arc::clone(&m), Arc::clone(&observed));
        m.subscribe(move |_| {
            *slot.lock().unwrap() = Some(m2.verdict());
        });
        m.update_sensor("weather", unsafe_reading(), Utc::now());
        assert_eq!(*observed.lock().unwrap(), Some(SafetyVerdict::Unsafe));
    }

    #[test]
    fn sensor_spec_defaults_from_json() {
        let spec: SensorSpec = serde_json::from_str(r#"{"source":"weather"}"#).unwrap();
        assert!(spec.required);
        assert_eq!(spec.staleness, Duration::from_secs(120));
        assert!(spec.limits.is_empty());
    }
}
