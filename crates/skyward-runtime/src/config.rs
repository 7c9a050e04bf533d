//! [`FacilityConfig`] – orchestration policy knobs.
//!
//! Every field has a serde default, so a config file only needs to mention
//! what it changes.  Durations are whole milliseconds.
//!
//! ```toml
//! heartbeat_interval_ms = 2000
//! heartbeat_miss_limit  = 3
//! safety_grace_ms       = 10000
//! max_concurrent_tasks  = 2
//!
//! [[sensors]]
//! source    = "weather"
//! staleness = 120
//! limits    = [{ key = "wind_speed", max = 15.0 }]
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyward_hal::{FaultPolicyTable, HeartbeatPolicy};
use skyward_kernel::SensorSpec;
use skyward_types::SkyError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityConfig {
    /// Expected heartbeat period of every module.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a module goes Offline.
    #[serde(default = "default_heartbeat_miss_limit")]
    pub heartbeat_miss_limit: u32,
    /// Upper bound between an Unsafe verdict and every motion task being
    /// Aborted.
    #[serde(default = "default_safety_grace_ms")]
    pub safety_grace_ms: u64,
    /// How long an abort waits for modules to acknowledge Stop.  Must not
    /// exceed `safety_grace_ms`.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Consecutive safe readings per source before Unsafe clears.
    #[serde(default = "default_safety_debounce")]
    pub safety_debounce: u32,
    /// Deadline for a single Observe command.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Retry budget given to tasks that do not specify one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff unit between attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Period of the scheduler tick (window expiry, heartbeat sweep,
    /// staleness refresh).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
    #[serde(default)]
    pub faults: FaultPolicyTable,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_heartbeat_miss_limit() -> u32 {
    3
}
fn default_safety_grace_ms() -> u64 {
    10_000
}
fn default_stop_timeout_ms() -> u64 {
    5_000
}
fn default_safety_debounce() -> u32 {
    3
}
fn default_command_timeout_ms() -> u64 {
    600_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    5_000
}
fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_max_concurrent_tasks() -> usize {
    1
}

impl Default for FacilityConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_limit: default_heartbeat_miss_limit(),
            safety_grace_ms: default_safety_grace_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            safety_debounce: default_safety_debounce(),
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            sensors: Vec::new(),
            faults: FaultPolicyTable::default(),
        }
    }
}

impl FacilityConfig {
    /// Reject values the orchestration core cannot honour.
    pub fn validate(&self) -> Result<(), SkyError> {
        let positive = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("safety_grace_ms", self.safety_grace_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("tick_interval_ms", self.tick_interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SkyError::Config(format!("{name} must be greater than zero")));
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(SkyError::Config("heartbeat_miss_limit must be at least 1".into()));
        }
        if self.safety_debounce == 0 {
            return Err(SkyError::Config("safety_debounce must be at least 1".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(SkyError::Config("max_concurrent_tasks must be at least 1".into()));
        }
        if self.stop_timeout_ms > self.safety_grace_ms {
            return Err(SkyError::Config(format!(
                "stop_timeout_ms ({}) exceeds safety_grace_ms ({})",
                self.stop_timeout_ms, self.safety_grace_ms
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for sensor in &self.sensors {
            if sensor.source.trim().is_empty() {
                return Err(SkyError::Config("sensor source must not be empty".into()));
            }
            if !seen.insert(sensor.source.as_str()) {
                return Err(SkyError::Config(format!("duplicate sensor '{}'", sensor.source)));
            }
        }
        Ok(())
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy::new(
            Duration::from_millis(self.heartbeat_interval_ms),
            self.heartbeat_miss_limit,
        )
    }

    pub fn safety_grace(&self) -> Duration {
        Duration::from_millis(self.safety_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(FacilityConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: FacilityConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, FacilityConfig::default());
    }

    #[test]
    fn stop_timeout_must_fit_in_grace() {
        let cfg = FacilityConfig {
            safety_grace_ms: 1_000,
            stop_timeout_ms: 2_000,
            ..FacilityConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(SkyError::Config(m)) if m.contains("stop_timeout_ms")));
    }

    #[test]
    fn zero_values_are_rejected() {
        let cfg = FacilityConfig {
            tick_interval_ms: 0,
            ..FacilityConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = FacilityConfig {
            max_concurrent_tasks: 0,
            ..FacilityConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_sensors_are_rejected() {
        let spec = SensorSpec::required("weather", Duration::from_secs(60));
        let cfg = FacilityConfig {
            sensors: vec![spec.clone(), spec],
            ..FacilityConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duration_accessors() {
        let cfg = FacilityConfig::default();
        assert_eq!(cfg.safety_grace(), Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_policy().miss_limit, 3);
    }
}
