//! Configuration Vault – reads/writes `~/.skyward/config.toml`.
//!
//! The file holds the orchestration policy (`[facility]`), the simulated
//! modules the CLI brings up, and an optional SQLite path for task
//! persistence.

use serde::{Deserialize, Serialize};
use skyward_kernel::{LimitRule, SensorSpec};
use skyward_runtime::FacilityConfig;
use skyward_types::Capability;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A module the CLI registers with the simulated gateway at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimModule {
    pub id: String,
    pub capabilities: Vec<Capability>,
}

impl SimModule {
    fn new(id: &str, capabilities: &[Capability]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: capabilities.to_vec(),
        }
    }
}

/// Persisted operator configuration stored in `~/.skyward/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file for task persistence.  Tasks live in memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Simulated command latency, in milliseconds.
    #[serde(default = "default_sim_latency_ms")]
    pub sim_latency_ms: u64,

    #[serde(default = "default_modules")]
    pub modules: Vec<SimModule>,

    #[serde(default)]
    pub facility: FacilityConfig,
}

fn default_sim_latency_ms() -> u64 {
    2_000
}

fn default_modules() -> Vec<SimModule> {
    vec![
        SimModule::new("mount-1", &[Capability::Mount]),
        SimModule::new("camera-1", &[Capability::Imaging, Capability::FilterWheel]),
        SimModule::new("focuser-1", &[Capability::Focuser]),
        SimModule::new("dome-1", &[Capability::Dome]),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: None,
            sim_latency_ms: default_sim_latency_ms(),
            modules: default_modules(),
            facility: FacilityConfig::default(),
        }
    }
}

impl Config {
    /// Defaults written on first run: a required weather station with a
    /// wind limit.  Nothing is dispatched until it reports safe via
    /// `/sensor weather safe`.
    pub fn first_run() -> Self {
        let mut cfg = Self::default();
        cfg.facility.sensors = vec![
            SensorSpec::required("weather", Duration::from_secs(600))
                .with_limit(LimitRule::at_most("wind_speed", 15.0)),
        ];
        cfg
    }
}

/// Return the path to `~/.skyward/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".skyward").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    cfg.facility
        .validate()
        .map_err(|e| format!("Invalid config at {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `SKYWARD_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SKYWARD_STORE_PATH` | `store_path` |
/// | `SKYWARD_SIM_LATENCY_MS` | `sim_latency_ms` |
/// | `SKYWARD_MAX_CONCURRENT_TASKS` | `facility.max_concurrent_tasks` |
/// | `SKYWARD_HEARTBEAT_INTERVAL_MS` | `facility.heartbeat_interval_ms` |
/// | `SKYWARD_SAFETY_GRACE_MS` | `facility.safety_grace_ms` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SKYWARD_STORE_PATH") {
        cfg.store_path = (!v.trim().is_empty()).then(|| PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("SKYWARD_SIM_LATENCY_MS")
        && let Ok(ms) = v.parse::<u64>() {
            cfg.sim_latency_ms = ms;
        }
    if let Ok(v) = std::env::var("SKYWARD_MAX_CONCURRENT_TASKS")
        && let Ok(n) = v.parse::<usize>() {
            cfg.facility.max_concurrent_tasks = n;
        }
    if let Ok(v) = std::env::var("SKYWARD_HEARTBEAT_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>() {
            cfg.facility.heartbeat_interval_ms = ms;
        }
    if let Ok(v) = std::env::var("SKYWARD_SAFETY_GRACE_MS")
        && let Ok(ms) = v.parse::<u64>() {
            cfg.facility.safety_grace_ms = ms;
        }
}

/// Save the config to disk, creating `~/.skyward/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
