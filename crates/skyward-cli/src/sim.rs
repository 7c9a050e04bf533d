//! Simulated site – a [`Facility`] wired to a [`SimGateway`].
//!
//! Every configured module is registered, its gateway event stream is
//! attached, and a pump emits a nominal heartbeat once per heartbeat
//! interval.  Silencing a module stops its pump, which lets an operator
//! watch the Offline path from the REPL.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use skyward_memory::{SqliteStore, StateStore};
use skyward_middleware::SimGateway;
use skyward_runtime::Facility;
use skyward_types::{CapabilitySet, HealthInfo, ModuleId, SkyError, StatusEvent};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;

pub struct SimulatedSite {
    pub facility: Arc<Facility>,
    pub gateway: SimGateway,
    silenced: Arc<Mutex<HashSet<ModuleId>>>,
    pumps: Vec<JoinHandle<()>>,
}

impl SimulatedSite {
    /// Build and populate the site.  Must run inside a Tokio runtime.
    pub fn start(cfg: &Config) -> Result<Self, SkyError> {
        let gateway = SimGateway::with_latency(Duration::from_millis(cfg.sim_latency_ms));
        let facility = match &cfg.store_path {
            Some(path) => {
                let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(path)?);
                Facility::with_store(cfg.facility.clone(), Arc::new(gateway.clone()), store)?
            }
            None => Facility::new(cfg.facility.clone(), Arc::new(gateway.clone()))?,
        };
        let facility = Arc::new(facility);

        let mut site = Self {
            facility,
            gateway,
            silenced: Arc::new(Mutex::new(HashSet::new())),
            pumps: Vec::new(),
        };
        let interval = cfg.facility.heartbeat_policy().interval;
        for module in &cfg.modules {
            let id = ModuleId::new(module.id.clone());
            let capabilities: CapabilitySet = module.capabilities.iter().cloned().collect();
            site.facility.register_named_module(&id, capabilities);
            site.pumps.push(site.facility.attach_module_events(&id));
            site.pumps.push(site.spawn_heartbeats(id, interval));
        }
        info!(modules = cfg.modules.len(), "simulated site up");
        Ok(site)
    }

    fn spawn_heartbeats(&self, id: ModuleId, interval: Duration) -> JoinHandle<()> {
        let gateway = self.gateway.clone();
        let silenced = Arc::clone(&self.silenced);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let quiet = silenced
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(&id);
                if !quiet {
                    gateway.emit(StatusEvent::Heartbeat {
                        module_id: id.clone(),
                        health: HealthInfo::nominal(),
                    });
                }
            }
        })
    }

    /// Stop (or resume) the automatic heartbeats of `id`.
    pub fn set_silenced(&self, id: &ModuleId, silenced: bool) {
        let mut set = self.silenced.lock().unwrap_or_else(PoisonError::into_inner);
        if silenced {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    pub fn is_silenced(&self, id: &ModuleId) -> bool {
        self.silenced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

impl Drop for SimulatedSite {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
