//! [`ModuleRegistry`] – live state of every hardware module.
//!
//! The registry owns one record per module: advertised capabilities, status,
//! last heartbeat, current lease holder and fault history.  Records are
//! individually locked; the map of records is behind an `RwLock` that is only
//! write-locked to insert a new module.
//!
//! # Leasing
//!
//! [`ModuleRegistry::lease_all`] leases a whole module set for one task or
//! nothing at all.  It locks the involved records in ascending id order, so
//! two tasks competing for overlapping sets can never each end up holding
//! half of what the other needs.
//!
//! # Liveness
//!
//! [`ModuleRegistry::sweep`] applies the [`HeartbeatPolicy`] and moves silent
//! modules to [`ModuleStatus::Offline`].  The returned [`ModuleTransition`]s
//! carry the lease holder so the caller can abort the affected task.  An
//! Offline module only comes back after it re-registers *and* heartbeats.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyward_types::{Capability, CapabilitySet, HealthInfo, ModuleId, ModuleStatus, SkyError, TaskId};
use tracing::{debug, info, warn};

use crate::fault::{FaultHistory, FaultPolicyTable, FaultVerdict};
use crate::health::HeartbeatPolicy;

/// Point-in-time copy of a module record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub capabilities: CapabilitySet,
    pub status: ModuleStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub lease: Option<TaskId>,
    pub registered_at: DateTime<Utc>,
}

impl ModuleInfo {
    pub fn advertises(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_available(&self) -> bool {
        self.status == ModuleStatus::Idle && self.lease.is_none()
    }

    pub fn is_motion_capable(&self) -> bool {
        self.capabilities.iter().any(Capability::is_motion)
    }
}

/// A status change applied by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTransition {
    pub module_id: ModuleId,
    pub from: ModuleStatus,
    pub to: ModuleStatus,
    /// Task holding a lease on the module at the time of the change.
    pub lease_holder: Option<TaskId>,
}

impl ModuleTransition {
    /// `true` when the change takes a leased module out of service, which
    /// forces the lease holder to abort.
    pub fn strands_lease(&self) -> bool {
        self.lease_holder.is_some()
            && matches!(
                self.to,
                ModuleStatus::Offline | ModuleStatus::Error | ModuleStatus::Disabled
            )
    }
}

struct ModuleRecord {
    info: ModuleInfo,
    faults: FaultHistory,
    /// Set when an Offline module re-registers; cleared by its next heartbeat.
    reregistered: bool,
}

impl ModuleRecord {
    fn set_status(&mut self, to: ModuleStatus) -> Option<ModuleTransition> {
        let from = self.info.status;
        if from == to {
            return None;
        }
        self.info.status = to;
        Some(ModuleTransition {
            module_id: self.info.id.clone(),
            from,
            to,
            lease_holder: self.info.lease,
        })
    }
}

type Record = Arc<Mutex<ModuleRecord>>;

/// Central registry of hardware modules.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use skyward_hal::registry::ModuleRegistry;
/// use skyward_types::{Capability, ModuleId, ModuleStatus, TaskId};
///
/// let registry = ModuleRegistry::default();
/// let mount = ModuleId::from("mount-1");
/// registry.register(&mount, [Capability::Mount].into(), Utc::now());
///
/// registry.lease(&mount, TaskId(1)).unwrap();
/// assert_eq!(registry.status(&mount).unwrap(), ModuleStatus::Leased);
/// assert!(registry.lease(&mount, TaskId(2)).is_err());
///
/// registry.release(&mount).unwrap();
/// assert_eq!(registry.status(&mount).unwrap(), ModuleStatus::Idle);
/// ```
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<BTreeMap<ModuleId, Record>>,
    heartbeat: HeartbeatPolicy,
    fault_policies: FaultPolicyTable,
}

impl ModuleRegistry {
    pub fn new(heartbeat: HeartbeatPolicy, fault_policies: FaultPolicyTable) -> Self {
        Self {
            modules: RwLock::new(BTreeMap::new()),
            heartbeat,
            fault_policies,
        }
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        self.heartbeat
    }

    // -----------------------------------------------------------------------
    // Registration and heartbeats
    // -----------------------------------------------------------------------

    /// Register `module_id` with its advertised `capabilities`.
    ///
    /// A new module starts Idle (the handshake counts as its first
    /// heartbeat).  An Offline module that re-registers stays Offline until
    /// its next successful heartbeat.  Re-registering an online module only
    /// refreshes its capabilities.
    ///
    /// Returns the transition for a newly created module.
    pub fn register(
        &self,
        module_id: &ModuleId,
        capabilities: CapabilitySet,
        now: DateTime<Utc>,
    ) -> Option<ModuleTransition> {
        if let Some(record) = self.record(module_id) {
            let mut rec = lock(&record);
            rec.info.capabilities = capabilities;
            if rec.info.status == ModuleStatus::Offline {
                rec.reregistered = true;
                info!(module = %module_id, "offline module re-registered; awaiting heartbeat");
            } else {
                rec.info.last_heartbeat = now;
            }
            return None;
        }

        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        // Lost a race with a concurrent registration of the same id.
        if modules.contains_key(module_id) {
            return None;
        }
        info!(module = %module_id, ?capabilities, "module registered");
        let record = ModuleRecord {
            info: ModuleInfo {
                id: module_id.clone(),
                capabilities,
                status: ModuleStatus::Idle,
                last_heartbeat: now,
                lease: None,
                registered_at: now,
            },
            faults: FaultHistory::new(),
            reregistered: false,
        };
        modules.insert(module_id.clone(), Arc::new(Mutex::new(record)));
        Some(ModuleTransition {
            module_id: module_id.clone(),
            from: ModuleStatus::Offline,
            to: ModuleStatus::Idle,
            lease_holder: None,
        })
    }

    /// Record a heartbeat carrying `health`.
    ///
    /// # Errors
    ///
    /// [`SkyError::UnknownModule`] when the module was never registered, or
    /// is Offline and has not re-registered since.
    pub fn heartbeat(
        &self,
        module_id: &ModuleId,
        health: &HealthInfo,
        now: DateTime<Utc>,
    ) -> Result<Option<ModuleTransition>, SkyError> {
        let record = self
            .record(module_id)
            .ok_or_else(|| SkyError::UnknownModule(module_id.clone()))?;
        let mut rec = lock(&record);

        if rec.info.status == ModuleStatus::Offline && !rec.reregistered {
            return Err(SkyError::UnknownModule(module_id.clone()));
        }
        rec.info.last_heartbeat = now;

        let mut fatal = false;
        for code in &health.faults {
            let policy = self.fault_policies.policy_for(code);
            if rec.faults.record(code, now, policy) == FaultVerdict::Fatal {
                fatal = true;
            }
        }

        if fatal && rec.info.status != ModuleStatus::Disabled {
            rec.reregistered = false;
            let transition = rec.set_status(ModuleStatus::Error);
            if transition.is_some() {
                warn!(module = %module_id, faults = ?health.faults, "fatal fault; module moved to error");
            }
            return Ok(transition);
        }

        if rec.info.status == ModuleStatus::Offline {
            rec.reregistered = false;
            info!(module = %module_id, "module back online");
            return Ok(rec.set_status(ModuleStatus::Idle));
        }
        Ok(None)
    }

    /// Move modules whose heartbeat expired to Offline.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ModuleTransition> {
        let mut transitions = Vec::new();
        for record in self.records() {
            let mut rec = lock(&record);
            let live = matches!(
                rec.info.status,
                ModuleStatus::Idle | ModuleStatus::Leased | ModuleStatus::Error
            );
            if live && self.heartbeat.is_expired(rec.info.last_heartbeat, now) {
                rec.reregistered = false;
                if let Some(t) = rec.set_status(ModuleStatus::Offline) {
                    warn!(
                        module = %t.module_id,
                        lease = ?t.lease_holder,
                        last_heartbeat = %rec.info.last_heartbeat,
                        "heartbeat expired; module offline"
                    );
                    transitions.push(t);
                }
            }
        }
        transitions
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self, module_id: &ModuleId) -> Result<ModuleStatus, SkyError> {
        self.get(module_id).map(|info| info.status)
    }

    pub fn get(&self, module_id: &ModuleId) -> Result<ModuleInfo, SkyError> {
        self.record(module_id)
            .map(|r| lock(&r).info.clone())
            .ok_or_else(|| SkyError::UnknownModule(module_id.clone()))
    }

    /// Available (Idle, unleased) modules advertising `capability`.
    pub fn list(&self, capability: &Capability) -> Vec<ModuleInfo> {
        self.snapshot()
            .into_iter()
            .filter(|m| m.is_available() && m.advertises(capability))
            .collect()
    }

    /// `true` when any registered module, in any status, advertises
    /// `capability`.
    pub fn advertises(&self, capability: &Capability) -> bool {
        self.records()
            .iter()
            .any(|r| lock(r).info.advertises(capability))
    }

    /// Copy of every record, ordered by module id.  Each record is copied
    /// under its own lock.
    pub fn snapshot(&self) -> Vec<ModuleInfo> {
        self.records().iter().map(|r| lock(r).info.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Lease a single module for `task_id`.
    pub fn lease(&self, module_id: &ModuleId, task_id: TaskId) -> Result<(), SkyError> {
        self.lease_all(std::slice::from_ref(module_id), task_id)
            .map(|_| ())
    }

    /// Lease every module in `module_ids` for `task_id`, or none of them.
    ///
    /// # Errors
    ///
    /// - [`SkyError::UnknownModule`] – an id is not registered.
    /// - [`SkyError::Conflict`] – a module is not Idle or already leased.
    pub fn lease_all(
        &self,
        module_ids: &[ModuleId],
        task_id: TaskId,
    ) -> Result<Vec<ModuleTransition>, SkyError> {
        let mut ids: Vec<&ModuleId> = module_ids.iter().collect();
        ids.sort();
        ids.dedup();

        let records: Vec<Record> = {
            let modules = self.read();
            ids.iter()
                .map(|id| {
                    modules
                        .get(*id)
                        .cloned()
                        .ok_or_else(|| SkyError::UnknownModule((*id).clone()))
                })
                .collect::<Result<_, _>>()?
        };

        // Ascending id order: the global lock order for module records.
        let mut guards: Vec<MutexGuard<'_, ModuleRecord>> = records.iter().map(lock).collect();

        if let Some(busy) = guards.iter().find(|g| !g.info.is_available()) {
            debug!(module = %busy.info.id, task = %task_id, status = %busy.info.status, "lease conflict");
            return Err(SkyError::Conflict(busy.info.id.clone()));
        }

        let mut transitions = Vec::with_capacity(guards.len());
        for guard in guards.iter_mut() {
            guard.info.lease = Some(task_id);
            if let Some(t) = guard.set_status(ModuleStatus::Leased) {
                transitions.push(t);
            }
        }
        debug!(task = %task_id, modules = ?ids, "modules leased");
        Ok(transitions)
    }

    /// Clear the lease on `module_id`.  A Leased module returns to Idle;
    /// modules in any other status keep it.
    pub fn release(&self, module_id: &ModuleId) -> Result<Option<ModuleTransition>, SkyError> {
        let record = self
            .record(module_id)
            .ok_or_else(|| SkyError::UnknownModule(module_id.clone()))?;
        let mut rec = lock(&record);
        Ok(release_record(&mut rec))
    }

    /// Release `module_id` only if `task_id` holds its lease.  Returns the
    /// resulting transition, if any.
    pub fn release_if_held(&self, module_id: &ModuleId, task_id: TaskId) -> Option<ModuleTransition> {
        let record = self.record(module_id)?;
        let mut rec = lock(&record);
        if rec.info.lease != Some(task_id) {
            return None;
        }
        release_record(&mut rec)
    }

    // -----------------------------------------------------------------------
    // Operator controls
    // -----------------------------------------------------------------------

    /// Take a module out of service.  A lease holder must be aborted by the
    /// caller (see [`ModuleTransition::strands_lease`]).
    pub fn disable(&self, module_id: &ModuleId) -> Result<Option<ModuleTransition>, SkyError> {
        let record = self
            .record(module_id)
            .ok_or_else(|| SkyError::UnknownModule(module_id.clone()))?;
        let mut rec = lock(&record);
        rec.reregistered = false;
        Ok(rec.set_status(ModuleStatus::Disabled))
    }

    /// Return a Disabled module to service: Idle when its heartbeat is still
    /// fresh, Offline otherwise.
    pub fn enable(
        &self,
        module_id: &ModuleId,
        now: DateTime<Utc>,
    ) -> Result<Option<ModuleTransition>, SkyError> {
        let record = self
            .record(module_id)
            .ok_or_else(|| SkyError::UnknownModule(module_id.clone()))?;
        let mut rec = lock(&record);
        if rec.info.status != ModuleStatus::Disabled {
            return Ok(None);
        }
        let to = if self.heartbeat.is_expired(rec.info.last_heartbeat, now) {
            ModuleStatus::Offline
        } else if rec.info.lease.is_some() {
            ModuleStatus::Leased
        } else {
            ModuleStatus::Idle
        };
        Ok(rec.set_status(to))
    }

    /// Forget the module's fault history and return an Error module to Idle.
    pub fn clear_faults(&self, module_id: &ModuleId) -> Result<Option<ModuleTransition>, SkyError> {
        let record = self
            .record(module_id)
            .ok_or_else(|| SkyError::UnknownModule(module_id.clone()))?;
        let mut rec = lock(&record);
        rec.faults.clear();
        if rec.info.status != ModuleStatus::Error {
            return Ok(None);
        }
        let to = if rec.info.lease.is_some() {
            ModuleStatus::Leased
        } else {
            ModuleStatus::Idle
        };
        info!(module = %module_id, "faults cleared");
        Ok(rec.set_status(to))
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ModuleId, Record>> {
        self.modules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, module_id: &ModuleId) -> Option<Record> {
        self.read().get(module_id).cloned()
    }

    fn records(&self) -> Vec<Record> {
        self.read().values().cloned().collect()
    }
}

fn lock(record: &Record) -> MutexGuard<'_, ModuleRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

fn release_record(rec: &mut ModuleRecord) -> Option<ModuleTransition> {
    let holder = rec.info.lease.take();
    if rec.info.status == ModuleStatus::Leased {
        let mut t = rec.set_status(ModuleStatus::Idle)?;
        t.lease_holder = holder;
        return Some(t);
    }
    None
}

/// Pick modules from `candidates` that jointly cover `required`.
///
/// Greedy set cover: repeatedly take the candidate covering the most still
/// uncovered capabilities, preferring modules with fewer capabilities (so
/// multi-purpose modules stay free for others), then the lower id.  Only
/// [available][ModuleInfo::is_available] candidates are considered.
///
/// Returns the chosen ids in ascending order, or `None` when the set cannot
/// be covered.
pub fn allocate(required: &CapabilitySet, candidates: &[ModuleInfo]) -> Option<Vec<ModuleId>> {
    let mut uncovered: CapabilitySet = required.clone();
    let mut pool: Vec<&ModuleInfo> = candidates.iter().filter(|m| m.is_available()).collect();
    let mut chosen = Vec::new();

    while !uncovered.is_empty() {
        let (index, gain) = pool
            .iter()
            .enumerate()
            .map(|(i, m)| (i, m.capabilities.intersection(&uncovered).count()))
            .filter(|(_, gain)| *gain > 0)
            .max_by(|(ia, ga), (ib, gb)| {
                let (a, b) = (pool[*ia], pool[*ib]);
                ga.cmp(gb)
                    .then_with(|| b.capabilities.len().cmp(&a.capabilities.len()))
                    .then_with(|| b.id.cmp(&a.id))
            })?;
        debug_assert!(gain > 0);
        let module = pool.swap_remove(index);
        uncovered.retain(|c| !module.capabilities.contains(c));
        chosen.push(module.id.clone());
    }

    chosen.sort();
    Some(chosen)
}
