//! Container lifecycle management

use super::backend::{ContainerBackend, LinuxBackend};
use super::config::{ContainerInfo, ContainerRecord, ContainerStatus, CreateRequest};
use super::lock::RootLock;
use super::monitor::MonitorHandle;
use super::state::StateStore;
use crate::config::RuntimeConfig;
use crate::error::{CorralError, Result};
use crate::filesystem::FilesystemRecord;
use crate::network::bridge::veth_names;
use crate::network::NetworkRecord;
use crate::runtime::{is_alive, ContainerProcess};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// A registry slot: the record plus what only lives in memory
#[derive(Debug)]
pub(crate) struct ContainerEntry {
    pub(crate) record: ContainerRecord,
    pub(crate) process: Option<ContainerProcess>,
    /// A lifecycle call is working on this container unlocked
    pub(crate) busy: bool,
    pub(crate) monitor: Option<MonitorHandle>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) entries: HashMap<String, ContainerEntry>,
    /// Ids and names claimed by creates still in progress
    pending: HashMap<String, String>,
}

impl Registry {
    fn name_taken(&self, name: &str) -> bool {
        self.entries.values().any(|e| e.record.name == name)
            || self.pending.values().any(|n| n == name)
    }

    fn id_taken(&self, id: &str) -> bool {
        let (veth, _) = veth_names(id);
        self.entries.contains_key(id)
            || self.pending.contains_key(id)
            || self
                .entries
                .values()
                .any(|e| e.record.network.host_veth == veth)
            || self.pending.keys().any(|p| veth_names(p).0 == veth)
    }

    fn generate_id(&self) -> String {
        loop {
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let id = format!("real-{}", nanos);
            if !self.id_taken(&id) {
                return id;
            }
        }
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut ContainerEntry> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| CorralError::IdNotFound(id.to_string()))
    }
}

/// State shared between the manager and its monitor workers
#[derive(Debug)]
pub(crate) struct Shared {
    registry: RwLock<Registry>,
    pub(crate) backend: Arc<dyn ContainerBackend>,
    pub(crate) store: StateStore,
    pub(crate) monitor_interval: Duration,
    lock_path: PathBuf,
}

impl Shared {
    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        self.registry
            .read()
            .map_err(|_| CorralError::Lock("Failed to acquire read lock".to_string()))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        self.registry
            .write()
            .map_err(|_| CorralError::Lock("Failed to acquire write lock".to_string()))
    }

    /// The root lock, if no lifecycle call in any instance holds it
    pub(crate) fn try_lock(&self) -> Result<Option<RootLock>> {
        RootLock::try_acquire(&self.lock_path)
    }

    /// Save after a transition that already happened; failures are logged
    fn persist(&self, record: &ContainerRecord) {
        if let Err(e) = self.store.save(record) {
            tracing::error!(container = %record.id, "Failed to save state: {}", e);
        }
    }
}

/// Container manager for handling container lifecycle
#[derive(Debug)]
pub struct ContainerManager {
    shared: Arc<Shared>,
    stop_grace: Duration,
}

impl ContainerManager {
    /// Open the registry under `config.root_dir` with the kernel backend
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let backend = Arc::new(LinuxBackend::new(config)?);
        Self::with_backend(config, backend)
    }

    /// Open the registry with `backend`, reconciling records left by earlier runs
    pub fn with_backend(config: &RuntimeConfig, backend: Arc<dyn ContainerBackend>) -> Result<Self> {
        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::default()),
            backend,
            store: StateStore::new(config.containers_dir()),
            monitor_interval: config.monitor_interval(),
            lock_path: config.lock_file(),
        });
        let manager = Self {
            shared,
            stop_grace: config.stop_grace(),
        };
        drop(manager.lock()?);
        Ok(manager)
    }

    /// Take the root lock and pick up what other instances changed on disk
    fn lock(&self) -> Result<RootLock> {
        let lock = RootLock::acquire(&self.shared.lock_path)?;
        self.refresh()?;
        Ok(lock)
    }

    /// Bring the registry in line with the state files. Callers hold the root
    /// lock, so no entry is busy.
    fn refresh(&self) -> Result<()> {
        let shared = &self.shared;
        let records = shared.store.load_all()?;
        let mut registry = shared.write()?;

        let saved: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let known = registry.entries.len();
        registry.entries.retain(|id, _| saved.contains(id));
        let mut changed = registry.entries.len() != known;

        for mut record in records {
            if let Some(entry) = registry.entries.get_mut(&record.id) {
                changed |= entry.record.network != record.network;
                if !record.is_running() {
                    if let Some(mut process) = entry.process.take() {
                        let _ = process.try_wait();
                    }
                    entry.monitor = None;
                } else if entry.record.pid != record.pid {
                    entry.process = record.pid.map(ContainerProcess::adopt);
                }
                record.last_usage = entry.record.last_usage.take();
                entry.record = record;
                continue;
            }

            changed = true;
            let mut process = None;
            if record.is_running() {
                match record.pid {
                    Some(pid) if is_alive(pid) => process = Some(ContainerProcess::adopt(pid)),
                    _ => {
                        tracing::info!(container = %record.id, "container exited while unobserved");
                        record.mark_stopped(None);
                        shared.persist(&record);
                    }
                }
            }
            registry.entries.insert(
                record.id.clone(),
                ContainerEntry {
                    record,
                    process,
                    busy: false,
                    monitor: None,
                },
            );
        }

        if changed {
            let networks: Vec<NetworkRecord> = registry
                .entries
                .values()
                .map(|e| e.record.network.clone())
                .collect();
            if let Err(e) = shared.backend.restore_network(&networks) {
                tracing::warn!("Failed to restore network reservations: {}", e);
            }
        }

        for (id, entry) in registry.entries.iter_mut() {
            if entry.record.is_running() && entry.monitor.is_none() {
                entry.monitor = start_monitor(shared, id);
            }
        }
        Ok(())
    }

    pub fn backend(&self) -> &dyn ContainerBackend {
        self.shared.backend.as_ref()
    }

    /// Host capability checks, one result per manager
    pub fn check_support(&self) -> Vec<(&'static str, Result<()>)> {
        self.shared.backend.support_report()
    }

    /// Provision a container and register it as `created`. Returns its id.
    pub fn create(&self, request: CreateRequest) -> Result<String> {
        request.validate()?;
        self.shared.backend.check_support()?;
        let _lock = self.lock()?;

        let id = {
            let mut registry = self.shared.write()?;
            if registry.name_taken(&request.name) {
                return Err(CorralError::NameConflict(request.name));
            }
            let id = registry.generate_id();
            registry.pending.insert(id.clone(), request.name.clone());
            id
        };

        let provisioned = self.provision(&id, &request).and_then(|record| {
            match self.shared.store.save(&record) {
                Ok(()) => Ok(record),
                Err(e) => {
                    self.unwind(&id, &record.filesystem, Some(&record.network), true);
                    Err(e)
                }
            }
        });

        let mut registry = self.shared.write()?;
        registry.pending.remove(&id);
        let record = provisioned?;

        tracing::info!(container = %id, name = %record.name, image = %record.image, "created container");
        registry.entries.insert(
            id.clone(),
            ContainerEntry {
                record,
                process: None,
                busy: false,
                monitor: None,
            },
        );
        Ok(id)
    }

    /// Filesystem, then network, then cgroup; a failure unwinds in reverse
    fn provision(&self, id: &str, request: &CreateRequest) -> Result<ContainerRecord> {
        let backend = &self.shared.backend;

        let filesystem = match backend.create_filesystem(id, &request.image) {
            Ok(filesystem) => filesystem,
            Err(e) => {
                self.discard_state(id);
                return Err(e);
            }
        };

        let mut network = match backend.create_network(id, &request.name) {
            Ok(network) => network,
            Err(e) => {
                self.unwind(id, &filesystem, None, false);
                return Err(e);
            }
        };

        let configured = backend.write_resolv_conf(&filesystem).and_then(|()| {
            request
                .ports
                .iter()
                .try_for_each(|map| backend.add_port_map(&mut network, *map))
        });
        if let Err(e) = configured {
            self.unwind(id, &filesystem, Some(&network), false);
            return Err(e);
        }

        let mut cgroup = match backend.create_cgroup(id) {
            Ok(cgroup) => cgroup,
            Err(e) => {
                self.unwind(id, &filesystem, Some(&network), false);
                return Err(e);
            }
        };
        if let Err(e) = backend.apply_limits(id, &request.limits) {
            self.unwind(id, &filesystem, Some(&network), true);
            return Err(e);
        }
        cgroup.limits = request.limits;

        Ok(ContainerRecord {
            id: id.to_string(),
            name: request.name.clone(),
            image: request.image.clone(),
            command: request.command.clone(),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            pid: None,
            exit_code: None,
            resource_limits: request.limits,
            filesystem,
            network,
            cgroup,
            last_usage: None,
        })
    }

    fn unwind(
        &self,
        id: &str,
        filesystem: &FilesystemRecord,
        network: Option<&NetworkRecord>,
        cgroup: bool,
    ) {
        let backend = &self.shared.backend;
        if cgroup {
            if let Err(e) = backend.cleanup_cgroup(id) {
                tracing::warn!(container = id, "Failed to remove cgroup: {}", e);
            }
        }
        if let Some(network) = network {
            if let Err(e) = backend.cleanup_network(network) {
                tracing::warn!(container = id, "Failed to remove network: {}", e);
            }
        }
        if let Err(e) = backend.cleanup_filesystem(filesystem) {
            tracing::warn!(container = id, "Failed to remove filesystem: {}", e);
        }
        self.discard_state(id);
    }

    fn discard_state(&self, id: &str) {
        if let Err(e) = self.shared.store.remove(id) {
            tracing::warn!(container = id, "Failed to remove container directory: {}", e);
        }
    }

    /// Start a created container
    pub fn start(&self, id: &str) -> Result<()> {
        let _lock = self.lock()?;
        let record = {
            let mut registry = self.shared.write()?;
            let entry = registry.entry_mut(id)?;
            if entry.busy {
                return Err(CorralError::state_conflict(id, "busy", "start"));
            }
            if !entry.record.status.can_start() {
                return Err(CorralError::state_conflict(id, entry.record.status, "start"));
            }
            entry.busy = true;
            entry.record.clone()
        };

        let launched = self.launch(&record);

        let mut registry = self.shared.write()?;
        let entry = registry.entry_mut(id)?;
        entry.busy = false;

        match launched {
            Ok(process) => {
                entry.record.status = ContainerStatus::Running;
                entry.record.pid = Some(process.pid());
                entry.record.started_at = Some(Utc::now());
                entry.record.finished_at = None;
                entry.record.exit_code = None;
                entry.process = Some(process);
                self.shared.persist(&entry.record);
                entry.monitor = start_monitor(&self.shared, id);
                tracing::info!(container = id, pid = ?entry.record.pid, "started container");
                Ok(())
            }
            Err((e, Some(process))) => {
                entry.record.mark_stopped(process.exit_code());
                self.shared.persist(&entry.record);
                tracing::warn!(container = id, "start failed: {}", e);
                Err(e)
            }
            Err((e, None)) => Err(e),
        }
    }

    /// Spawn, attach to the cgroup, release. A process that got as far as
    /// being spawned is killed and reaped on failure and handed back.
    fn launch(
        &self,
        record: &ContainerRecord,
    ) -> std::result::Result<ContainerProcess, (CorralError, Option<ContainerProcess>)> {
        let backend = &self.shared.backend;
        let mut process = backend.spawn(record).map_err(|e| (e, None))?;

        let attached = backend
            .attach_cgroup(&record.id, process.pid())
            .and_then(|()| process.release());
        if let Err(e) = attached {
            process.kill_and_reap();
            return Err((e, Some(process)));
        }
        Ok(process)
    }

    /// Stop a running container: SIGTERM, then SIGKILL after the grace period
    pub fn stop(&self, id: &str) -> Result<()> {
        let _lock = self.lock()?;
        self.stop_locked(id)
    }

    fn stop_locked(&self, id: &str) -> Result<()> {
        let (process, monitor) = {
            let mut registry = self.shared.write()?;
            let entry = registry.entry_mut(id)?;
            if entry.busy {
                return Err(CorralError::state_conflict(id, "busy", "stop"));
            }
            match entry.record.status {
                ContainerStatus::Stopped => return Ok(()),
                ContainerStatus::Created => {
                    return Err(CorralError::state_conflict(id, entry.record.status, "stop"))
                }
                ContainerStatus::Running => {}
            }
            entry.busy = true;
            let process = entry
                .process
                .take()
                .or_else(|| entry.record.pid.map(ContainerProcess::adopt));
            (process, entry.monitor.take())
        };

        if let Some(monitor) = monitor {
            monitor.stop();
        }

        let mut process = process;
        let terminated = match process.as_mut() {
            Some(process) => self.shared.backend.terminate(id, process, self.stop_grace),
            None => Ok(false),
        };

        let mut registry = self.shared.write()?;
        let entry = registry.entry_mut(id)?;
        entry.busy = false;

        match terminated {
            Ok(escalated) => {
                if escalated {
                    tracing::warn!(container = id, "container ignored SIGTERM, killed");
                }
                entry
                    .record
                    .mark_stopped(process.as_ref().and_then(ContainerProcess::exit_code));
                self.shared.persist(&entry.record);
                tracing::info!(container = id, exit_code = ?entry.record.exit_code, "stopped container");
                Ok(())
            }
            Err(e) => {
                entry.process = process;
                entry.monitor = start_monitor(&self.shared, id);
                Err(e)
            }
        }
    }

    /// Remove a container, stopping it first when it runs.
    ///
    /// Every cleanup step is attempted and the record is always deleted. A
    /// failed stop is reported with the cleanup failures, after the init
    /// process has been killed.
    pub fn remove(&self, id: &str) -> Result<()> {
        let _lock = self.lock()?;
        let running = {
            let registry = self.shared.read()?;
            let entry = registry
                .entries
                .get(id)
                .ok_or_else(|| CorralError::IdNotFound(id.to_string()))?;
            if entry.busy {
                return Err(CorralError::state_conflict(id, "busy", "remove"));
            }
            entry.record.is_running()
        };

        let mut failures: Vec<CorralError> = Vec::new();
        if running {
            if let Err(e) = self.stop_locked(id) {
                tracing::warn!(container = id, "Failed to stop before removal: {}", e);
                failures.push(e);
            }
        }

        let (record, process, monitor) = {
            let mut registry = self.shared.write()?;
            let entry = registry.entry_mut(id)?;
            if entry.busy {
                return Err(CorralError::state_conflict(id, "busy", "remove"));
            }
            entry.busy = true;
            (entry.record.clone(), entry.process.take(), entry.monitor.take())
        };
        if let Some(monitor) = monitor {
            monitor.stop();
        }
        // only still running when the stop above failed
        if record.is_running() {
            if let Some(mut process) = process.or_else(|| record.pid.map(ContainerProcess::adopt)) {
                process.kill_and_reap();
            }
        }

        let backend = &self.shared.backend;
        let steps = [
            ("cgroup", backend.cleanup_cgroup(id)),
            ("filesystem", backend.cleanup_filesystem(&record.filesystem)),
            ("network", backend.cleanup_network(&record.network)),
            ("state", self.shared.store.remove(id)),
        ];
        for (step, result) in steps {
            if let Err(e) = result {
                tracing::warn!(container = id, "Failed to clean up {}: {}", step, e);
                failures.push(e);
            }
        }

        self.shared.write()?.entries.remove(id);

        if failures.is_empty() {
            tracing::info!(container = id, "removed container");
            return Ok(());
        }
        let failed = failures.len();
        let first = failures.remove(0);
        Err(CorralError::CleanupPartial {
            id: id.to_string(),
            failed,
            first: Box::new(first),
        })
    }

    /// Get container by ID
    pub fn get(&self, id: &str) -> Result<ContainerRecord> {
        let registry = self.shared.read()?;
        registry
            .entries
            .get(id)
            .map(|e| e.record.clone())
            .ok_or_else(|| CorralError::IdNotFound(id.to_string()))
    }

    /// All containers, oldest first
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let registry = self.shared.read()?;
        let mut records: Vec<ContainerRecord> =
            registry.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Ids of the running containers
    pub fn running_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(ContainerRecord::is_running)
            .map(|r| r.id)
            .collect())
    }

    /// Snapshot with a fresh usage sample, disk usage and network details
    pub fn info(&self, id: &str) -> Result<ContainerInfo> {
        let container = self.get(id)?;
        let backend = &self.shared.backend;

        let usage = match backend.sample_usage(id) {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::debug!(container = id, "usage sample failed: {}", e);
                container.last_usage
            }
        };
        let filesystem = match backend.filesystem_info(&container.filesystem) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(container = id, "Failed to read filesystem usage: {}", e);
                None
            }
        };
        let network = backend.network_info(&container.network);

        Ok(ContainerInfo {
            container,
            usage,
            filesystem,
            network,
        })
    }

    /// Cancel every monitor and wait for the workers to exit
    pub fn shutdown(&self) {
        let monitors: Vec<MonitorHandle> = match self.shared.write() {
            Ok(mut registry) => registry
                .entries
                .values_mut()
                .filter_map(|e| e.monitor.take())
                .collect(),
            Err(e) => {
                tracing::error!("shutdown: {}", e);
                return;
            }
        };
        for monitor in monitors {
            monitor.stop();
        }
    }
}

impl Drop for ContainerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_monitor(shared: &Arc<Shared>, id: &str) -> Option<MonitorHandle> {
    match MonitorHandle::spawn(Arc::clone(shared), id.to_string()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(container = id, "Failed to start monitor: {}", e);
            None
        }
    }
}
