//! Top-level registry of groups.
//!
//! The manager is constructed explicitly and shared as `Arc<Manager>`; all
//! mutations are serialized through one mutex. Every structural mutation
//! (groups, instances, import) is persisted before returning. A failed
//! persist is logged and remembered, but the in-memory change stands:
//! callers read [`Manager::last_persist_error`] and retry with
//! [`Manager::save`].

pub mod callbacks;
pub mod error;
pub mod store;

use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::group::{Group, GroupConfig, GroupStatus};
use crate::instance::{Instance, InstanceConfig};

pub use callbacks::{CallbackRegistry, EventHandler, EventPayload, LifecycleEvent};
pub use error::{PersistError, RegistryError};
pub use store::{StateDocument, StateStore};

/// Totals across every group.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStatus {
    pub total_groups: usize,
    pub total_instances: usize,
    pub total_running: usize,
    pub total_stopped: usize,
    pub total_memory_mb: f64,
    pub groups: BTreeMap<String, GroupStatus>,
}

pub struct Manager {
    store: StateStore,
    groups: Mutex<BTreeMap<String, Group>>,
    callbacks: CallbackRegistry,
    last_persist_error: Mutex<Option<String>>,
}

impl Manager {
    /// Empty registry backed by `state_file`. Nothing is read from disk.
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            store: StateStore::new(state_file),
            groups: Mutex::new(BTreeMap::new()),
            callbacks: CallbackRegistry::new(),
            last_persist_error: Mutex::new(None),
        }
    }

    /// Registry restored from `state_file`. A missing or unreadable file yields an
    /// empty registry; restored instances are always stopped.
    pub fn open(state_file: impl Into<PathBuf>) -> Self {
        let manager = Self::new(state_file);
        match manager.store.load() {
            Ok(Some(groups)) => {
                if let Ok(mut current) = manager.lock() {
                    *current = groups;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to load registry, starting empty: {}", e),
        }
        manager
    }

    pub fn state_path(&self) -> &Path {
        self.store.path()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Group>>, RegistryError> {
        self.groups.lock().map_err(|e| {
            tracing::error!("Registry lock poisoned: {}", e);
            RegistryError::LockPoisoned
        })
    }

    /// Best-effort persist used after mutations; failure is recorded, not returned.
    fn persist(&self, groups: &BTreeMap<String, Group>) {
        let result = self.store.save(groups.values());
        let mut last = self.last_persist_error.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => *last = None,
            Err(e) => {
                tracing::error!("Failed to persist registry: {}", e);
                *last = Some(e.to_string());
            }
        }
    }

    /// Writes the registry to the state file, reporting failure to the caller.
    pub fn save(&self) -> Result<(), RegistryError> {
        let groups = self.lock()?;
        let result = self.store.save(groups.values());
        let mut last = self.last_persist_error.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => {
                *last = None;
                Ok(())
            }
            Err(e) => {
                *last = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Message of the most recent failed persist, cleared by the next successful one.
    pub fn last_persist_error(&self) -> Option<String> {
        self.last_persist_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True when in-memory state may be newer than the state file.
    pub fn is_dirty(&self) -> bool {
        self.last_persist_error().is_some()
    }

    // ── groups ────────────────────────────────────────────

    /// Creates a group, or returns the existing one unchanged.
    pub fn create_group(&self, name: &str, config: Option<GroupConfig>) -> Result<Group, RegistryError> {
        let mut groups = self.lock()?;
        if let Some(existing) = groups.get(name) {
            tracing::warn!(group = %name, "Group already exists");
            return Ok(existing.clone());
        }

        let group = Group::new(name, config.unwrap_or_default());
        groups.insert(name.to_string(), group.clone());
        self.persist(&groups);
        tracing::info!(group = %name, "Created group");
        Ok(group)
    }

    /// Deletes a group unless any of its instances is still running.
    pub fn delete_group(&self, name: &str) -> Result<Group, RegistryError> {
        let mut groups = self.lock()?;
        let group = groups
            .get(name)
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))?;

        let running = group
            .instances()
            .values()
            .filter(|i| i.owns_process())
            .count();
        if running > 0 {
            tracing::warn!(group = %name, running, "Refusing to delete group with running instances");
            return Err(RegistryError::GroupHasRunningInstances {
                group: name.to_string(),
                running,
            });
        }

        let removed = groups
            .remove(name)
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))?;
        self.persist(&groups);
        tracing::info!(group = %name, "Deleted group");
        Ok(removed)
    }

    pub fn group(&self, name: &str) -> Option<Group> {
        self.lock().ok()?.get(name).cloned()
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.lock().map(|g| g.contains_key(name)).unwrap_or(false)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.lock().map(|g| g.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.lock().map(|g| g.values().cloned().collect()).unwrap_or_default()
    }

    // ── instances ─────────────────────────────────────────

    pub fn create_instance(
        &self,
        group_name: &str,
        instance_id: &str,
        config: InstanceConfig,
    ) -> Result<Instance, RegistryError> {
        let mut groups = self.lock()?;
        let group = groups.get_mut(group_name).ok_or_else(|| {
            tracing::warn!(group = %group_name, "Group does not exist");
            RegistryError::GroupNotFound(group_name.to_string())
        })?;

        let instance = Instance::new(instance_id, config);
        if !group.add(instance.clone()) {
            return Err(RegistryError::DuplicateInstance {
                group: group_name.to_string(),
                instance: instance_id.to_string(),
            });
        }
        self.persist(&groups);
        tracing::info!(group = %group_name, instance = %instance_id, "Created instance");
        Ok(instance)
    }

    /// Removes an instance (stopping it if running) and returns its final state.
    pub fn delete_instance(&self, group_name: &str, instance_id: &str) -> Result<Instance, RegistryError> {
        let mut groups = self.lock()?;
        let group = groups
            .get_mut(group_name)
            .ok_or_else(|| RegistryError::GroupNotFound(group_name.to_string()))?;
        let removed = group.remove(instance_id).ok_or_else(|| RegistryError::InstanceNotFound {
            group: group_name.to_string(),
            instance: instance_id.to_string(),
        })?;
        self.persist(&groups);
        tracing::info!(group = %group_name, instance = %instance_id, "Deleted instance");
        Ok(removed)
    }

    pub fn instance(&self, group_name: &str, instance_id: &str) -> Option<Instance> {
        self.lock().ok()?.get(group_name)?.get(instance_id).cloned()
    }

    /// Runs `f` against a live instance. Call [`Manager::save`] afterwards if `f`
    /// changed configuration that must survive a restart.
    pub fn update_instance<R>(
        &self,
        group_name: &str,
        instance_id: &str,
        f: impl FnOnce(&mut Instance) -> R,
    ) -> Result<R, RegistryError> {
        let mut groups = self.lock()?;
        let instance = groups
            .get_mut(group_name)
            .ok_or_else(|| RegistryError::GroupNotFound(group_name.to_string()))?
            .get_mut(instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound {
                group: group_name.to_string(),
                instance: instance_id.to_string(),
            })?;
        Ok(f(instance))
    }

    /// Flattened `(group, instance_id, instance)` listing.
    pub fn all_instances(&self) -> Vec<(String, String, Instance)> {
        let Ok(groups) = self.lock() else {
            return Vec::new();
        };
        groups
            .iter()
            .flat_map(|(gname, group)| {
                group
                    .instances()
                    .iter()
                    .map(move |(id, inst)| (gname.clone(), id.clone(), inst.clone()))
            })
            .collect()
    }

    // ── callbacks ─────────────────────────────────────────

    pub fn register_callback<F>(&self, event: &str, handler: F) -> bool
    where
        F: Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.register(event, handler)
    }

    pub fn trigger_callback(&self, event: &str, payload: &EventPayload) -> usize {
        self.callbacks.trigger(event, payload)
    }

    // ── aggregation ───────────────────────────────────────

    pub fn global_status(&self) -> GlobalStatus {
        let Ok(groups) = self.lock() else {
            return GlobalStatus::default();
        };
        let mut status = GlobalStatus {
            total_groups: groups.len(),
            ..Default::default()
        };
        for (name, group) in groups.iter() {
            let gs = group.aggregate_status();
            status.total_instances += gs.total_instances;
            status.total_running += gs.running_count;
            status.total_memory_mb += gs.total_memory_mb;
            status.groups.insert(name.clone(), gs);
        }
        status.total_stopped = status.total_instances - status.total_running;
        status
    }

    // ── export / import ───────────────────────────────────

    pub fn export_config(&self, path: &Path) -> Result<(), RegistryError> {
        let groups = self.lock()?;
        let mut doc = StateDocument::from_groups(groups.values());
        doc.exported_at = Some(Local::now());
        store::write_document(path, &doc)?;
        tracing::info!("Exported {} groups to {}", doc.groups.len(), path.display());
        Ok(())
    }

    /// Imports groups from `path`, skipping names that already exist.
    /// Returns the names that were imported.
    pub fn import_config(&self, path: &Path) -> Result<Vec<String>, RegistryError> {
        let doc = store::read_document(path)?;
        let mut groups = self.lock()?;
        let mut imported = Vec::new();
        for (name, group_doc) in doc.groups {
            if groups.contains_key(&name) {
                tracing::warn!(group = %name, "Group already exists, skipping import");
                continue;
            }
            let group = store::group_from_document(&name, group_doc);
            groups.insert(name.clone(), group);
            imported.push(name);
        }
        self.persist(&groups);
        tracing::info!("Imported {} groups from {}", imported.len(), path.display());
        Ok(imported)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.global_status();
        write!(
            f,
            "<Manager groups={} instances={}/{}>",
            status.total_groups, status.total_running, status.total_instances
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceStatus, ProcessInfo};
    use serde_json::json;

    fn cfg(v: serde_json::Value) -> InstanceConfig {
        v.as_object().cloned().unwrap()
    }

    fn manager() -> (tempfile::TempDir, Manager) {
        let tmp = tempfile::tempdir().unwrap();
        let manager = Manager::new(tmp.path().join("config").join("multi_bot_config.json"));
        (tmp, manager)
    }

    #[test]
    fn create_group_is_idempotent() {
        let (_tmp, m) = manager();
        m.create_group("g1", Some(GroupConfig::with_launch_interval(5))).unwrap();
        let again = m.create_group("g1", Some(GroupConfig::with_launch_interval(9))).unwrap();
        assert_eq!(again.config.launch_interval, Some(5));
        assert_eq!(m.group_names(), vec!["g1".to_string()]);
    }

    #[test]
    fn mutations_are_persisted() {
        let (_tmp, m) = manager();
        m.create_group("g1", None).unwrap();
        m.create_instance("g1", "b1", cfg(json!({ "qq": "1" }))).unwrap();
        assert!(m.state_path().exists());
        assert!(!m.is_dirty());

        let reopened = Manager::open(m.state_path());
        assert_eq!(reopened.instance("g1", "b1").unwrap().config["qq"], "1");
    }

    #[test]
    fn create_instance_requires_group_and_unique_id() {
        let (_tmp, m) = manager();
        assert!(matches!(
            m.create_instance("nope", "b1", InstanceConfig::new()),
            Err(RegistryError::GroupNotFound(_))
        ));
        m.create_group("g1", None).unwrap();
        m.create_instance("g1", "b1", InstanceConfig::new()).unwrap();
        assert!(matches!(
            m.create_instance("g1", "b1", InstanceConfig::new()),
            Err(RegistryError::DuplicateInstance { .. })
        ));
    }

    #[test]
    fn same_instance_id_allowed_in_different_groups() {
        let (_tmp, m) = manager();
        m.create_group("g1", None).unwrap();
        m.create_group("g2", None).unwrap();
        m.create_instance("g1", "bot", InstanceConfig::new()).unwrap();
        m.create_instance("g2", "bot", InstanceConfig::new()).unwrap();
        assert_eq!(m.all_instances().len(), 2);
    }

    #[test]
    fn delete_group_with_running_instance_is_rejected() {
        let (_tmp, m) = manager();
        m.create_group("g1", None).unwrap();
        m.create_instance("g1", "b1", InstanceConfig::new()).unwrap();
        m.update_instance("g1", "b1", |i| i.start(ProcessInfo::with_pid(10))).unwrap();

        let err = m.delete_group("g1").unwrap_err();
        assert!(matches!(err, RegistryError::GroupHasRunningInstances { running: 1, .. }));
        let inst = m.instance("g1", "b1").unwrap();
        assert_eq!(inst.status(), InstanceStatus::Running);
        assert_eq!(inst.pid(), Some(10));

        m.update_instance("g1", "b1", |i| i.stop()).unwrap();
        m.delete_group("g1").unwrap();
        assert!(m.group("g1").is_none());
    }

    #[test]
    fn delete_group_counts_failed_instances_holding_a_pid() {
        let (_tmp, m) = manager();
        m.create_group("g1", None).unwrap();
        m.create_instance("g1", "b1", InstanceConfig::new()).unwrap();
        m.create_instance("g1", "b2", InstanceConfig::new()).unwrap();
        m.update_instance("g1", "b1", |i| {
            i.start(ProcessInfo::with_pid(10));
            i.set_error("terminate failed");
        })
        .unwrap();
        m.update_instance("g1", "b2", |i| i.set_error("spawn failed")).unwrap();

        let err = m.delete_group("g1").unwrap_err();
        assert!(matches!(err, RegistryError::GroupHasRunningInstances { running: 1, .. }));
    }

    #[test]
    fn delete_instance_stops_running_instance() {
        let (_tmp, m) = manager();
        m.create_group("g1", None).unwrap();
        m.create_instance("g1", "b1", InstanceConfig::new()).unwrap();
        m.update_instance("g1", "b1", |i| i.start(ProcessInfo::with_pid(10))).unwrap();

        let removed = m.delete_instance("g1", "b1").unwrap();
        assert_eq!(removed.status(), InstanceStatus::Stopped);
        assert!(m.instance("g1", "b1").is_none());
        assert!(matches!(
            m.delete_instance("g1", "b1"),
            Err(RegistryError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn global_status_with_no_groups_is_zeroed() {
        let (_tmp, m) = manager();
        let status = m.global_status();
        assert_eq!(status.total_groups, 0);
        assert_eq!(status.total_instances, 0);
        assert_eq!(status.total_memory_mb, 0.0);
    }

    #[test]
    fn global_status_sums_groups() {
        let (_tmp, m) = manager();
        for g in ["g1", "g2"] {
            m.create_group(g, None).unwrap();
            m.create_instance(g, "a", InstanceConfig::new()).unwrap();
            m.create_instance(g, "b", InstanceConfig::new()).unwrap();
        }
        m.update_instance("g2", "a", |i| {
            i.start(ProcessInfo::with_pid(1));
            i.update_resource_usage(3.0, 128.0);
        })
        .unwrap();

        let status = m.global_status();
        assert_eq!(status.total_groups, 2);
        assert_eq!(status.total_instances, 4);
        assert_eq!(status.total_running, 1);
        assert_eq!(status.total_stopped, 3);
        assert_eq!(status.total_memory_mb, 128.0);
        assert_eq!(status.groups["g2"].running_count, 1);
    }

    #[test]
    fn persist_failure_is_recorded_but_mutation_stands() {
        let tmp = tempfile::tempdir().unwrap();
        // parent "directory" is a regular file, so every write fails
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let m = Manager::new(blocker.join("state.json"));

        m.create_group("g1", None).unwrap();
        assert!(m.group("g1").is_some());
        assert!(m.is_dirty());
        assert!(m.last_persist_error().is_some());
        assert!(matches!(m.save(), Err(RegistryError::Persist(_))));
    }

    #[test]
    fn import_skips_existing_groups() {
        let (tmp, m) = manager();
        m.create_group("keep", Some(GroupConfig::with_launch_interval(1))).unwrap();
        m.create_group("new", None).unwrap();
        m.create_instance("new", "b1", cfg(json!({ "x": 1 }))).unwrap();
        let export = tmp.path().join("export.json");
        m.export_config(&export).unwrap();

        let other = Manager::new(tmp.path().join("other.json"));
        other.create_group("keep", Some(GroupConfig::with_launch_interval(7))).unwrap();
        let imported = other.import_config(&export).unwrap();
        assert_eq!(imported, vec!["new".to_string()]);
        assert_eq!(other.group("keep").unwrap().config.launch_interval, Some(7));
        assert_eq!(other.instance("new", "b1").unwrap().config["x"], 1);
    }

    #[test]
    fn callbacks_can_reenter_manager() {
        let (_tmp, m) = manager();
        let m = std::sync::Arc::new(m);
        m.create_group("g1", None).unwrap();
        let inner = m.clone();
        m.register_callback("on_start", move |p| {
            inner.update_instance(&p.group, &p.instance, |i| i.update_resource_usage(0.0, 1.0))?;
            Ok(())
        });
        m.create_instance("g1", "b1", InstanceConfig::new()).unwrap();
        assert_eq!(m.trigger_callback("on_start", &EventPayload::new("g1", "b1")), 1);
        assert!(m.instance("g1", "b1").unwrap().resource_usage().is_some());
    }
}
