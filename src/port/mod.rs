//! Per-instance port assignment on top of the registry.

pub mod allocator;
pub mod env_file;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::instance::{Instance, InstanceStatus};
use crate::manager::Manager;

pub use allocator::{PortAllocator, PortProbe, PortState, TcpProbe, RESERVED_PORTS};

pub const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Debug, Clone, Serialize)]
pub struct InstancePortInfo {
    pub port: Option<u16>,
    pub instance_status: InstanceStatus,
    pub is_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub allocated_ports: BTreeMap<String, u16>,
    pub available_ports: usize,
    pub conflicts: BTreeMap<u16, Vec<String>>,
    pub next_available: Option<u16>,
    pub port_range: String,
}

/// Allocation key for an instance. Scoped by group so equal ids in two groups
/// get independent ports.
pub fn allocation_key(group_name: &str, instance_id: &str) -> String {
    format!("{}_{}", group_name, instance_id)
}

/// `config.ports.api` of an instance, if set.
pub fn configured_api_port(instance: &Instance) -> Option<u16> {
    instance
        .config
        .get("ports")?
        .get("api")?
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
}

pub struct PortManager {
    manager: Arc<Manager>,
    allocator: PortAllocator,
    env_file_name: String,
}

impl PortManager {
    pub fn new(manager: Arc<Manager>, allocator: PortAllocator) -> Self {
        Self {
            manager,
            allocator,
            env_file_name: DEFAULT_ENV_FILE.to_string(),
        }
    }

    pub fn with_env_file_name(mut self, name: &str) -> Self {
        self.env_file_name = name.to_string();
        self
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Allocates a port for an existing instance and stores it in
    /// `config.ports.api`. `None` when the instance is unknown or the range is
    /// exhausted; the instance config is untouched in both cases.
    pub fn allocate_for_instance(
        &self,
        group_name: &str,
        instance_id: &str,
        preferred_port: Option<u16>,
    ) -> Option<u16> {
        if self.manager.instance(group_name, instance_id).is_none() {
            tracing::warn!(group = %group_name, instance = %instance_id, "Cannot allocate port for unknown instance");
            return None;
        }

        let key = allocation_key(group_name, instance_id);
        let port = self.allocator.allocate(&key, preferred_port)?;

        let written = self.manager.update_instance(group_name, instance_id, |inst| {
            let ports = inst
                .config
                .entry("ports")
                .or_insert_with(|| Value::Object(Default::default()));
            if !ports.is_object() {
                *ports = json!({});
            }
            if let Some(map) = ports.as_object_mut() {
                map.insert("api".to_string(), json!(port));
            }
        });
        if let Err(e) = written {
            tracing::warn!(group = %group_name, instance = %instance_id, "Instance vanished during allocation: {}", e);
            self.allocator.release(&key);
            return None;
        }

        tracing::info!(group = %group_name, instance = %instance_id, port, "Updated instance port config");
        if let Err(e) = self.manager.save() {
            tracing::error!("Port assigned but registry not persisted: {}", e);
        }
        Some(port)
    }

    pub fn get_instance_port(&self, group_name: &str, instance_id: &str) -> Option<u16> {
        self.allocator.get_port(&allocation_key(group_name, instance_id))
    }

    /// Writes `PORT` and `extra_vars` into the bot's env file under `bot_dir`.
    pub fn setup_env_file(
        &self,
        bot_dir: &Path,
        port: u16,
        extra_vars: Option<&BTreeMap<String, String>>,
    ) -> anyhow::Result<PathBuf> {
        let extra: Vec<(String, String)> = extra_vars
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        env_file::write_env_file(bot_dir, &self.env_file_name, port, &extra).map_err(|e| {
            tracing::error!("Failed to set up env file in {}: {:#}", bot_dir.display(), e);
            e
        })
    }

    pub fn get_port_info(&self, group_name: &str) -> BTreeMap<String, InstancePortInfo> {
        let Some(group) = self.manager.group(group_name) else {
            return BTreeMap::new();
        };
        group
            .instances()
            .iter()
            .map(|(id, inst)| {
                (
                    id.clone(),
                    InstancePortInfo {
                        port: self.get_instance_port(group_name, id),
                        instance_status: inst.status(),
                        is_running: inst.is_running(),
                    },
                )
            })
            .collect()
    }

    pub fn global_port_status(&self) -> PortStatus {
        let (start, end) = self.allocator.range();
        PortStatus {
            allocated_ports: self.allocator.all_ports(),
            available_ports: self.allocator.available_count(),
            conflicts: self.allocator.find_conflicts(),
            next_available: self.allocator.next_available(),
            port_range: format!("{}-{}", start, end),
        }
    }

    /// Releases every instance's port in the group regardless of running state,
    /// then persists once.
    pub fn release_group_ports(&self, group_name: &str) -> BTreeMap<String, bool> {
        let Some(group) = self.manager.group(group_name) else {
            return BTreeMap::new();
        };
        let results = group
            .instance_ids()
            .into_iter()
            .map(|id| {
                let released = self.allocator.release(&allocation_key(group_name, &id));
                (id, released)
            })
            .collect();
        if let Err(e) = self.manager.save() {
            tracing::error!("Released ports but registry not persisted: {}", e);
        }
        results
    }

    /// Re-seeds the allocator from `config.ports.api` of every registered
    /// instance. Returns how many mappings were restored.
    pub fn restore_from_registry(&self) -> usize {
        let mut restored = 0;
        for (group, id, instance) in self.manager.all_instances() {
            if let Some(port) = configured_api_port(&instance) {
                self.allocator.assign(&allocation_key(&group, &id), port);
                restored += 1;
            }
        }
        let conflicts = self.allocator.find_conflicts();
        if !conflicts.is_empty() {
            tracing::warn!("Port conflicts in restored registry: {:?}", conflicts);
        }
        tracing::info!("Restored {} port mappings", restored);
        restored
    }
}
