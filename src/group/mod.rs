use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::instance::{Instance, InstanceSnapshot, ProcessInfo};

/// Options shared by every instance in a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Seconds to wait between sequential launches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_interval: Option<u64>,
    /// Advisory cap; not enforced by the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GroupConfig {
    pub fn with_launch_interval(secs: u64) -> Self {
        Self {
            launch_interval: Some(secs),
            ..Default::default()
        }
    }
}

/// Aggregate view over a group's instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group_name: String,
    pub total_instances: usize,
    pub running_count: usize,
    pub stopped_count: usize,
    pub total_memory_mb: f64,
    pub instances: BTreeMap<String, InstanceSnapshot>,
}

/// A named set of instances. Instance ids are unique only within the group.
#[derive(Debug, Clone)]
pub struct Group {
    name: String,
    pub config: GroupConfig,
    instances: BTreeMap<String, Instance>,
}

impl Group {
    pub fn new(name: &str, config: GroupConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            instances: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rejects duplicates instead of overwriting.
    pub fn add(&mut self, instance: Instance) -> bool {
        if self.instances.contains_key(instance.id()) {
            tracing::warn!(group = %self.name, instance = %instance.id(), "Instance id already exists");
            return false;
        }
        tracing::info!(group = %self.name, instance = %instance.id(), "Added instance to group");
        self.instances.insert(instance.id().to_string(), instance);
        true
    }

    /// Removes an instance, stopping it first if it is still running.
    pub fn remove(&mut self, instance_id: &str) -> Option<Instance> {
        let Some(mut instance) = self.instances.remove(instance_id) else {
            tracing::warn!(group = %self.name, instance = %instance_id, "Instance id does not exist");
            return None;
        };
        if instance.is_running() {
            instance.stop();
        }
        tracing::info!(group = %self.name, instance = %instance_id, "Removed instance from group");
        Some(instance)
    }

    pub fn get(&self, instance_id: &str) -> Option<&Instance> {
        self.instances.get(instance_id)
    }

    pub fn get_mut(&mut self, instance_id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id)
    }

    pub fn instances(&self) -> &BTreeMap<String, Instance> {
        &self.instances
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn running_instances(&self) -> Vec<&Instance> {
        self.instances.values().filter(|i| i.is_running()).collect()
    }

    pub fn stopped_instances(&self) -> Vec<&Instance> {
        self.instances.values().filter(|i| !i.is_running()).collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn running_count(&self) -> usize {
        self.instances.values().filter(|i| i.is_running()).count()
    }

    pub fn aggregate_status(&self) -> GroupStatus {
        let running = self.running_count();
        GroupStatus {
            group_name: self.name.clone(),
            total_instances: self.instances.len(),
            running_count: running,
            stopped_count: self.instances.len() - running,
            total_memory_mb: self.instances.values().map(Instance::live_memory_mb).sum(),
            instances: self
                .instances
                .iter()
                .map(|(id, inst)| (id.clone(), inst.snapshot()))
                .collect(),
        }
    }

    /// Marks every non-running instance running. Process control is the launcher's job.
    pub fn start_all(&mut self, mut on_result: Option<&mut dyn FnMut(&str, bool)>) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for (id, instance) in self.instances.iter_mut() {
            if instance.is_running() {
                continue;
            }
            let ok = instance.start(ProcessInfo::default());
            if let Some(cb) = on_result.as_mut() {
                cb(id.as_str(), ok);
            }
            results.insert(id.clone(), ok);
        }
        results
    }

    /// Marks every running or paused instance stopped.
    pub fn stop_all(&mut self, mut on_result: Option<&mut dyn FnMut(&str, bool)>) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for (id, instance) in self.instances.iter_mut() {
            if !instance.is_running() {
                continue;
            }
            let ok = instance.stop();
            if let Some(cb) = on_result.as_mut() {
                cb(id.as_str(), ok);
            }
            results.insert(id.clone(), ok);
        }
        results
    }
}
