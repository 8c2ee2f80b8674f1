//! Drives real bot processes and mirrors their lifecycle into the registry.

pub mod spawner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::group::GroupStatus;
use crate::instance::ProcessInfo;
use crate::manager::{EventPayload, GlobalStatus, LifecycleEvent, Manager, RegistryError};

pub use spawner::{ProcessSpawner, SpawnError, SystemSpawner};

pub const DEFAULT_LAUNCH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("group '{0}' not found")]
    GroupNotFound(String),
    #[error("instance '{group}/{instance}' not found")]
    InstanceNotFound { group: String, instance: String },
    #[error("instance '{group}/{instance}' is already running")]
    AlreadyRunning { group: String, instance: String },
    #[error("instance '{group}/{instance}' is not running")]
    NotRunning { group: String, instance: String },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How to start one bot process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub title: String,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>, title: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            title: title.into(),
        }
    }
}

pub struct Launcher {
    manager: Arc<Manager>,
    spawner: Arc<dyn ProcessSpawner>,
    default_launch_interval: Duration,
    restart_delay: Duration,
}

impl Launcher {
    pub fn new(manager: Arc<Manager>, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            manager,
            spawner,
            default_launch_interval: DEFAULT_LAUNCH_INTERVAL,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    /// Spacing used for groups whose config has no `launch_interval`.
    pub fn with_launch_interval(mut self, interval: Duration) -> Self {
        self.default_launch_interval = interval;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    fn fail(&self, group_name: &str, instance_id: &str, message: &str) {
        if let Err(e) = self
            .manager
            .update_instance(group_name, instance_id, |inst| inst.set_error(message))
        {
            tracing::warn!("Could not record instance error: {}", e);
        }
        self.manager.trigger_callback(
            LifecycleEvent::Error.name(),
            &EventPayload::new(group_name, instance_id).with_error(message),
        );
    }

    /// Spawns the instance's process and marks it running. A spawn failure
    /// leaves the instance in `error` and fires `on_error`.
    pub fn launch_instance(
        &self,
        group_name: &str,
        instance_id: &str,
        spec: &LaunchSpec,
    ) -> Result<u32, LaunchError> {
        let instance = self.manager.instance(group_name, instance_id).ok_or_else(|| {
            LaunchError::InstanceNotFound {
                group: group_name.to_string(),
                instance: instance_id.to_string(),
            }
        })?;
        if instance.owns_process() {
            return Err(LaunchError::AlreadyRunning {
                group: group_name.to_string(),
                instance: instance_id.to_string(),
            });
        }

        let pid = match self.spawner.spawn(&spec.command, &spec.cwd, &spec.title) {
            Ok(pid) => pid,
            Err(e) => {
                tracing::error!(group = %group_name, instance = %instance_id, "Launch failed: {}", e);
                self.fail(group_name, instance_id, &e.to_string());
                return Err(e.into());
            }
        };

        let process_info = ProcessInfo {
            pid: Some(pid),
            command: spec.command.clone(),
            cwd: spec.cwd.display().to_string(),
            title: spec.title.clone(),
        };
        let started = self
            .manager
            .update_instance(group_name, instance_id, |inst| {
                !inst.owns_process() && inst.start(process_info)
            });
        if !matches!(started, Ok(true)) {
            // lost a race with another launch or a delete; don't leave an orphan
            if let Err(e) = self.spawner.terminate(pid) {
                tracing::warn!(pid, "Failed to clean up orphaned process: {}", e);
            }
            return Err(match started {
                Err(e) => e.into(),
                Ok(_) => LaunchError::AlreadyRunning {
                    group: group_name.to_string(),
                    instance: instance_id.to_string(),
                },
            });
        }

        self.manager.trigger_callback(
            LifecycleEvent::Start.name(),
            &EventPayload::new(group_name, instance_id).with_pid(pid),
        );
        tracing::info!(group = %group_name, instance = %instance_id, pid, "Bot instance launched");
        Ok(pid)
    }

    /// Launches `specs` in order, waiting the group's `launch_interval` between
    /// consecutive launches. Failed launches are reported as `None` and do not
    /// stop the rest.
    pub async fn launch_group(
        &self,
        group_name: &str,
        specs: &[(String, LaunchSpec)],
    ) -> Result<BTreeMap<String, Option<u32>>, LaunchError> {
        let group = self
            .manager
            .group(group_name)
            .ok_or_else(|| LaunchError::GroupNotFound(group_name.to_string()))?;
        let interval = group
            .config
            .launch_interval
            .map(Duration::from_secs)
            .unwrap_or(self.default_launch_interval);

        let mut results = BTreeMap::new();
        for (idx, (instance_id, spec)) in specs.iter().enumerate() {
            if idx > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            let pid = self.launch_instance(group_name, instance_id, spec).ok();
            results.insert(instance_id.clone(), pid);
        }
        Ok(results)
    }

    /// Terminates the instance's process and marks it stopped. An instance
    /// without a pid is only marked stopped. A failed instance that still holds
    /// a pid (an earlier terminate failed) is stopped the same way.
    pub fn stop_instance(&self, group_name: &str, instance_id: &str) -> Result<(), LaunchError> {
        let instance = self.manager.instance(group_name, instance_id).ok_or_else(|| {
            LaunchError::InstanceNotFound {
                group: group_name.to_string(),
                instance: instance_id.to_string(),
            }
        })?;
        if !instance.owns_process() {
            tracing::warn!(group = %group_name, instance = %instance_id, "Instance is not running");
            return Err(LaunchError::NotRunning {
                group: group_name.to_string(),
                instance: instance_id.to_string(),
            });
        }

        if let Some(pid) = instance.pid() {
            if let Err(e) = self.spawner.terminate(pid) {
                tracing::error!(group = %group_name, instance = %instance_id, pid, "Stop failed: {}", e);
                self.fail(group_name, instance_id, &e.to_string());
                return Err(e.into());
            }
        }

        self.manager
            .update_instance(group_name, instance_id, |inst| inst.stop())?;
        self.manager.trigger_callback(
            LifecycleEvent::Stop.name(),
            &EventPayload::new(group_name, instance_id),
        );
        tracing::info!(group = %group_name, instance = %instance_id, "Bot instance stopped");
        Ok(())
    }

    /// Stops every instance of the group. Instances that were not running
    /// report `false`.
    pub fn stop_group(&self, group_name: &str) -> Result<BTreeMap<String, bool>, LaunchError> {
        let group = self
            .manager
            .group(group_name)
            .ok_or_else(|| LaunchError::GroupNotFound(group_name.to_string()))?;
        Ok(group
            .instance_ids()
            .into_iter()
            .map(|id| {
                let ok = self.stop_instance(group_name, &id).is_ok();
                (id, ok)
            })
            .collect())
    }

    /// Stops the instance, waits the restart delay, then launches it again.
    /// A stopped instance is simply launched.
    pub async fn restart_instance(
        &self,
        group_name: &str,
        instance_id: &str,
        spec: &LaunchSpec,
    ) -> Result<u32, LaunchError> {
        tracing::info!(group = %group_name, instance = %instance_id, "Restarting bot instance");
        match self.stop_instance(group_name, instance_id) {
            Ok(()) => tokio::time::sleep(self.restart_delay).await,
            Err(LaunchError::NotRunning { .. }) => {}
            Err(e) => return Err(e),
        }
        self.launch_instance(group_name, instance_id, spec)
    }

    pub fn group_status(&self, group_name: &str) -> Option<GroupStatus> {
        self.manager.group(group_name).map(|g| g.aggregate_status())
    }

    pub fn global_status(&self) -> GlobalStatus {
        self.manager.global_status()
    }
}
