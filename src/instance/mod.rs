pub mod status;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use status::{InstanceStatus, Transition};

/// Opaque per-instance configuration (paths, account ids, assigned ports).
pub type InstanceConfig = Map<String, Value>;

/// Process details recorded when an instance is marked running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub title: String,
}

impl ProcessInfo {
    pub fn with_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Default::default()
        }
    }
}

/// Last observed resource usage, written by a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub update_time: DateTime<Local>,
}

/// One bot process's lifecycle record.
///
/// This is a pure state tracker: none of its transitions spawn or kill an OS
/// process. The launcher owns the real process and reports back here.
#[derive(Debug, Clone)]
pub struct Instance {
    instance_id: String,
    pub config: InstanceConfig,
    status: InstanceStatus,
    process_info: Option<ProcessInfo>,
    pid: Option<u32>,
    start_time: Option<DateTime<Local>>,
    stop_time: Option<DateTime<Local>>,
    last_update: Option<DateTime<Local>>,
    error_message: Option<String>,
    resource_usage: Option<ResourceUsage>,
}

/// Serializable view of an instance for status reports and the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub config: InstanceConfig,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub start_time: Option<DateTime<Local>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Local>>,
    #[serde(default)]
    pub uptime: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default)]
    pub last_update: Option<DateTime<Local>>,
}

impl Instance {
    pub fn new(instance_id: &str, config: InstanceConfig) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            config,
            status: InstanceStatus::Stopped,
            process_info: None,
            pid: None,
            start_time: None,
            stop_time: None,
            last_update: None,
            error_message: None,
            resource_usage: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.instance_id
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn process_info(&self) -> Option<&ProcessInfo> {
        self.process_info.as_ref()
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Local>> {
        self.stop_time
    }

    pub fn last_update(&self) -> Option<DateTime<Local>> {
        self.last_update
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn resource_usage(&self) -> Option<&ResourceUsage> {
        self.resource_usage.as_ref()
    }

    /// Whether an OS process may still be attached: running, paused, or failed
    /// while holding a pid.
    pub fn owns_process(&self) -> bool {
        self.is_running() || (self.status == InstanceStatus::Error && self.pid.is_some())
    }

    /// Memory counted towards aggregates; stale readings of stopped instances count as zero.
    pub fn live_memory_mb(&self) -> f64 {
        if !self.is_running() {
            return 0.0;
        }
        self.resource_usage.as_ref().map(|u| u.memory_mb).unwrap_or(0.0)
    }

    /// stopped|error -> running.
    pub fn start(&mut self, process_info: ProcessInfo) -> bool {
        let Some(next) = self.status.apply(Transition::Start) else {
            tracing::warn!(
                instance = %self.instance_id,
                status = %self.status,
                "Refusing to start instance that is already running"
            );
            return false;
        };

        let now = Local::now();
        self.status = next;
        self.pid = process_info.pid;
        self.process_info = Some(process_info);
        self.start_time = Some(now);
        self.error_message = None;
        self.last_update = Some(now);
        tracing::info!(instance = %self.instance_id, pid = ?self.pid, "Instance started");
        true
    }

    /// running|paused|error -> stopped. Already stopped is a successful no-op.
    pub fn stop(&mut self) -> bool {
        if self.status == InstanceStatus::Stopped {
            return true;
        }
        let Some(next) = self.status.apply(Transition::Stop) else {
            return false;
        };

        let now = Local::now();
        self.status = next;
        self.pid = None;
        self.process_info = None;
        self.error_message = None;
        self.stop_time = Some(now);
        self.last_update = Some(now);
        tracing::info!(instance = %self.instance_id, "Instance stopped");
        true
    }

    /// running -> paused only.
    pub fn pause(&mut self) -> bool {
        self.step(Transition::Pause)
    }

    /// paused -> running only.
    pub fn resume(&mut self) -> bool {
        self.step(Transition::Resume)
    }

    /// Marks the instance failed. The underlying process, if any, is left alone.
    pub fn set_error(&mut self, message: &str) {
        self.status = self.status.apply(Transition::Fail).unwrap_or(InstanceStatus::Error);
        self.error_message = Some(message.to_string());
        self.last_update = Some(Local::now());
        tracing::error!(instance = %self.instance_id, error = message, "Instance entered error state");
    }

    pub fn update_resource_usage(&mut self, cpu_percent: f64, memory_mb: f64) {
        let now = Local::now();
        self.resource_usage = Some(ResourceUsage {
            cpu_percent,
            memory_mb,
            update_time: now,
        });
        self.last_update = Some(now);
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        if !self.is_running() {
            return None;
        }
        self.start_time.map(|t| Local::now() - t)
    }

    /// Uptime as `"{h}h {m}m {s}s"`.
    pub fn uptime_display(&self) -> Option<String> {
        self.uptime().map(|d| {
            let secs = d.num_seconds().max(0);
            format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        })
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.instance_id.clone(),
            config: self.config.clone(),
            is_running: self.is_running(),
            status: self.status,
            pid: self.pid,
            start_time: self.start_time,
            stop_time: self.stop_time,
            uptime: self.uptime_display(),
            error_message: self.error_message.clone(),
            resource_usage: self.resource_usage.clone(),
            last_update: self.last_update,
        }
    }

    fn step(&mut self, transition: Transition) -> bool {
        match self.status.apply(transition) {
            Some(next) => {
                tracing::info!(
                    instance = %self.instance_id,
                    "Instance {:?}: {} -> {}", transition, self.status, next
                );
                self.status = next;
                self.last_update = Some(Local::now());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> InstanceConfig {
        json!({ "bot_path": "/opt/maibot" }).as_object().cloned().unwrap()
    }

    #[test]
    fn new_instance_is_stopped() {
        let inst = Instance::new("b1", config());
        assert_eq!(inst.status(), InstanceStatus::Stopped);
        assert!(!inst.is_running());
        assert!(inst.pid().is_none());
        assert!(inst.uptime_display().is_none());
    }

    #[test]
    fn start_records_pid_and_time() {
        let mut inst = Instance::new("b1", config());
        assert!(inst.start(ProcessInfo::with_pid(4242)));
        assert_eq!(inst.status(), InstanceStatus::Running);
        assert_eq!(inst.pid(), Some(4242));
        assert!(inst.start_time().is_some());
        assert!(inst.uptime_display().unwrap().ends_with('s'));
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut inst = Instance::new("b1", config());
        assert!(inst.start(ProcessInfo::with_pid(1)));
        assert!(!inst.start(ProcessInfo::with_pid(2)));
        assert_eq!(inst.pid(), Some(1));
    }

    #[test]
    fn stop_clears_process_and_is_idempotent() {
        let mut inst = Instance::new("b1", config());
        assert!(inst.stop());
        assert!(inst.stop_time().is_none(), "no-op stop should not stamp stop_time");

        inst.start(ProcessInfo::with_pid(7));
        assert!(inst.stop());
        assert_eq!(inst.status(), InstanceStatus::Stopped);
        assert!(inst.pid().is_none());
        assert!(inst.process_info().is_none());
        assert!(inst.stop_time().is_some());
    }

    #[test]
    fn pause_on_stopped_fails_and_keeps_state() {
        let mut inst = Instance::new("b1", config());
        assert!(!inst.pause());
        assert_eq!(inst.status(), InstanceStatus::Stopped);
    }

    #[test]
    fn pause_resume_cycle() {
        let mut inst = Instance::new("b1", config());
        inst.start(ProcessInfo::with_pid(9));
        assert!(inst.pause());
        assert_eq!(inst.status(), InstanceStatus::Paused);
        assert!(inst.is_running());
        assert!(!inst.pause());
        assert!(inst.resume());
        assert_eq!(inst.status(), InstanceStatus::Running);
        assert!(!inst.resume());
    }

    #[test]
    fn error_recovers_through_start() {
        let mut inst = Instance::new("b1", config());
        inst.set_error("spawn failed");
        assert_eq!(inst.status(), InstanceStatus::Error);
        assert_eq!(inst.error_message(), Some("spawn failed"));
        assert!(!inst.resume());

        assert!(inst.start(ProcessInfo::with_pid(3)));
        assert!(inst.error_message().is_none());
    }

    #[test]
    fn failed_instance_keeps_its_process_until_stopped() {
        let mut inst = Instance::new("b1", config());
        inst.start(ProcessInfo::with_pid(501));
        inst.set_error("terminate failed");
        assert!(!inst.is_running());
        assert!(inst.owns_process());
        assert_eq!(inst.pid(), Some(501));

        assert!(inst.stop());
        assert!(!inst.owns_process());
        assert!(inst.pid().is_none());

        // spawn failures never had a process
        inst.set_error("spawn failed");
        assert!(!inst.owns_process());
    }

    #[test]
    fn set_error_applies_from_any_state() {
        let mut inst = Instance::new("b1", config());
        inst.set_error("bad config");
        assert_eq!(inst.status(), InstanceStatus::Error);

        inst.start(ProcessInfo::with_pid(7));
        assert!(inst.pause());
        inst.set_error("crashed");
        assert_eq!(inst.status(), InstanceStatus::Error);
        assert_eq!(inst.error_message(), Some("crashed"));
        assert!(!inst.resume());
    }

    #[test]
    fn stale_memory_ignored_when_stopped() {
        let mut inst = Instance::new("b1", config());
        inst.start(ProcessInfo::with_pid(3));
        inst.update_resource_usage(12.5, 256.0);
        assert_eq!(inst.live_memory_mb(), 256.0);
        inst.stop();
        assert_eq!(inst.live_memory_mb(), 0.0);
        assert!(inst.resource_usage().is_some());
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut inst = Instance::new("b1", config());
        inst.start(ProcessInfo::with_pid(11));
        let snap = inst.snapshot();
        assert_eq!(snap.instance_id, "b1");
        assert!(snap.is_running);
        assert_eq!(snap.pid, Some(11));
        assert_eq!(snap.config, config());
    }
}
