//! Adopting already-running bot processes into the registry.
//!
//! Detection scans the host process table and fingerprints rows with a
//! [`DetectionStrategy`]. A takeover creates a registry instance that starts out
//! `running` with the discovered pid. Takeover records live in memory only:
//! after a restart the restored instances are stopped and must be detected
//! again. A record is dropped once the monitor sees its process exit or the
//! instance moves on to another pid.

pub mod detector;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::instance::{Instance, InstanceConfig, InstanceStatus, ProcessInfo};
use crate::manager::{EventPayload, LifecycleEvent, Manager, RegistryError};
use crate::process_monitor::ProcessSource;

pub use detector::{process_key, BotSignature, DetectedProcess, DetectionStrategy};

#[derive(Error, Debug)]
pub enum TakeoverError {
    #[error("no detected process with key '{0}'")]
    ProcessNotDetected(String),
    #[error("takeover state lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Audit entry for one adopted process.
#[derive(Debug, Clone, Serialize)]
pub struct TakeoverRecord {
    pub group_name: String,
    pub instance_id: String,
    pub takeover_time: DateTime<Local>,
    pub original_process: DetectedProcess,
}

/// Result of reconciling one takeover instance with the host.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub group_name: String,
    pub instance_id: String,
    pub is_running: bool,
    pub pid: u32,
    pub memory_mb: Option<f64>,
    pub uptime: Option<String>,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TakeoverSummary {
    pub total_takeover: usize,
    pub by_group: BTreeMap<String, usize>,
    pub takeover_records: BTreeMap<String, TakeoverRecord>,
}

pub struct LocalTakeover {
    manager: Arc<Manager>,
    source: Box<dyn ProcessSource>,
    strategy: DetectionStrategy,
    detected: Mutex<BTreeMap<String, DetectedProcess>>,
    records: Mutex<BTreeMap<String, TakeoverRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, TakeoverError> {
    mutex.lock().map_err(|e| {
        tracing::error!("Takeover lock poisoned: {}", e);
        TakeoverError::LockPoisoned
    })
}

impl LocalTakeover {
    pub fn new(manager: Arc<Manager>, source: impl ProcessSource + 'static) -> Self {
        Self::with_strategy(manager, source, DetectionStrategy::default())
    }

    pub fn with_strategy(
        manager: Arc<Manager>,
        source: impl ProcessSource + 'static,
        strategy: DetectionStrategy,
    ) -> Self {
        Self {
            manager,
            source: Box::new(source),
            strategy,
            detected: Mutex::new(BTreeMap::new()),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn strategy(&self) -> &DetectionStrategy {
        &self.strategy
    }

    /// Scans the host and replaces the detection cache.
    pub fn detect_all(&self) -> BTreeMap<String, DetectedProcess> {
        let found: BTreeMap<String, DetectedProcess> = self
            .source
            .snapshot()
            .into_iter()
            .filter_map(|sample| {
                let bot_type = self.strategy.identify(&sample)?.to_string();
                let detected = DetectedProcess::from_sample(sample, &bot_type);
                tracing::info!(
                    process_key = %detected.process_key,
                    pid = detected.pid,
                    bot_type = %detected.bot_type,
                    "Detected bot process"
                );
                Some((detected.process_key.clone(), detected))
            })
            .collect();

        tracing::info!("Bot process scan complete: {} detected", found.len());
        match lock(&self.detected) {
            Ok(mut cache) => *cache = found.clone(),
            Err(e) => tracing::warn!("Detection cache not updated: {}", e),
        }
        found
    }

    pub fn detect_by_type(&self, bot_type: &str) -> BTreeMap<String, DetectedProcess> {
        self.detect_all()
            .into_iter()
            .filter(|(_, p)| p.bot_type == bot_type)
            .collect()
    }

    /// Entry from the last scan.
    pub fn get_detected(&self, process_key: &str) -> Option<DetectedProcess> {
        lock(&self.detected).ok()?.get(process_key).cloned()
    }

    /// Promotes a detected process into `group_name/instance_id`, creating the
    /// group when needed. The new instance is running with the discovered pid.
    pub fn create_takeover_instance(
        &self,
        process_key: &str,
        group_name: &str,
        instance_id: &str,
        overrides: Option<InstanceConfig>,
    ) -> Result<Instance, TakeoverError> {
        let detected = self.get_detected(process_key).ok_or_else(|| {
            tracing::error!(process_key, "Process not found in detection results");
            TakeoverError::ProcessNotDetected(process_key.to_string())
        })?;

        let mut config = takeover_config(&detected);
        if let Some(overrides) = overrides {
            config.extend(overrides);
        }

        if !self.manager.has_group(group_name) {
            self.manager.create_group(group_name, None)?;
        }
        self.manager.create_instance(group_name, instance_id, config)?;

        let process_info = ProcessInfo {
            pid: Some(detected.pid),
            command: detected.cmdline.join(" "),
            cwd: detected.cwd.clone().unwrap_or_default(),
            title: format!("{}-{}", detected.bot_type, instance_id),
        };
        let instance = self.manager.update_instance(group_name, instance_id, |inst| {
            inst.start(process_info);
            inst.update_resource_usage(0.0, detected.memory_mb);
            inst.clone()
        })?;

        let record = TakeoverRecord {
            group_name: group_name.to_string(),
            instance_id: instance_id.to_string(),
            takeover_time: Local::now(),
            original_process: detected.clone(),
        };
        lock(&self.records)?.insert(process_key.to_string(), record);

        self.manager.trigger_callback(
            LifecycleEvent::Start.name(),
            &EventPayload::new(group_name, instance_id).with_pid(detected.pid),
        );
        tracing::info!(process_key, group = %group_name, instance = %instance_id, "Took over local bot");
        Ok(instance)
    }

    /// Takes over each key as `"{prefix}_{NNN}"` (1-based). Keys that fail are
    /// reported `false` and do not stop the batch.
    pub fn batch_takeover(
        &self,
        process_keys: &[String],
        group_name: &str,
        instance_prefix: &str,
    ) -> BTreeMap<String, bool> {
        if !self.manager.has_group(group_name) {
            if let Err(e) = self.manager.create_group(group_name, None) {
                tracing::error!(group = %group_name, "Cannot create takeover group: {}", e);
            }
        }

        process_keys
            .iter()
            .enumerate()
            .map(|(idx, key)| {
                let instance_id = format!("{}_{:03}", instance_prefix, idx + 1);
                let ok = match self.create_takeover_instance(key, group_name, &instance_id, None) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(process_key = %key, "Takeover failed: {}", e);
                        false
                    }
                };
                (key.clone(), ok)
            })
            .collect()
    }

    /// Re-probes every adopted pid. Exited processes move their instance to
    /// `stopped`; live ones refresh `memory_mb`. Keyed by `"{group}_{id}"`.
    pub fn monitor_takeover_instances(&self) -> BTreeMap<String, MonitorReport> {
        let records: Vec<(String, TakeoverRecord)> = match lock(&self.records) {
            Ok(r) => r.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => return BTreeMap::new(),
        };

        let mut reports = BTreeMap::new();
        let mut finished = Vec::new();
        for (key, record) in records {
            let (group, id) = (&record.group_name, &record.instance_id);
            let pid = record.original_process.pid;
            let Some(instance) = self.manager.instance(group, id) else {
                finished.push(key);
                continue;
            };
            // stopped or relaunched under a new pid, no longer ours to reconcile
            if instance.pid() != Some(pid) {
                finished.push(key);
                continue;
            }

            let report = match self.source.probe(pid) {
                Some(sample) => {
                    let updated = self.manager.update_instance(group, id, |inst| {
                        if inst.is_running() {
                            inst.update_resource_usage(0.0, sample.memory_mb);
                        }
                        (inst.status(), inst.uptime_display())
                    });
                    let (status, uptime) = updated.unwrap_or((instance.status(), None));
                    MonitorReport {
                        group_name: group.clone(),
                        instance_id: id.clone(),
                        is_running: true,
                        pid,
                        memory_mb: Some(sample.memory_mb),
                        uptime,
                        status,
                    }
                }
                None => {
                    let stopped = self
                        .manager
                        .update_instance(group, id, |inst| inst.is_running() && inst.stop())
                        .unwrap_or(false);
                    finished.push(key);
                    if stopped {
                        tracing::info!(group = %group, instance = %id, pid, "Taken-over process exited");
                        self.manager.trigger_callback(
                            LifecycleEvent::Stop.name(),
                            &EventPayload::new(group, id).with_pid(pid),
                        );
                    }
                    MonitorReport {
                        group_name: group.clone(),
                        instance_id: id.clone(),
                        is_running: false,
                        pid,
                        memory_mb: None,
                        uptime: None,
                        status: InstanceStatus::Stopped,
                    }
                }
            };
            reports.insert(format!("{}_{}", group, id), report);
        }

        // a reused pid must never resurrect a finished record
        if !finished.is_empty() {
            if let Ok(mut r) = lock(&self.records) {
                for key in &finished {
                    r.remove(key);
                }
            }
            tracing::debug!("Dropped {} finished takeover records", finished.len());
        }

        tracing::debug!("Monitored {} takeover instances", reports.len());
        reports
    }

    pub fn takeover_summary(&self) -> TakeoverSummary {
        let records = lock(&self.records).map(|r| r.clone()).unwrap_or_default();
        let mut by_group: BTreeMap<String, usize> = BTreeMap::new();
        for record in records.values() {
            *by_group.entry(record.group_name.clone()).or_default() += 1;
        }
        TakeoverSummary {
            total_takeover: records.len(),
            by_group,
            takeover_records: records,
        }
    }
}

fn takeover_config(detected: &DetectedProcess) -> InstanceConfig {
    let detect_time = detected.create_time.unwrap_or_else(Local::now);
    let mut config = InstanceConfig::new();
    config.insert("process_key".into(), json!(detected.process_key));
    config.insert("pid".into(), json!(detected.pid));
    config.insert("bot_type".into(), json!(detected.bot_type));
    config.insert("name".into(), json!(detected.name));
    config.insert("cwd".into(), json!(detected.cwd.clone().unwrap_or_default()));
    config.insert("cmdline".into(), json!(detected.cmdline));
    config.insert("detect_time".into(), json!(detect_time.to_rfc3339()));
    config.insert("is_detected".into(), Value::Bool(true));
    config
}
