//! Host process enumeration backed by `sysinfo`.

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Pid, Process, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One row of the host process table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub exe: Option<String>,
    pub cwd: Option<String>,
    /// Full command line, e.g. `["python", "bot.py"]`
    #[serde(default)]
    pub cmdline: Vec<String>,
    pub memory_mb: f64,
    pub start_time: Option<DateTime<Local>>,
}

impl ProcessSample {
    /// Name, exe, cwd and command line joined by spaces and lowercased.
    pub fn searchable_text(&self) -> String {
        format!(
            "{} {} {} {}",
            self.name,
            self.exe.as_deref().unwrap_or(""),
            self.cwd.as_deref().unwrap_or(""),
            self.cmdline.join(" ")
        )
        .to_lowercase()
    }
}

/// Where process discovery reads the host process table from.
pub trait ProcessSource: Send + Sync {
    /// Every process readable right now. Processes that vanish or deny access
    /// mid-scan are left out.
    fn snapshot(&self) -> Vec<ProcessSample>;

    /// Current state of one pid, `None` once it has exited.
    fn probe(&self, pid: u32) -> Option<ProcessSample>;
}

/// Default source reading the live process table.
pub struct SysinfoSource {
    system: Mutex<System>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

fn sample(pid: Pid, process: &Process) -> ProcessSample {
    ProcessSample {
        pid: pid.as_u32(),
        name: process.name().to_string(),
        exe: process.exe().and_then(|p| p.to_str()).map(String::from),
        cwd: process.cwd().and_then(|p| p.to_str()).map(String::from),
        cmdline: process.cmd().to_vec(),
        memory_mb: process.memory() as f64 / BYTES_PER_MB,
        start_time: i64::try_from(process.start_time())
            .ok()
            .and_then(|secs| Local.timestamp_opt(secs, 0).single()),
    }
}

impl ProcessSource for SysinfoSource {
    fn snapshot(&self) -> Vec<ProcessSample> {
        let Ok(mut sys) = self.system.lock() else {
            tracing::error!("Process table lock poisoned");
            return Vec::new();
        };
        sys.refresh_processes();
        let processes: Vec<ProcessSample> = sys
            .processes()
            .iter()
            .map(|(pid, process)| sample(*pid, process))
            .collect();
        tracing::debug!("Found {} running processes", processes.len());
        processes
    }

    fn probe(&self, pid: u32) -> Option<ProcessSample> {
        let mut sys = self.system.lock().ok()?;
        let pid = Pid::from_u32(pid);
        if !sys.refresh_process(pid) {
            return None;
        }
        sys.process(pid).map(|p| sample(pid, p))
    }
}

/// Whether `pid` is alive on this host.
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_process(Pid::from_u32(pid))
}
