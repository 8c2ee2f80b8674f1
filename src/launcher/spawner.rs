use std::path::Path;
use std::process::{Child, Stdio};
use thiserror::Error;

use crate::utils::{apply_creation_flags, shell_command};

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },
    #[error("failed to terminate process {pid}: {reason}")]
    Terminate { pid: u32, reason: String },
}

/// Starts and stops OS processes on behalf of the launcher.
///
/// Implementations may block briefly but never wait for the child to exit.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &str, working_dir: &Path, title: &str) -> Result<u32, SpawnError>;
    fn terminate(&self, pid: u32) -> Result<(), SpawnError>;
}

/// Runs commands through the platform shell. Every child is handed to a
/// waiter thread at spawn so it is reaped whether it exits on its own or is
/// terminated.
#[derive(Default)]
pub struct SystemSpawner;

impl SystemSpawner {
    pub fn new() -> Self {
        Self
    }
}

fn watch_child(pid: u32, mut child: Child) {
    let waiter = std::thread::Builder::new()
        .name(format!("reap-{}", pid))
        .spawn(move || match child.wait() {
            Ok(status) => tracing::info!(pid, %status, "Process exited"),
            Err(e) => tracing::warn!(pid, "Failed to wait on child: {}", e),
        });
    if let Err(e) = waiter {
        tracing::warn!(pid, "Could not start reaper thread: {}", e);
    }
}

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, command: &str, working_dir: &Path, title: &str) -> Result<u32, SpawnError> {
        let mut cmd = shell_command(command, title);
        cmd.current_dir(working_dir).stdin(Stdio::null());
        apply_creation_flags(&mut cmd);

        let child = cmd.spawn().map_err(|e| SpawnError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        tracing::info!(pid, title, cwd = %working_dir.display(), "Spawned process");
        watch_child(pid, child);
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), SpawnError> {
        tracing::info!(pid, "Sending terminate to process");
        terminate_pid(pid)
    }
}

/// Kills the whole tree with `taskkill /T` so the bot dies along with its
/// `cmd /C` host. Falls back to `TerminateProcess` on the pid alone.
#[cfg(target_os = "windows")]
fn terminate_pid(pid: u32) -> Result<(), SpawnError> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let output = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .output();
    match output {
        Ok(out) if out.status.success() => return Ok(()),
        Ok(out) => tracing::warn!(
            pid,
            "taskkill failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => tracing::warn!(pid, "taskkill unavailable: {}", e),
    }
    terminate_single(pid)
}

#[cfg(target_os = "windows")]
fn terminate_single(pid: u32) -> Result<(), SpawnError> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(SpawnError::Terminate {
                pid,
                reason: "failed to open process".to_string(),
            });
        }
        let result = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if result == 0 {
            return Err(SpawnError::Terminate {
                pid,
                reason: "TerminateProcess failed".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn terminate_pid(pid: u32) -> Result<(), SpawnError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| SpawnError::Terminate {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    // Spawned children lead their own group; adopted processes usually don't.
    match signal::killpg(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => signal::kill(Pid::from_raw(raw), Signal::SIGTERM)
            .map_err(|e| SpawnError::Terminate {
                pid,
                reason: format!("failed to send signal: {}", e),
            }),
        Err(e) => Err(SpawnError::Terminate {
            pid,
            reason: format!("failed to send signal: {}", e),
        }),
    }
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn spawn_and_terminate_shell_child() {
        let tmp = tempfile::tempdir().unwrap();
        let spawner = SystemSpawner::new();
        let pid = spawner.spawn("sleep 30", tmp.path(), "sleeper").unwrap();
        assert!(pid > 0);
        spawner.terminate(pid).unwrap();
        assert!(wait_until_gone(pid));
    }

    fn wait_until_gone(pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while crate::process_monitor::is_running(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        !crate::process_monitor::is_running(pid)
    }

    #[test]
    fn child_exiting_on_its_own_is_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        let spawner = SystemSpawner::new();
        let pid = spawner.spawn("true", tmp.path(), "short").unwrap();
        // a zombie would stay visible until someone waits on it
        assert!(wait_until_gone(pid));
    }

    #[test]
    fn missing_working_dir_is_a_spawn_error() {
        let spawner = SystemSpawner::new();
        let err = spawner
            .spawn("true", Path::new("/definitely/not/here"), "")
            .unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
    }

    #[test]
    fn terminating_unknown_pid_fails() {
        let spawner = SystemSpawner::new();
        assert!(spawner.terminate(i32::MAX as u32).is_err());
    }
}
