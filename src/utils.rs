//! Shared helpers for spawning bot processes.

use std::process::Command;

/// Bots get their own console window on Windows so their logs stay visible.
/// On other platforms the child is placed in its own process group, so the
/// whole shell pipeline can be signalled at once.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_CONSOLE: u32 = 0x00000010;
    cmd.creation_flags(CREATE_NEW_CONSOLE)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0)
}

/// Wraps a command line in the platform shell. `title` names the console
/// window where the platform has one.
#[cfg(target_os = "windows")]
pub fn shell_command(command: &str, title: &str) -> Command {
    let mut cmd = Command::new("cmd");
    if title.is_empty() {
        cmd.args(["/C", command]);
    } else {
        cmd.args(["/C", &format!("title {} && {}", title, command)]);
    }
    cmd
}

#[cfg(not(target_os = "windows"))]
pub fn shell_command(command: &str, _title: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}
