//! Host-side helpers for VMM processes we may not have spawned ourselves.

use crate::error::{Result, VmError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::time::{Duration, Instant};

/// Polling interval while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether `pid` names a live (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(s) => s,
        Err(_) => return false,
    };
    // The state field follows the parenthesised command name
    match stat.rfind(')').and_then(|i| stat[i + 1..].split_whitespace().next()) {
        Some("Z") | Some("X") => false,
        Some(_) => true,
        None => false,
    }
}

/// Find the VMM process whose command line mentions `socket`.
///
/// Used after boot to learn the PID of a process spawned by a library, and
/// never matches the current process.
pub fn find_pid_by_arg(socket: &Path) -> Option<u32> {
    let needle = socket.as_os_str().as_encoded_bytes();
    let me = std::process::id();
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == me {
            continue;
        }
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if cmdline.split(|b| *b == 0).any(|arg| arg == needle) {
            return Some(pid);
        }
    }
    None
}

/// Send `signal` to `pid`; a process that is already gone is not an error.
pub fn signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(VmError::Io(std::io::Error::from(e))),
    }
}

/// Poll until `pid` exits or `timeout` elapses. Returns whether it exited.
pub async fn wait_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while is_alive(pid) {
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}

/// SIGKILL `pid` and wait briefly for it to disappear.
pub async fn kill_and_wait(pid: u32) -> Result<()> {
    tracing::warn!(pid, "Killing VMM process");
    signal(pid, Signal::SIGKILL)?;
    if !wait_exit(pid, Duration::from_secs(5)).await {
        return Err(VmError::Timeout(Duration::from_secs(5)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_unlikely_pid_is_dead() {
        assert!(!is_alive(u32::MAX - 1));
    }

    #[test]
    fn test_signal_missing_process_is_ok() {
        assert!(signal(i32::MAX as u32 - 1, Signal::SIGTERM).is_ok());
    }

    #[tokio::test]
    async fn test_wait_exit_of_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("0.1")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");
        // Reap in the background so the zombie disappears
        let reaper = tokio::spawn(async move { child.wait().await });
        assert!(wait_exit(pid, Duration::from_secs(5)).await);
        reaper.await.unwrap().unwrap();
    }
}
