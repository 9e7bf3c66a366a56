//! First-class OS parent-liveness check for the KYS watchdog: an existence
//! probe via `kill(pid, 0)` plus a `/proc/{pid}/cmdline` comparison against
//! the command line recorded at startup. Replaces shelling out to `ps`.

use std::fs;

#[cfg(unix)]
use nix::sys::signal::kill;
#[cfg(unix)]
use nix::unistd::Pid;

#[derive(Debug, Clone)]
pub struct ParentHandle {
    pid: u32,
    cmdline: String,
}

impl ParentHandle {
    /// Records the parent pid and its current `/proc/{pid}/cmdline` so a
    /// later probe can detect PID reuse (a different process now holding
    /// the same numeric pid).
    pub fn capture(pid: u32) -> Self {
        ParentHandle {
            pid,
            cmdline: read_cmdline(pid).unwrap_or_default(),
        }
    }

    /// True if `pid` still exists and its cmdline matches what was recorded
    /// at capture time. An empty recorded cmdline (unreadable at capture,
    /// e.g. a short-lived sandbox) falls back to the existence probe alone.
    pub fn is_alive(&self) -> bool {
        if !process_exists(self.pid) {
            return false;
        }
        if self.cmdline.is_empty() {
            return true;
        }
        read_cmdline(self.pid)
            .map(|current| current == self.cmdline)
            .unwrap_or(false)
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

fn read_cmdline(pid: u32) -> Option<String> {
    fs::read_to_string(format!("/proc/{pid}/cmdline")).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn self_pid_is_alive() {
        let handle = ParentHandle::capture(std::process::id());
        assert!(handle.is_alive());
    }

    #[test]
    fn implausible_pid_is_not_alive() {
        let handle = ParentHandle::capture(u32::MAX - 1);
        assert!(!handle.is_alive());
    }
}
