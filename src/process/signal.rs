// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signal delivery and liveness probes for supervised processes.
//!
//! Supervised children are started as leaders of their own process group so
//! that a dev server's workers or an agent's tool subprocesses go down with
//! them. On non-Unix platforms only liveness probing is available and
//! termination falls back to killing the direct child.

#[cfg(unix)]
use nix::sys::signal::{kill, killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::debug;

/// Ask a process group to exit. Returns false if nothing received the signal.
#[cfg(unix)]
pub fn terminate_group(pid: u32) -> bool {
    send_group(pid, Signal::SIGTERM)
}

/// Forcefully kill a process group.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> bool {
    send_group(pid, Signal::SIGKILL)
}

#[cfg(unix)]
fn send_group(pid: u32, signal: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(group_err) => {
            // Not a group leader; signal the process alone.
            debug!(pid, "killpg failed ({}), signalling process", group_err);
            kill(Pid::from_raw(raw), signal).is_ok()
        }
    }
}

#[cfg(not(unix))]
pub fn terminate_group(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> bool {
    false
}

/// Whether a process with `pid` currently exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 performs the permission and existence checks only.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
