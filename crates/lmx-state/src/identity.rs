//! Process identity checks for the single-writer state file
//!
//! A pid from an old record only names a live owner when the process behind
//! it runs the same executable and was already running when the record was
//! written. Anything else is pid reuse after a crash or a reboot.

use chrono::{DateTime, Utc};
use std::path::Path;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System};

/// Linux truncates process names to this many bytes
const COMM_LEN: usize = 15;

/// File name of the running executable
pub fn current_instance_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}

/// True when a process with `pid` currently exists
pub fn process_alive(pid: u32) -> bool {
    inspect(pid, |_| true)
}

/// True when `pid` is a live process running `instance_name` that started no
/// later than `written_at`
pub fn owner_alive(pid: u32, instance_name: &str, written_at: DateTime<Utc>) -> bool {
    inspect(pid, |process| {
        let started = i64::try_from(process.start_time()).unwrap_or(i64::MAX);
        // start_time has one-second resolution
        started <= written_at.timestamp() + 1 && runs_instance(process, instance_name)
    })
}

fn inspect(pid: u32, check: impl FnOnce(&Process) -> bool) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );
    sys.process(pid).map(check).unwrap_or(false)
}

fn runs_instance(process: &Process, instance_name: &str) -> bool {
    let exe_matches = process
        .exe()
        .and_then(Path::file_name)
        .is_some_and(|name| name == instance_name);
    if exe_matches {
        return true;
    }

    let name = process.name().to_string_lossy();
    name == instance_name || (name.len() >= COMM_LEN && instance_name.starts_with(name.as_ref()))
}
