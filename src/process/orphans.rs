//! Best-effort cleanup of monitors left behind by an earlier run.
//!
//! Scans the process table for anything running the cached executable and
//! sends it SIGTERM. Failures are logged and never stop a start.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::Path;

use sysinfo::Pid;
use sysinfo::Signal;
use sysinfo::System;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Terminate leftover processes whose executable is named `file_name`.
///
/// Returns how many processes were signalled.
pub async fn sweep(file_name: &str) -> usize {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        debug!("Process listing unsupported here, skipping orphan sweep");
        return 0;
    }

    debug!("Searching for orphaned monitors named {}", file_name);

    let file_name = file_name.to_string();
    match tokio::task::spawn_blocking(move || terminate_matching(&file_name)).await {
        Ok(count) => count,
        Err(e) => {
            warn!("Orphan sweep failed: {}", e);
            0
        }
    }
}

fn terminate_matching(file_name: &str) -> usize {
    let system = System::new_all();
    let own_pid = Pid::from_u32(std::process::id());
    let mut signalled = 0;

    for (pid, process) in system.processes() {
        if *pid == own_pid {
            continue;
        }

        let argv0 = process.cmd().first().map(OsString::as_os_str);
        if !runs_executable(process.exe(), argv0, file_name) {
            continue;
        }

        match process.kill_with(Signal::Term) {
            Some(true) => {
                info!("Terminated orphaned monitor (pid {})", pid);
                signalled += 1;
            }
            Some(false) => warn!("Failed to terminate orphaned monitor (pid {})", pid),
            None => warn!("SIGTERM not supported, leaving pid {} alone", pid),
        }
    }

    signalled
}

/// Whether a process runs `file_name`, judged by its executable path or argv[0].
fn runs_executable(exe: Option<&Path>, argv0: Option<&OsStr>, file_name: &str) -> bool {
    let named = |path: &Path| path.file_name().is_some_and(|name| name == file_name);

    exe.is_some_and(named) || argv0.map(Path::new).is_some_and(named)
}
