//! Process table scanning
//!
//! Used where no PID is handed back to us: the forwarding channel after
//! `ssh -f` has daemonized, and service instances whose PID file was lost.

use std::ffi::OsStr;

use sysinfo::System;

/// One entry of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Full command line, lossily decoded
    pub cmd: Vec<String>,
}

impl ProcessInfo {
    /// File name of the executable (`cmd[0]` without its directory)
    pub fn program(&self) -> &str {
        self.cmd
            .first()
            .map(|p| p.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(p.as_str()))
            .unwrap_or_default()
    }

    /// Value following `flag` on the command line (`--port 8080` or `--port=8080`)
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        let prefix = format!("{}=", flag);
        let mut args = self.cmd.iter();
        while let Some(arg) = args.next() {
            if arg == flag {
                return args.next().map(String::as_str);
            }
            if let Some(value) = arg.strip_prefix(&prefix) {
                return Some(value);
            }
        }
        None
    }
}

fn lossy<S: AsRef<OsStr>>(value: S) -> String {
    value.as_ref().to_string_lossy().into_owned()
}

/// Every process owned by the current user whose command line matches
pub fn find_own_processes<F>(matches: F) -> Vec<ProcessInfo>
where
    F: Fn(&ProcessInfo) -> bool,
{
    let system = System::new_all();
    let me = sysinfo::get_current_pid().ok();
    let my_uid = me
        .and_then(|pid| system.process(pid))
        .and_then(|p| p.user_id().cloned());

    let mut found: Vec<ProcessInfo> = system
        .processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != me)
        .filter(|(_, process)| match (&my_uid, process.user_id()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            // Ownership unknown on this platform; keep the process
            _ => true,
        })
        .map(|(pid, process)| ProcessInfo {
            pid: pid.as_u32(),
            cmd: process.cmd().iter().map(lossy).collect(),
        })
        .filter(|info| !info.cmd.is_empty() && matches(info))
        .collect();
    found.sort_by_key(|p| p.pid);
    found
}
