// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, info};
use std::fs;
use std::path::Path;
use std::time::Duration;

use cachemon_util::sleep_cancellable;

use crate::error::Fault;

pub type Pid = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchQuality {
    None,
    Loose,
    Specific,
}

/// How well a command line matches a VM identifier. The specific tier
/// requires the identifier both after a -uuid argument and inside a
/// guest=<id> name argument, mirroring how libvirt launches QEMU.
fn match_cmdline(ident: &str, cmdline: &[String]) -> MatchQuality {
    let mut uuid_hit = false;
    let mut name_hit = false;
    let mut prev_was_uuid = false;

    for arg in cmdline.iter() {
        if prev_was_uuid && arg.contains(ident) {
            uuid_hit = true;
        }
        prev_was_uuid = arg == "-uuid";
        if arg.contains("guest=") && arg.contains(ident) {
            name_hit = true;
        }
    }
    if uuid_hit && name_hit {
        MatchQuality::Specific
    } else if cmdline.iter().any(|arg| arg.contains(ident)) {
        MatchQuality::Loose
    } else {
        MatchQuality::None
    }
}

/// Resolve a VM identifier (UUID or domain name) to the PID of the
/// hypervisor process hosting it.
pub fn find_vm_pid(ident: &str) -> Result<Pid> {
    let own_pid = std::process::id() as Pid;
    let mut specific = None;
    let mut loose = None;

    for proc in procfs::process::all_processes()
        .map_err(|e| Fault::Process(format!("scanning process table ({})", e)))?
    {
        if proc.pid == own_pid {
            continue;
        }
        let cmdline = match proc.cmdline() {
            Ok(v) => v,
            Err(_) => continue, // kernel thread or gone
        };
        match match_cmdline(ident, &cmdline) {
            MatchQuality::Specific => {
                if specific.is_none() {
                    specific = Some(proc.pid);
                }
            }
            MatchQuality::Loose => {
                if loose.is_none() {
                    loose = Some(proc.pid);
                }
            }
            MatchQuality::None => {}
        }
    }

    match specific.or(loose) {
        Some(pid) => {
            debug!("locate: VM {:?} -> PID {}", ident, pid);
            Ok(pid)
        }
        None => Err(Fault::Process(format!("no process found for VM {:?}", ident)).into()),
    }
}

pub fn pid_alive(pid: Pid) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Poll for process existence at 1Hz until `timeout_s` expires.
pub fn wait_for_liveness(pid: Pid, timeout_s: u64) -> Result<()> {
    for _ in 0..=timeout_s {
        if pid_alive(pid) {
            return Ok(());
        }
        info!("locate: waiting for PID {}...", pid);
        if !sleep_cancellable(Duration::from_secs(1)) {
            break;
        }
    }
    Err(Fault::Process(format!("PID {} not running after {}s", pid, timeout_s)).into())
}

/// All thread IDs of a process. The kernel resctrl tasks files and
/// perf operate on threads, not thread-group leaders.
pub fn tids_of(pid: Pid) -> Result<Vec<Pid>> {
    let task_dir = format!("/proc/{}/task", pid);
    let mut tids = Vec::new();
    for entry in fs::read_dir(&task_dir)
        .map_err(|e| Fault::Process(format!("reading {:?} ({})", task_dir, e)))?
    {
        if let Ok(tid) = entry?.file_name().to_string_lossy().parse::<Pid>() {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}
