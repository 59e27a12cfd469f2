// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::error::Fault;
use crate::locate::Pid;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;

const PERF_ATTR_SIZE_VER0: u32 = 64;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

// attr flag bits, see perf_event_open(2)
const ATTR_FLAG_INHERIT: u64 = 1 << 1;

/// First 64 bytes of struct perf_event_attr, which is all a plain
/// counting event needs; the kernel accepts any published size.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Instructions,
    Cycles,
    LlcMisses,
}

impl Event {
    fn config(&self) -> u64 {
        match self {
            Self::Instructions => PERF_COUNT_HW_INSTRUCTIONS,
            Self::Cycles => PERF_COUNT_HW_CPU_CYCLES,
            Self::LlcMisses => PERF_COUNT_HW_CACHE_MISSES,
        }
    }
}

/// One hardware counter attached to one thread. Counts from open;
/// children created afterwards are inherited into the count.
#[derive(Debug)]
pub struct PerfCounter {
    fd: RawFd,
}

impl PerfCounter {
    pub fn open(event: Event, tid: Pid) -> Result<Self> {
        let mut attr = PerfEventAttr {
            type_: PERF_TYPE_HARDWARE,
            size: PERF_ATTR_SIZE_VER0,
            config: event.config(),
            flags: ATTR_FLAG_INHERIT,
            ..Default::default()
        };

        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &mut attr as *mut PerfEventAttr,
                tid,
                -1 as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        } as RawFd;

        if fd < 0 {
            return Err(Fault::Telemetry(format!(
                "perf_event_open({:?}, tid {}) failed ({})",
                event,
                tid,
                io::Error::last_os_error()
            ))
            .into());
        }
        Ok(Self { fd })
    }

    pub fn read(&self) -> Result<u64> {
        let mut val: u64 = 0;
        let rc = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if rc != mem::size_of::<u64>() as isize {
            return Err(Fault::Telemetry(format!(
                "reading perf fd {} ({})",
                self.fd,
                io::Error::last_os_error()
            ))
            .into());
        }
        Ok(val)
    }
}

impl Drop for PerfCounter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
