// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, error, info, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use cachemon_util::{append_one_line, read_one_line};

use crate::error::Fault;
use crate::locate::{self, Pid};
use crate::perf::{Event, PerfCounter};

pub type GroupId = u32;

/// Cumulative counter snapshot for one monitoring group.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RawCounters {
    pub instructions: u64,
    pub cycles: u64,
    pub llc_misses: u64,
    pub llc_occup_bytes: u64,
    pub mbm_local_bytes: u64,
    pub mbm_total_bytes: u64,
}

/// Per-tick derived values for one monitoring group. IPC is a ratio
/// over the interval, never a delta; occupancy is instantaneous.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sample {
    pub ipc: f64,
    pub llc_misses_delta: u64,
    pub llc_occup_bytes: u64,
    pub mbm_local_delta: u64,
    pub mbm_remote_delta: u64,
}

/// The telemetry collaborator. Narrow on purpose so tests can drive
/// the sampling machinery with a deterministic fake.
pub trait MonBackend {
    fn init(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn start(&self, pid: Pid) -> Result<GroupId>;
    fn read(&self, gid: GroupId) -> Result<RawCounters>;
    fn stop(&self, gid: GroupId) -> Result<()>;
    fn fini(&self) -> Result<()>;
}

/// One monitored process: the backend group handle plus the last raw
/// snapshot the deltas are derived from.
#[derive(Debug)]
pub struct MonGroup {
    pub pid: Pid,
    gid: GroupId,
    last: RawCounters,
    pub sample: Sample,
    /// Ticks on which a counter went backwards (wrap or re-init);
    /// those deltas are reported as zero instead of aborting.
    pub nr_wraps: u64,
}

fn delta(cur: u64, last: u64, nr_wraps: &mut u64) -> u64 {
    if cur >= last {
        cur - last
    } else {
        *nr_wraps += 1;
        0
    }
}

impl MonGroup {
    fn refresh(&mut self, cur: RawCounters) {
        let d_cycles = delta(cur.cycles, self.last.cycles, &mut self.nr_wraps);
        let d_instr = delta(cur.instructions, self.last.instructions, &mut self.nr_wraps);
        let d_local = delta(cur.mbm_local_bytes, self.last.mbm_local_bytes, &mut self.nr_wraps);
        let d_total = delta(cur.mbm_total_bytes, self.last.mbm_total_bytes, &mut self.nr_wraps);

        self.sample = Sample {
            ipc: match d_cycles {
                0 => 0.0,
                _ => d_instr as f64 / d_cycles as f64,
            },
            llc_misses_delta: delta(cur.llc_misses, self.last.llc_misses, &mut self.nr_wraps),
            llc_occup_bytes: cur.llc_occup_bytes,
            mbm_local_delta: d_local,
            mbm_remote_delta: d_total.saturating_sub(d_local),
        };
        self.last = cur;
    }
}

/// Owns one started monitoring group. Must be stopped (or dropped)
/// before the process exits or the class holding its PID is destroyed.
pub struct GroupGuard<'a> {
    backend: &'a dyn MonBackend,
    group: Option<MonGroup>,
}

impl<'a> GroupGuard<'a> {
    /// Open a monitoring group for one live PID and seed the baseline
    /// snapshot so the first tick produces sane deltas.
    pub fn start(backend: &'a dyn MonBackend, pid: Pid) -> Result<Self> {
        if !locate::pid_alive(pid) {
            return Err(Fault::Process(format!("PID {} not running", pid)).into());
        }
        let gid = backend.start(pid)?;
        let last = match backend.read(gid) {
            Ok(v) => v,
            Err(e) => {
                let _ = backend.stop(gid);
                return Err(e);
            }
        };
        info!("mon: started group for PID {}", pid);
        Ok(Self {
            backend,
            group: Some(MonGroup {
                pid,
                gid,
                last,
                sample: Default::default(),
                nr_wraps: 0,
            }),
        })
    }

    pub fn pid(&self) -> Pid {
        self.group.as_ref().unwrap().pid
    }

    pub fn group(&self) -> &MonGroup {
        self.group.as_ref().unwrap()
    }

    pub fn stop(mut self) -> Result<()> {
        let group = self.group.take().unwrap();
        debug!("mon: stopping group for PID {}", group.pid);
        self.backend.stop(group.gid)
    }
}

impl<'a> Drop for GroupGuard<'a> {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            warn!("mon: unwinding group for PID {}", group.pid);
            if let Err(e) = self.backend.stop(group.gid) {
                error!("mon: failed to stop group for PID {} ({:#})", group.pid, &e);
            }
        }
    }
}

/// Sample all groups for one tick. Deltas are computed here, not by
/// the caller; all groups of one call share the tick.
pub fn poll_many(backend: &dyn MonBackend, groups: &mut [GroupGuard]) -> Result<()> {
    for guard in groups.iter_mut() {
        let group = guard.group.as_mut().unwrap();
        let cur = backend.read(group.gid)?;
        group.refresh(cur);
    }
    Ok(())
}

/// Production backend: a resctrl monitoring group per PID for LLC
/// occupancy and MBM, plus per-thread perf counters for instructions,
/// cycles and LLC misses.
pub struct ResctrlPerfBackend {
    root: PathBuf,
    groups: RefCell<HashMap<GroupId, NativeGroup>>,
    next_gid: Cell<GroupId>,
}

struct NativeGroup {
    dir: PathBuf,
    instructions: Vec<PerfCounter>,
    cycles: Vec<PerfCounter>,
    llc_misses: Vec<PerfCounter>,
}

const MON_GROUP_PREFIX: &str = "cachemon-";

impl ResctrlPerfBackend {
    pub fn new<P: AsRef<Path>>(resctrl_root: P) -> Self {
        Self {
            root: resctrl_root.as_ref().to_path_buf(),
            groups: RefCell::new(HashMap::new()),
            next_gid: Cell::new(0),
        }
    }

    fn mon_groups_dir(&self) -> PathBuf {
        self.root.join("mon_groups")
    }

    fn release_native(group: NativeGroup) -> Result<()> {
        // Dropping the perf fds releases the counters; removing the
        // group dir returns its tasks to the default monitoring group.
        let NativeGroup { dir, instructions, cycles, llc_misses, .. } = group;
        drop(instructions);
        drop(cycles);
        drop(llc_misses);
        fs::remove_dir(&dir)
            .map_err(|e| Fault::Telemetry(format!("removing {:?} ({})", &dir, e)).into())
    }
}

fn read_mon_counter(domain: &Path, name: &str) -> u64 {
    // A domain can report "Unavailable" when its RMID hasn't been
    // scheduled yet; count it as zero rather than failing the tick.
    match read_one_line(domain.join(name)) {
        Ok(line) => line.trim().parse().unwrap_or(0),
        Err(_) => 0,
    }
}

impl MonBackend for ResctrlPerfBackend {
    fn init(&self) -> Result<()> {
        let dir = self.mon_groups_dir();
        if !dir.is_dir() {
            return Err(Fault::Telemetry(format!(
                "{:?} missing; resctrl monitoring unsupported or not mounted",
                &dir
            ))
            .into());
        }
        Ok(())
    }

    /// Clear monitoring groups left behind by a previous run. Never
    /// touches groups made by other tools.
    fn reset(&self) -> Result<()> {
        let pattern = format!("{}/{}*", self.mon_groups_dir().display(), MON_GROUP_PREFIX);
        for path in glob::glob(&pattern).unwrap().filter_map(Result::ok) {
            warn!("mon: removing stale monitoring group {:?}", &path);
            fs::remove_dir(&path)
                .map_err(|e| Fault::Telemetry(format!("removing stale {:?} ({})", &path, e)))?;
        }
        Ok(())
    }

    fn start(&self, pid: Pid) -> Result<GroupId> {
        let dir = self.mon_groups_dir().join(format!("{}{}", MON_GROUP_PREFIX, pid));
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(Fault::Telemetry(format!("creating {:?} ({})", &dir, e)).into());
            }
        }

        let mut group = NativeGroup {
            dir: dir.clone(),
            instructions: Vec::new(),
            cycles: Vec::new(),
            llc_misses: Vec::new(),
        };

        let tasks_path = dir.join("tasks");
        let result = (|| -> Result<()> {
            for tid in locate::tids_of(pid)? {
                append_one_line(&tasks_path, &format!("{}", tid)).map_err(|e| {
                    Fault::Telemetry(format!("appending {} to {:?} ({})", tid, &tasks_path, e))
                })?;
                group.instructions.push(PerfCounter::open(Event::Instructions, tid)?);
                group.cycles.push(PerfCounter::open(Event::Cycles, tid)?);
                group.llc_misses.push(PerfCounter::open(Event::LlcMisses, tid)?);
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _ = Self::release_native(group);
            return Err(e);
        }

        let gid = self.next_gid.get();
        self.next_gid.set(gid + 1);
        self.groups.borrow_mut().insert(gid, group);
        Ok(gid)
    }

    fn read(&self, gid: GroupId) -> Result<RawCounters> {
        let groups = self.groups.borrow();
        let group = groups
            .get(&gid)
            .ok_or_else(|| Fault::Telemetry(format!("unknown monitoring group {}", gid)))?;

        let mut raw = RawCounters::default();
        for counter in group.instructions.iter() {
            raw.instructions += counter.read()?;
        }
        for counter in group.cycles.iter() {
            raw.cycles += counter.read()?;
        }
        for counter in group.llc_misses.iter() {
            raw.llc_misses += counter.read()?;
        }

        // Sum the L3 monitoring domains.
        let pattern = format!("{}/mon_data/mon_L3_*", group.dir.display());
        for domain in glob::glob(&pattern).unwrap().filter_map(Result::ok) {
            raw.llc_occup_bytes += read_mon_counter(&domain, "llc_occupancy");
            raw.mbm_local_bytes += read_mon_counter(&domain, "mbm_local_bytes");
            raw.mbm_total_bytes += read_mon_counter(&domain, "mbm_total_bytes");
        }
        Ok(raw)
    }

    fn stop(&self, gid: GroupId) -> Result<()> {
        let group = self
            .groups
            .borrow_mut()
            .remove(&gid)
            .ok_or_else(|| Fault::Telemetry(format!("unknown monitoring group {}", gid)))?;
        Self::release_native(group)
    }

    fn fini(&self) -> Result<()> {
        let leftover: Vec<GroupId> = self.groups.borrow().keys().copied().collect();
        for gid in leftover {
            warn!("mon: group {} still open at fini, stopping", gid);
            self.stop(gid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Deterministic backend: each PID gets a scripted sequence of
    /// raw snapshots, replayed one per read (the last repeats).
    pub struct FakeBackend {
        scripts: HashMap<Pid, Vec<RawCounters>>,
        cursor: RefCell<HashMap<GroupId, (Pid, usize)>>,
        next_gid: Cell<GroupId>,
        pub nr_active: Cell<u32>,
        pub nr_inits: Cell<u32>,
        pub nr_finis: Cell<u32>,
    }

    impl FakeBackend {
        pub fn new(scripts: Vec<(Pid, Vec<RawCounters>)>) -> Self {
            Self {
                scripts: scripts.into_iter().collect(),
                cursor: RefCell::new(HashMap::new()),
                next_gid: Cell::new(0),
                nr_active: Cell::new(0),
                nr_inits: Cell::new(0),
                nr_finis: Cell::new(0),
            }
        }
    }

    impl MonBackend for FakeBackend {
        fn init(&self) -> Result<()> {
            self.nr_inits.set(self.nr_inits.get() + 1);
            Ok(())
        }

        fn reset(&self) -> Result<()> {
            Ok(())
        }

        fn start(&self, pid: Pid) -> Result<GroupId> {
            if !self.scripts.contains_key(&pid) {
                return Err(Fault::Telemetry(format!("no script for PID {}", pid)).into());
            }
            let gid = self.next_gid.get();
            self.next_gid.set(gid + 1);
            self.cursor.borrow_mut().insert(gid, (pid, 0));
            self.nr_active.set(self.nr_active.get() + 1);
            Ok(gid)
        }

        fn read(&self, gid: GroupId) -> Result<RawCounters> {
            let mut cursor = self.cursor.borrow_mut();
            let (pid, idx) = *cursor
                .get(&gid)
                .ok_or_else(|| Fault::Telemetry(format!("unknown group {}", gid)))?;
            let script = &self.scripts[&pid];
            let raw = script[idx.min(script.len() - 1)];
            cursor.insert(gid, (pid, idx + 1));
            Ok(raw)
        }

        fn stop(&self, gid: GroupId) -> Result<()> {
            self.cursor
                .borrow_mut()
                .remove(&gid)
                .ok_or_else(|| Fault::Telemetry(format!("unknown group {}", gid)))?;
            self.nr_active.set(self.nr_active.get() - 1);
            Ok(())
        }

        fn fini(&self) -> Result<()> {
            self.nr_finis.set(self.nr_finis.get() + 1);
            Ok(())
        }
    }

    pub fn raw(instructions: u64, cycles: u64, misses: u64, occup: u64, local: u64, total: u64) -> RawCounters {
        RawCounters {
            instructions,
            cycles,
            llc_misses: misses,
            llc_occup_bytes: occup,
            mbm_local_bytes: local,
            mbm_total_bytes: total,
        }
    }
}
