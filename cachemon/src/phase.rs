// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{error, info};
use std::path::{Path, PathBuf};

use cachemon_intf::{Args, BASELINE_LOGS, CONTENTION_LOGS, COS1_NAME, COS2_NAME};
use cachemon_util::prog_exiting;

use crate::error::Fault;
use crate::locate::{self, Pid};
use crate::mask;
use crate::probe;
use crate::resctrl::{ClassGuard, Resctrl};
use crate::sampler::{LogFile, Sampler};
use crate::telemetry::{GroupGuard, MonBackend};

/// Owns the backend init/reset/fini lifecycle. Monitoring groups do
/// not survive a reset, so the phase boundary goes through restart()
/// rather than a bare reset.
struct TelemetrySession<'a> {
    backend: &'a dyn MonBackend,
    finished: bool,
}

impl<'a> TelemetrySession<'a> {
    fn open(backend: &'a dyn MonBackend) -> Result<Self> {
        backend.init()?;
        backend.reset()?;
        Ok(Self {
            backend,
            finished: false,
        })
    }

    fn restart(&self) -> Result<()> {
        self.backend.fini()?;
        self.backend.init()?;
        self.backend.reset()
    }

    fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.backend.fini()
    }
}

impl<'a> Drop for TelemetrySession<'a> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.backend.fini() {
            error!("phase: failed to unwind telemetry session ({:#})", &e);
        }
    }
}

/// One sampling pass over both VMs: pids[i] logs into names[i] under
/// out_dir. Groups are stopped before returning so the caller can
/// destroy whatever class holds the PIDs.
fn monitoring_pass(
    backend: &dyn MonBackend,
    sampler: &Sampler,
    pids: &[Pid],
    out_dir: &Path,
    names: &[&str],
    duration: u64,
) -> Result<()> {
    let mut logs = Vec::new();
    for name in names.iter() {
        logs.push(LogFile::create(out_dir.join(name))?);
    }

    let mut groups = Vec::new();
    for &pid in pids.iter() {
        groups.push(GroupGuard::start(backend, pid)?);
    }

    sampler.run(backend, &mut groups, &mut logs, duration)?;

    for guard in groups.drain(..) {
        guard.stop()?;
    }
    Ok(())
}

pub fn run_experiment(args: &Args, backend: &dyn MonBackend) -> Result<()> {
    run_phases(args, backend, &Sampler::default())
}

fn run_phases(args: &Args, backend: &dyn MonBackend, sampler: &Sampler) -> Result<()> {
    let fs = Resctrl::new(&args.resctrl_root);
    let platform = probe::probe(&fs, Path::new(&args.cpu_sysfs_root))?;

    let split = mask::split(platform.full_cbm);
    let upper = split.upper.ok_or_else(|| {
        Fault::Configuration(format!(
            "full CBM {} has a single way, can't partition",
            platform.full_cbm.to_hex(platform.hex_width)
        ))
    })?;

    // Resolve and verify both VMs before any kernel state is created.
    let pid1 = locate::find_vm_pid(&args.vm1)?;
    let pid2 = locate::find_vm_pid(&args.vm2)?;
    if pid1 == pid2 {
        return Err(Fault::Process(format!(
            "{:?} and {:?} resolve to the same PID {}",
            &args.vm1, &args.vm2, pid1
        ))
        .into());
    }
    locate::wait_for_liveness(pid1, args.liveness_timeout)?;
    locate::wait_for_liveness(pid2, args.liveness_timeout)?;
    info!(
        "phase: VM1 {:?} is PID {}, VM2 {:?} is PID {}",
        &args.vm1, pid1, &args.vm2, pid2
    );

    let out_dir = PathBuf::from(&args.out_dir);
    let session = TelemetrySession::open(backend)?;

    info!(
        "phase: partitioned baseline, {}+{} ways, MB {}, {}s",
        split.lower.nr_ways(),
        upper.nr_ways(),
        &args.mb_split,
        args.duration
    );
    {
        let mut cos1 = ClassGuard::create(&fs, COS1_NAME)?;
        let mut cos2 = ClassGuard::create(&fs, COS2_NAME)?;
        cos1.set_schemata(&platform.base.for_class(
            split.lower,
            platform.hex_width,
            args.mb_split.hi,
        ))?;
        cos2.set_schemata(&platform.base.for_class(
            upper,
            platform.hex_width,
            args.mb_split.lo,
        ))?;
        cos1.add_member(pid1)?;
        cos2.add_member(pid2)?;

        monitoring_pass(
            backend,
            sampler,
            &[pid1, pid2],
            &out_dir,
            &BASELINE_LOGS,
            args.duration,
        )?;

        cos1.release()?;
        cos2.release()?;
    }
    if prog_exiting() {
        bail!("interrupted during the baseline phase");
    }

    session.restart()?;

    info!("phase: unpartitioned contention, {}s", args.duration);
    monitoring_pass(
        backend,
        sampler,
        &[pid1, pid2],
        &out_dir,
        &CONTENTION_LOGS,
        args.duration,
    )?;

    session.finish()?;
    if prog_exiting() {
        bail!("interrupted during the contention phase");
    }
    info!("phase: done, logs under {:?}", &out_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::testutil::{raw, FakeBackend};
    use std::fs as stdfs;
    use std::time::Duration;

    struct TaggedChild {
        child: std::process::Child,
        pub tag: String,
    }

    impl TaggedChild {
        /// A process whose cmdline carries a unique tag so the VM
        /// locator can resolve it.
        fn spawn(nr: u32) -> Self {
            let tag = format!("cachemon-test-vm{}-{}", nr, std::process::id());
            // compound command so the shell can't exec-replace itself
            // and drop the tag from its cmdline
            let child = std::process::Command::new("sh")
                .arg("-c")
                .arg("sleep 30; :")
                .arg(&tag)
                .spawn()
                .unwrap();
            Self { child, tag }
        }

        fn pid(&self) -> Pid {
            self.child.id() as Pid
        }
    }

    impl Drop for TaggedChild {
        fn drop(&mut self) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }

    fn fake_platform(cbm: &str, l3: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let resctrl = dir.path().join("resctrl");
        stdfs::create_dir_all(resctrl.join("info/L3")).unwrap();
        stdfs::write(resctrl.join("info/L3/cbm_mask"), cbm).unwrap();
        stdfs::write(
            resctrl.join("schemata"),
            format!("MB:0=100;1=100\nL3:0={};1={}\n", l3, l3),
        )
        .unwrap();
        stdfs::write(resctrl.join("tasks"), "").unwrap();
        for (nr, pkg) in [0, 0, 1, 1].iter().enumerate() {
            let topo = dir.path().join(format!("cpu/cpu{}/topology", nr));
            stdfs::create_dir_all(&topo).unwrap();
            stdfs::write(topo.join("physical_package_id"), format!("{}\n", pkg)).unwrap();
        }
        dir
    }

    fn test_args(dir: &tempfile::TempDir, vm1: &str, vm2: &str) -> Args {
        Args {
            vm1: vm1.to_string(),
            vm2: vm2.to_string(),
            duration: 2,
            out_dir: dir.path().join("out").to_string_lossy().into_owned(),
            resctrl_root: dir.path().join("resctrl").to_string_lossy().into_owned(),
            cpu_sysfs_root: dir.path().join("cpu").to_string_lossy().into_owned(),
            mb_split: Default::default(),
            liveness_timeout: 0,
        }
    }

    fn fast_sampler() -> Sampler {
        Sampler::with_tick(Duration::from_millis(2))
    }

    #[test]
    fn test_full_experiment() {
        let dir = fake_platform("7fff\n", "7fff");
        let vm1 = TaggedChild::spawn(1);
        let vm2 = TaggedChild::spawn(2);
        let args = test_args(&dir, &vm1.tag, &vm2.tag);
        stdfs::create_dir_all(&args.out_dir).unwrap();

        let backend = FakeBackend::new(vec![
            (
                vm1.pid(),
                vec![raw(1_000, 1_000, 0, 0, 0, 0), raw(3_000, 2_000, 0, 0, 0, 0)],
            ),
            (vm2.pid(), vec![raw(2_000, 1_000, 0, 0, 0, 0)]),
        ]);
        run_phases(&args, &backend, &fast_sampler()).unwrap();

        // four well-formed logs, one data row per tick
        let out = PathBuf::from(&args.out_dir);
        for name in BASELINE_LOGS.iter().chain(CONTENTION_LOGS.iter()) {
            let body = stdfs::read_to_string(out.join(name)).unwrap();
            assert_eq!(body.lines().next().unwrap(), crate::sampler::LOG_HEADER);
            assert_eq!(
                body.lines().filter(|l| l.starts_with("     ")).count(),
                args.duration as usize,
                "{}", name
            );
        }

        // no class survives the run and both PIDs went back to the
        // default class
        let resctrl = dir.path().join("resctrl");
        assert!(!resctrl.join(COS1_NAME).exists());
        assert!(!resctrl.join(COS2_NAME).exists());
        let tasks = stdfs::read_to_string(resctrl.join("tasks")).unwrap();
        for pid in [vm1.pid(), vm2.pid()].iter() {
            assert!(tasks.lines().any(|l| l == format!("{}", pid)));
        }

        assert_eq!(backend.nr_active.get(), 0);
        // phase boundary restart plus the final fini
        assert_eq!(backend.nr_finis.get(), 2);
        assert_eq!(backend.nr_inits.get(), 2);
    }

    #[test]
    fn test_single_way_cbm_refused() {
        let dir = fake_platform("1\n", "1");
        let vm1 = TaggedChild::spawn(1);
        let vm2 = TaggedChild::spawn(2);
        let args = test_args(&dir, &vm1.tag, &vm2.tag);
        stdfs::create_dir_all(&args.out_dir).unwrap();

        let backend = FakeBackend::new(vec![]);
        let err = run_phases(&args, &backend, &fast_sampler()).unwrap_err();
        assert!(format!("{:#}", err).contains("single way"));
        // refused before touching kernel state
        assert!(!dir.path().join("resctrl").join(COS1_NAME).exists());
        assert_eq!(backend.nr_inits.get(), 0);
    }

    #[test]
    fn test_same_pid_refused() {
        let dir = fake_platform("7fff\n", "7fff");
        let vm = TaggedChild::spawn(1);
        let args = test_args(&dir, &vm.tag, &vm.tag);
        stdfs::create_dir_all(&args.out_dir).unwrap();

        let backend = FakeBackend::new(vec![]);
        let err = run_phases(&args, &backend, &fast_sampler()).unwrap_err();
        assert!(format!("{:#}", err).contains("same PID"));
        assert!(!dir.path().join("resctrl").join(COS1_NAME).exists());
    }

    #[test]
    fn test_missing_vm_refused() {
        let dir = fake_platform("7fff\n", "7fff");
        let vm1 = TaggedChild::spawn(1);
        let args = test_args(&dir, &vm1.tag, "cachemon-test-no-such-vm-zzz");
        stdfs::create_dir_all(&args.out_dir).unwrap();

        let backend = FakeBackend::new(vec![]);
        assert!(run_phases(&args, &backend, &fast_sampler()).is_err());
        assert!(!dir.path().join("resctrl").join(COS1_NAME).exists());
        assert_eq!(backend.nr_inits.get(), 0);
    }

    #[test]
    fn test_monitoring_pass_writes_both_logs() {
        let dir = tempfile::tempdir().unwrap();
        let vm1 = TaggedChild::spawn(1);
        let vm2 = TaggedChild::spawn(2);
        let backend = FakeBackend::new(vec![
            (vm1.pid(), vec![raw(1_000, 1_000, 0, 0, 0, 0)]),
            (vm2.pid(), vec![raw(2_000, 1_000, 0, 0, 0, 0)]),
        ]);

        monitoring_pass(
            &backend,
            &fast_sampler(),
            &[vm1.pid(), vm2.pid()],
            dir.path(),
            &CONTENTION_LOGS,
            3,
        )
        .unwrap();

        assert_eq!(backend.nr_active.get(), 0);
        for name in CONTENTION_LOGS.iter() {
            let body = stdfs::read_to_string(dir.path().join(name)).unwrap();
            assert_eq!(body.lines().filter(|l| l.starts_with("     ")).count(), 3);
        }
    }

    #[test]
    fn test_monitoring_pass_unwinds_groups_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let vm1 = TaggedChild::spawn(1);
        // no script for vm2, so its group start fails after vm1's opened
        let vm2 = TaggedChild::spawn(2);
        let backend = FakeBackend::new(vec![(vm1.pid(), vec![raw(0, 0, 0, 0, 0, 0)])]);

        assert!(monitoring_pass(
            &backend,
            &fast_sampler(),
            &[vm1.pid(), vm2.pid()],
            dir.path(),
            &BASELINE_LOGS,
            3,
        )
        .is_err());
        assert_eq!(backend.nr_active.get(), 0);
    }

    #[test]
    fn test_session_lifecycle() {
        let backend = FakeBackend::new(vec![]);
        let session = TelemetrySession::open(&backend).unwrap();
        assert_eq!(backend.nr_inits.get(), 1);

        session.restart().unwrap();
        assert_eq!(backend.nr_finis.get(), 1);
        assert_eq!(backend.nr_inits.get(), 2);

        session.finish().unwrap();
        assert_eq!(backend.nr_finis.get(), 2);
    }

    #[test]
    fn test_session_unwinds_on_drop() {
        let backend = FakeBackend::new(vec![]);
        {
            let _session = TelemetrySession::open(&backend).unwrap();
        }
        assert_eq!(backend.nr_finis.get(), 1);
    }
}
