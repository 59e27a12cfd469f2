// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;

use cachemon_util::{init_logging, JsonLoad};

use super::MbSplit;

const HELP_BODY: &str = "\
LLC partition and contention monitor.

cachemon measures last-level-cache and memory-bandwidth contention
between two co-located VMs on a two-socket RDT platform. It splits the
LLC capacity bitmask in half, installs one resource class per VM, then
samples IPC, LLC occupancy, LLC misses and local/remote memory
bandwidth at 1Hz through two phases: a partitioned baseline and an
unpartitioned contention run.

Four log files are produced in the output directory:
VM1_half_baseline.txt, VM2_half_baseline.txt, VM1_normal.txt and
VM2_normal.txt.

Requires root, a mounted resctrl filesystem with L3 CAT, and two
distinct running VMs.
";

lazy_static! {
    static ref ARGS_STR: String = format!(
        "<VM1>                  'UUID or libvirt domain name of the first VM'
         <VM2>                  'UUID or libvirt domain name of the second VM'
         <DURATION>             'Per-phase monitoring duration in seconds'
         -o, --out=[DIR]        'Output directory for log files (default: {dfl_out})'
             --resctrl=[PATH]   'resctrl filesystem root (default: {dfl_resctrl})'
             --cpu-sysfs=[PATH] 'CPU topology sysfs root (default: {dfl_cpus})'
         -m, --mb=[HI/LO]       'MB throttle pcts for the two classes (default: {dfl_mb})'
         -t, --timeout=[SECS]   'PID liveness timeout in seconds (default: {dfl_timeout})'
         -a, --args=[FILE]      'Load base command line arguments from FILE'
         -v...                  'Sets the level of verbosity'",
        dfl_out = Args::default().out_dir,
        dfl_resctrl = Args::default().resctrl_root,
        dfl_cpus = Args::default().cpu_sysfs_root,
        dfl_mb = MbSplit::default(),
        dfl_timeout = Args::default().liveness_timeout,
    );
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Args {
    pub vm1: String,
    pub vm2: String,
    pub duration: u64,
    pub out_dir: String,
    pub resctrl_root: String,
    pub cpu_sysfs_root: String,
    pub mb_split: MbSplit,
    pub liveness_timeout: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            vm1: String::new(),
            vm2: String::new(),
            duration: 30,
            out_dir: ".".into(),
            resctrl_root: "/sys/fs/resctrl".into(),
            cpu_sysfs_root: "/sys/devices/system/cpu".into(),
            mb_split: Default::default(),
            liveness_timeout: 5,
        }
    }
}

impl JsonLoad for Args {}

impl Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("cachemon")
            .version(env!("CARGO_PKG_VERSION"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(v) = matches.value_of("VM1") {
            self.vm1 = v.to_string();
        }
        if let Some(v) = matches.value_of("VM2") {
            self.vm2 = v.to_string();
        }
        if let Some(v) = matches.value_of("DURATION") {
            self.duration = v.parse().context("parsing DURATION")?;
        }
        if let Some(v) = matches.value_of("out") {
            self.out_dir = v.to_string();
        }
        if let Some(v) = matches.value_of("resctrl") {
            self.resctrl_root = v.to_string();
        }
        if let Some(v) = matches.value_of("cpu-sysfs") {
            self.cpu_sysfs_root = v.to_string();
        }
        if let Some(v) = matches.value_of("mb") {
            self.mb_split = v.parse().context("parsing --mb")?;
        }
        if let Some(v) = matches.value_of("timeout") {
            self.liveness_timeout = v.parse().context("parsing --timeout")?;
        }
        Ok(())
    }

    /// Parse the command line, optionally on top of a JSON base-args
    /// file, and initialize logging from the -v count.
    pub fn init_args_and_logging() -> Result<Args> {
        let matches = Self::match_cmdline();
        init_logging(matches.occurrences_of("v") as u32);

        let mut args = match matches.value_of("args") {
            Some(path) => {
                Args::load(path).with_context(|| format!("loading args file {:?}", path))?
            }
            None => Default::default(),
        };
        args.process_cmdline(&matches)?;
        Ok(args)
    }
}
