// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use chrono::Local;
use log::{debug, info};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cachemon_util::{prog_exiting, sleep_cancellable};

use crate::error::Fault;
use crate::locate;
use crate::telemetry::{poll_many, GroupGuard, MonBackend, Sample};

pub const LOG_HEADER: &str =
    "TIME                PID     IPC      MISSES   LLC[KB]  MBL[MB/s]  MBR[MB/s]";

/// One telemetry log. The header goes out at creation, so a zero
/// duration run still leaves a well-formed file behind.
pub struct LogFile {
    path: PathBuf,
    w: BufWriter<fs::File>,
}

impl LogFile {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::create(&path)
            .map_err(|e| Fault::Configuration(format!("creating {:?} ({})", &path, e)))?;
        let mut w = BufWriter::new(file);
        writeln!(w, "{}", LOG_HEADER)
            .map_err(|e| Fault::Configuration(format!("writing {:?} ({})", &path, e)))?;
        info!("log: opened {:?}", &path);
        Ok(Self { path, w })
    }

    fn write_row(&mut self, ts: &str, pid: locate::Pid, sample: &Sample) -> Result<()> {
        let res = writeln!(self.w, "TIME {}", ts).and_then(|_| {
            writeln!(
                self.w,
                "     {:6}   {:5.2}   {:8}k   {:7}    {:6.2}     {:6.2}",
                pid,
                sample.ipc,
                sample.llc_misses_delta / 1024,
                sample.llc_occup_bytes / 1024,
                sample.mbm_local_delta as f64 / 1_000_000.0,
                sample.mbm_remote_delta as f64 / 1_000_000.0,
            )
        });
        res.map_err(|e| Fault::Configuration(format!("writing {:?} ({})", &self.path, e)))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.w
            .flush()
            .map_err(|e| Fault::Configuration(format!("flushing {:?} ({})", &self.path, e)))?;
        Ok(())
    }
}

/// Drives one sampling pass: one row per tick per group, each group
/// into its own log, every group of a tick stamped with one timestamp.
pub struct Sampler {
    tick: Duration,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

impl Sampler {
    #[cfg(test)]
    pub(crate) fn with_tick(tick: Duration) -> Self {
        Self { tick }
    }

    /// Sample for `duration` ticks. groups[i] logs into logs[i]. Stops
    /// early without error on an exit request; a monitored PID going
    /// away mid-run is an error so the phase unwinds.
    pub fn run(
        &self,
        backend: &dyn MonBackend,
        groups: &mut [GroupGuard],
        logs: &mut [LogFile],
        duration: u64,
    ) -> Result<()> {
        assert_eq!(groups.len(), logs.len());

        for nr_tick in 0..duration {
            if !sleep_cancellable(self.tick) {
                info!("sampler: exit requested, stopping after {} ticks", nr_tick);
                break;
            }
            for guard in groups.iter() {
                if !locate::pid_alive(guard.pid()) {
                    return Err(Fault::Vanished(guard.pid()).into());
                }
            }
            poll_many(backend, groups)?;

            let ts = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
            for (guard, log) in groups.iter().zip(logs.iter_mut()) {
                let group = guard.group();
                log.write_row(&ts, group.pid, &group.sample)?;
                log.flush()?;
            }
            debug!("sampler: tick {}/{}", nr_tick + 1, duration);
        }

        if prog_exiting() {
            info!("sampler: pass cut short by exit request");
        }
        Ok(())
    }
}
