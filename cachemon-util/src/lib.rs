// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use log::info;
use simplelog as sl;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub mod json_file;

pub use json_file::JsonLoad;

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }

    let level = match verbosity {
        0 => sl::LevelFilter::Info,
        1 => sl::LevelFilter::Debug,
        _ => sl::LevelFilter::Trace,
    };
    let mut cfg = sl::ConfigBuilder::new();
    cfg.set_time_level(sl::LevelFilter::Off)
        .set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off);
    if sl::TermLogger::init(
        level,
        cfg.build(),
        sl::TerminalMode::Stderr,
        sl::ColorChoice::Auto,
    )
    .is_err()
    {
        sl::SimpleLogger::init(level, cfg.build()).unwrap();
    }
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("file empty"))??)
}

pub fn append_one_line<P: AsRef<Path>>(path: P, line: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new().append(true).create(true).open(path)?;
    f.write_all(line.as_ref())?;
    Ok(f.write_all(b"\n")?)
}

static EXITING: AtomicBool = AtomicBool::new(false);

pub fn setup_prog_state() {
    ctrlc::set_handler(|| {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    EXITING.store(true, Ordering::Relaxed);
}

pub fn prog_exiting() -> bool {
    EXITING.load(Ordering::Relaxed)
}

/// Sleep for `dur` in short slices so that a termination signal is
/// noticed promptly. Returns false if the program is exiting.
pub fn sleep_cancellable(dur: Duration) -> bool {
    let until = Instant::now() + dur;
    loop {
        if prog_exiting() {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        std::thread::sleep((until - now).min(Duration::from_millis(100)));
    }
}
