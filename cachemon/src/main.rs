// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::error;
use std::fs;

use cachemon_intf::Args;

mod error;
mod locate;
mod mask;
mod perf;
mod phase;
mod probe;
mod resctrl;
mod sampler;
mod schemata;
mod telemetry;

fn run() -> Result<()> {
    cachemon_util::setup_prog_state();
    let args = Args::init_args_and_logging()?;

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating output directory {:?}", &args.out_dir))?;

    let backend = telemetry::ResctrlPerfBackend::new(&args.resctrl_root);
    phase::run_experiment(&args, &backend)
}

fn main() {
    if let Err(e) = run() {
        error!("{:#}", &e);
        std::process::exit(1);
    }
}
