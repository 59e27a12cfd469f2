// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

pub mod args;

pub use args::Args;

pub const COS1_NAME: &str = "COS1";
pub const COS2_NAME: &str = "COS2";

/// Per-phase per-VM log file names. The partitioned baseline runs
/// first, the unpartitioned contention phase second.
pub const BASELINE_LOGS: [&str; 2] = ["VM1_half_baseline.txt", "VM2_half_baseline.txt"];
pub const CONTENTION_LOGS: [&str; 2] = ["VM1_normal.txt", "VM2_normal.txt"];

/// MB throttle percentages for the two partitioned classes. The
/// lower-mask class gets `hi`, the upper-mask class gets `lo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MbSplit {
    pub hi: u32,
    pub lo: u32,
}

impl MbSplit {
    pub fn validate(&self) -> Result<()> {
        for pct in [self.hi, self.lo].iter() {
            if *pct < 10 || *pct > 100 {
                bail!("MB percentage {} out of range [10, 100]", pct);
            }
        }
        Ok(())
    }
}

impl Default for MbSplit {
    fn default() -> Self {
        Self { hi: 80, lo: 20 }
    }
}

impl FromStr for MbSplit {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut it = input.splitn(2, '/');
        let split = match (it.next(), it.next()) {
            (Some(hi), Some(lo)) => Self {
                hi: hi.trim().parse()?,
                lo: lo.trim().parse()?,
            },
            _ => bail!("MB split {:?} is not of the form HI/LO", input),
        };
        split.validate()?;
        Ok(split)
    }
}

impl fmt::Display for MbSplit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.hi, self.lo)
    }
}
