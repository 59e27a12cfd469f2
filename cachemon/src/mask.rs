// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::warn;

use crate::error::Fault;

/// An LLC capacity bitmask. CAT requires at least one set bit and all
/// set bits contiguous; both are enforced at construction so invalid
/// masks can never reach a schemata write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMask(u64);

fn is_contiguous(raw: u64) -> bool {
    raw != 0 && ((raw >> raw.trailing_zeros()) + 1).is_power_of_two()
}

impl CacheMask {
    pub fn new(raw: u64) -> Result<Self> {
        if raw == 0 {
            return Err(Fault::Configuration("cache mask has no bits set".into()).into());
        }
        if !is_contiguous(raw) {
            return Err(Fault::Configuration(format!(
                "cache mask {:#x} has non-contiguous bits",
                raw
            ))
            .into());
        }
        Ok(Self(raw))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn nr_ways(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowercase hex zero-padded to the width the kernel advertised.
    /// The kernel rejects masks whose textual width doesn't match.
    pub fn to_hex(&self, width: usize) -> String {
        format!("{:0width$x}", self.0, width = width)
    }
}

/// Parse a cbm_mask string (optional 0x prefix) into the raw mask and
/// the number of hex digits in the advertised form.
pub fn parse_cbm(input: &str) -> Result<(u64, usize)> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 16 {
        return Err(Fault::Configuration(format!("unexpected CBM {:?}", input)).into());
    }
    let raw = u64::from_str_radix(digits, 16)
        .map_err(|e| Fault::Configuration(format!("invalid CBM {:?} ({})", input, e)))?;
    Ok((raw, digits.len()))
}

#[derive(Debug, Clone, Copy)]
pub struct MaskSplit {
    pub lower: CacheMask,
    /// None when the full mask has a single way and can't be split.
    pub upper: Option<CacheMask>,
}

/// Split the full CBM into two partitions: `lower` takes the lowest
/// floor(k/2) set bits, `upper` the rest. Only the set-bit count
/// determines cache ways, and taking the floor from the low end keeps
/// both halves contiguous; odd counts give the extra way to `upper`.
pub fn split(full: CacheMask) -> MaskSplit {
    let half = full.nr_ways() / 2;
    if half == 0 {
        warn!("mask: full CBM {:#x} has a single way, can't split", full.raw());
        return MaskSplit {
            lower: full,
            upper: None,
        };
    }

    let lower_raw = ((1u64 << half) - 1) << full.raw().trailing_zeros();
    let lower = CacheMask::new(lower_raw).unwrap();
    let upper = CacheMask::new(full.raw() & !lower_raw).unwrap();
    MaskSplit {
        lower,
        upper: Some(upper),
    }
}
