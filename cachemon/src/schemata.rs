// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use scan_fmt::scan_fmt;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;

use crate::error::Fault;
use crate::mask::CacheMask;

/// Typed form of a resctrl schemata document. Raw strings never cross
/// component boundaries; serialisation and parsing happen only at the
/// kernel interface.
///
/// The hex widths are carried alongside the masks because the kernel
/// rejects a mask whose textual width differs from the advertised one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schemata {
    /// socket -> MB throttle percentage
    pub mb: BTreeMap<u32, u32>,
    /// L2 cluster -> bitmask (full mask per cluster in this program)
    pub l2: BTreeMap<u32, u64>,
    /// socket -> L3 partition bitmask
    pub l3: BTreeMap<u32, u64>,
    pub l2_width: usize,
    pub l3_width: usize,
}

impl Schemata {
    pub fn parse(doc: &str) -> Result<Self> {
        let mut sch = Self::default();

        for line in doc.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (resource, body) = match line.find(':') {
                Some(idx) => (line[..idx].trim(), &line[idx + 1..]),
                None => {
                    return Err(
                        Fault::Configuration(format!("malformed schemata line {:?}", line)).into(),
                    )
                }
            };
            for tok in body.split(';').filter(|t| !t.trim().is_empty()) {
                match resource {
                    "MB" => {
                        let (id, pct) = scan_fmt!(tok.trim(), "{d}={d}", u32, u32).map_err(|_| {
                            Fault::Configuration(format!("malformed MB entry {:?}", tok))
                        })?;
                        sch.mb.insert(id, pct);
                    }
                    "L2" | "L3" => {
                        let (id, mask, width) = parse_mask_entry(tok)?;
                        if resource == "L2" {
                            sch.l2.insert(id, mask);
                            sch.l2_width = sch.l2_width.max(width);
                        } else {
                            sch.l3.insert(id, mask);
                            sch.l3_width = sch.l3_width.max(width);
                        }
                    }
                    // SMBA, L3DATA etc. aren't used by this program.
                    _ => {}
                }
            }
        }
        Ok(sch)
    }

    pub fn format(&self) -> String {
        let mut doc = String::new();
        if !self.mb.is_empty() {
            let body: Vec<String> = self.mb.iter().map(|(id, pct)| format!("{}={}", id, pct)).collect();
            writeln!(doc, "MB:{}", body.join(";")).unwrap();
        }
        if !self.l2.is_empty() {
            let body: Vec<String> = self
                .l2
                .iter()
                .map(|(id, mask)| format!("{}={:0w$x}", id, mask, w = self.l2_width))
                .collect();
            writeln!(doc, "L2:{}", body.join(";")).unwrap();
        }
        if !self.l3.is_empty() {
            let body: Vec<String> = self
                .l3
                .iter()
                .map(|(id, mask)| format!("{}={:0w$x}", id, mask, w = self.l3_width))
                .collect();
            writeln!(doc, "L3:{}", body.join(";")).unwrap();
        }
        doc
    }

    /// Reject documents which would violate the hardware contract
    /// before they reach the kernel.
    pub fn validate(&self) -> Result<()> {
        for (id, pct) in self.mb.iter() {
            if *pct < 10 || *pct > 100 {
                return Err(Fault::Configuration(format!(
                    "MB percentage {} for socket {} out of range [10, 100]",
                    pct, id
                ))
                .into());
            }
        }
        for (id, mask) in self.l2.iter().chain(self.l3.iter()) {
            CacheMask::new(*mask).map_err(|e| {
                Fault::Configuration(format!("invalid mask {:#x} for id {} ({})", mask, id, e))
            })?;
        }
        Ok(())
    }

    /// Derive the schemata of one partitioned class from the root
    /// document: every socket gets `l3` as its L3 share and `mb_pct`
    /// as its MB throttle, L2 stays at the full per-cluster mask.
    pub fn for_class(&self, l3: CacheMask, l3_width: usize, mb_pct: u32) -> Schemata {
        Schemata {
            mb: self.mb.keys().map(|id| (*id, mb_pct)).collect(),
            l2: self.l2.clone(),
            l3: self.l3.keys().map(|id| (*id, l3.raw())).collect(),
            l2_width: self.l2_width,
            l3_width,
        }
    }
}

fn parse_mask_entry(tok: &str) -> Result<(u32, u64, usize)> {
    let tok = tok.trim();
    let mut it = tok.splitn(2, '=');
    match (it.next(), it.next()) {
        (Some(id), Some(hex)) => {
            let id = id
                .trim()
                .parse::<u32>()
                .map_err(|_| Fault::Configuration(format!("malformed mask entry {:?}", tok)))?;
            let hex = hex.trim();
            let mask = u64::from_str_radix(hex, 16)
                .map_err(|_| Fault::Configuration(format!("malformed mask entry {:?}", tok)))?;
            Ok((id, mask, hex.len()))
        }
        _ => Err(Fault::Configuration(format!("malformed mask entry {:?}", tok)).into()),
    }
}
