// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use glob::glob;
use log::{debug, info};
use std::path::Path;

use cachemon_util::read_one_line;

use crate::error::Fault;
use crate::mask::{self, CacheMask};
use crate::resctrl::Resctrl;
use crate::schemata::Schemata;

/// What the kernel advertises about the platform: the full LLC CBM
/// (with the textual width it was advertised at), the root schemata
/// document (which resources and ids exist), and the socket IDs.
#[derive(Debug)]
pub struct Platform {
    pub full_cbm: CacheMask,
    pub hex_width: usize,
    pub sockets: Vec<u32>,
    pub base: Schemata,
}

pub fn probe(fs: &Resctrl, cpu_sysfs_root: &Path) -> Result<Platform> {
    let cbm_path = fs.cbm_mask_path();
    let raw = read_one_line(&cbm_path)
        .map_err(|e| Fault::Configuration(format!("reading {:?} ({})", &cbm_path, e)))?;
    let (cbm_raw, hex_width) = mask::parse_cbm(&raw)?;
    let full_cbm = CacheMask::new(cbm_raw)?;
    info!(
        "probe: full LLC CBM {} ({} ways)",
        full_cbm.to_hex(hex_width),
        full_cbm.nr_ways()
    );

    let base = fs.read_root_schemata()?;
    if base.l3.is_empty() {
        return Err(Fault::Configuration(format!(
            "no L3 line in {:?}; CAT unavailable",
            fs.root().join("schemata")
        ))
        .into());
    }
    debug!(
        "probe: root schemata has {} MB, {} L2, {} L3 entries",
        base.mb.len(),
        base.l2.len(),
        base.l3.len()
    );

    let sockets = detect_sockets(cpu_sysfs_root)?;
    info!("probe: sockets {:?}", &sockets);
    if sockets.len() < 2 {
        return Err(Fault::Configuration(format!(
            "found {} socket(s) under {:?}, experiment needs two",
            sockets.len(),
            cpu_sysfs_root
        ))
        .into());
    }

    Ok(Platform {
        full_cbm,
        hex_width,
        sockets,
        base,
    })
}

/// Unique physical package IDs, ascending.
fn detect_sockets(cpu_sysfs_root: &Path) -> Result<Vec<u32>> {
    let pattern = format!(
        "{}/cpu*/topology/physical_package_id",
        cpu_sysfs_root.display()
    );
    let mut sockets = Vec::new();
    for path in glob(&pattern).unwrap().filter_map(Result::ok) {
        let id = read_one_line(&path)
            .map_err(|e| Fault::Configuration(format!("reading {:?} ({})", &path, e)))?
            .trim()
            .parse::<u32>()
            .map_err(|e| Fault::Configuration(format!("parsing {:?} ({})", &path, e)))?;
        if !sockets.contains(&id) {
            sockets.push(id);
        }
    }
    if sockets.is_empty() {
        return Err(Fault::Configuration(format!(
            "no CPU topology entries under {:?}",
            cpu_sysfs_root
        ))
        .into());
    }
    sockets.sort_unstable();
    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_sysfs(cbm: &str, schemata: &str, packages: &[u32]) -> (tempfile::TempDir, Resctrl) {
        let dir = tempfile::tempdir().unwrap();
        let resctrl = dir.path().join("resctrl");
        fs::create_dir_all(resctrl.join("info/L3")).unwrap();
        fs::write(resctrl.join("info/L3/cbm_mask"), cbm).unwrap();
        fs::write(resctrl.join("schemata"), schemata).unwrap();

        let cpus = dir.path().join("cpu");
        for (nr, pkg) in packages.iter().enumerate() {
            let topo = cpus.join(format!("cpu{}/topology", nr));
            fs::create_dir_all(&topo).unwrap();
            fs::write(topo.join("physical_package_id"), format!("{}\n", pkg)).unwrap();
        }
        (dir, Resctrl::new(resctrl))
    }

    #[test]
    fn test_probe() {
        let (dir, fs_handle) = fake_sysfs(
            "7fff\n",
            "MB:0=100;1=100\nL2:0=ffff;1=ffff\nL3:0=7fff;1=7fff\n",
            &[0, 0, 1, 1],
        );
        let plat = probe(&fs_handle, &dir.path().join("cpu")).unwrap();
        assert_eq!(plat.full_cbm.raw(), 0x7fff);
        assert_eq!(plat.hex_width, 4);
        assert_eq!(plat.sockets, vec![0, 1]);
        assert_eq!(plat.base.l2.len(), 2);
        assert_eq!(plat.base.mb[&1], 100);
    }

    #[test]
    fn test_probe_preserves_width() {
        let (dir, fs_handle) = fake_sysfs("fffff\n", "L3:0=fffff;1=fffff\n", &[0, 1]);
        let plat = probe(&fs_handle, &dir.path().join("cpu")).unwrap();
        assert_eq!(plat.hex_width, 5);
        assert!(plat.base.mb.is_empty());
    }

    #[test]
    fn test_probe_single_socket_is_fatal() {
        let (dir, fs_handle) = fake_sysfs("7fff\n", "L3:0=7fff\n", &[0, 0]);
        assert!(probe(&fs_handle, &dir.path().join("cpu")).is_err());
    }

    #[test]
    fn test_probe_missing_cbm_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fs_handle = Resctrl::new(dir.path().join("resctrl"));
        let err = probe(&fs_handle, dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("cbm_mask"));
    }

    #[test]
    fn test_probe_missing_l3_line_is_fatal() {
        let (dir, fs_handle) = fake_sysfs("7fff\n", "MB:0=100;1=100\n", &[0, 1]);
        assert!(probe(&fs_handle, &dir.path().join("cpu")).is_err());
    }

    #[test]
    fn test_detect_sockets_sorted() {
        let (dir, _) = fake_sysfs("1\n", "L3:0=1\n", &[1, 0, 1, 0]);
        assert_eq!(detect_sockets(&dir.path().join("cpu")).unwrap(), vec![0, 1]);
    }
}
