// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use cachemon_util::{append_one_line, read_one_line};

use crate::error::Fault;
use crate::locate::{self, Pid};
use crate::schemata::Schemata;

/// Handle on the kernel resctrl filesystem. The class namespace is
/// kernel-global; this program assumes exclusive ownership of the
/// class names it creates.
#[derive(Debug, Clone)]
pub struct Resctrl {
    root: PathBuf,
}

impl Resctrl {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cbm_mask_path(&self) -> PathBuf {
        self.root.join("info/L3/cbm_mask")
    }

    fn class_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn schemata_path(&self, class: Option<&str>) -> PathBuf {
        match class {
            Some(name) => self.class_dir(name).join("schemata"),
            None => self.root.join("schemata"),
        }
    }

    pub fn class_exists(&self, name: &str) -> bool {
        self.class_dir(name).is_dir()
    }

    /// Idempotent class creation. A failed mkdir is retried once; the
    /// second failure is fatal.
    pub fn create_class(&self, name: &str) -> Result<()> {
        let dir = self.class_dir(name);
        if dir.is_dir() {
            debug!("class: {:?} already exists", name);
            return Ok(());
        }
        if let Err(first) = fs::create_dir(&dir) {
            warn!("class: mkdir {:?} failed ({}), retrying once", &dir, &first);
            fs::create_dir(&dir).map_err(|e| {
                Fault::ResourceClass(format!("creating {:?} ({})", &dir, e))
            })?;
        }
        info!("class: created {:?}", name);
        Ok(())
    }

    pub fn write_schemata(&self, name: &str, sch: &Schemata) -> Result<()> {
        sch.validate()?;
        let path = self.schemata_path(Some(name));
        let doc = sch.format();
        debug!("class: writing {:?}:\n{}", &path, doc.trim_end());
        fs::write(&path, &doc)
            .map_err(|e| Fault::ResourceClass(format!("writing {:?} ({})", &path, e)))?;
        Ok(())
    }

    pub fn read_schemata(&self, name: &str) -> Result<Schemata> {
        self.read_schemata_at(Some(name))
    }

    pub fn read_root_schemata(&self) -> Result<Schemata> {
        self.read_schemata_at(None)
    }

    fn read_schemata_at(&self, class: Option<&str>) -> Result<Schemata> {
        let path = self.schemata_path(class);
        let doc = fs::read_to_string(&path)
            .map_err(|e| Fault::Configuration(format!("reading {:?} ({})", &path, e)))?;
        Schemata::parse(&doc)
    }

    /// Assign every thread of `pid` to the class. The kernel silently
    /// moves a task out of whichever class held it before.
    pub fn add_member(&self, name: &str, pid: Pid) -> Result<()> {
        self.append_tasks(&self.class_dir(name).join("tasks"), pid)
    }

    /// Reclaim every thread of `pid` into the default class.
    pub fn drain_member(&self, pid: Pid) -> Result<()> {
        self.append_tasks(&self.root.join("tasks"), pid)
    }

    fn append_tasks(&self, path: &Path, pid: Pid) -> Result<()> {
        for tid in locate::tids_of(pid)? {
            append_one_line(path, &format!("{}", tid)).map_err(|e| {
                Fault::ResourceClass(format!("appending {} to {:?} ({})", tid, path, e))
            })?;
        }
        Ok(())
    }

    /// Destroy a class. Destroying a missing class is an error, never
    /// silently ignored. resctrl rmdirs a class directory with its
    /// virtual files still in place; a plain directory needs its
    /// contents unlinked first, hence the recursive fallback.
    pub fn destroy_class(&self, name: &str) -> Result<()> {
        let dir = self.class_dir(name);
        if let Err(e) = fs::remove_dir(&dir).or_else(|_| fs::remove_dir_all(&dir)) {
            if let Some(tid) = self.first_task(name) {
                warn!("class: {:?} still holds task {}", name, tid);
            }
            return Err(Fault::ResourceClass(format!("removing {:?} ({})", &dir, e)).into());
        }
        info!("class: destroyed {:?}", name);
        Ok(())
    }

    /// First line of the class's tasks list, for destroy diagnostics.
    fn first_task(&self, name: &str) -> Option<String> {
        read_one_line(self.class_dir(name).join("tasks")).ok()
    }
}

/// Owns one created class and the PIDs bound into it. The success path
/// calls release() so errors propagate; the drop path performs the
/// same drain-and-destroy best-effort so an unwinding phase still
/// leaves no kernel state behind.
pub struct ClassGuard<'a> {
    fs: &'a Resctrl,
    name: String,
    members: Vec<Pid>,
    released: bool,
}

impl<'a> ClassGuard<'a> {
    pub fn create(fs: &'a Resctrl, name: &str) -> Result<Self> {
        fs.create_class(name)?;
        Ok(Self {
            fs,
            name: name.to_string(),
            members: Vec::new(),
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_schemata(&self, sch: &Schemata) -> Result<()> {
        self.fs.write_schemata(&self.name, sch)
    }

    pub fn add_member(&mut self, pid: Pid) -> Result<()> {
        self.fs.add_member(&self.name, pid)?;
        self.members.push(pid);
        info!("class: bound PID {} to {:?}", pid, &self.name);
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        for pid in std::mem::take(&mut self.members) {
            self.fs.drain_member(pid)?;
            info!("class: returned PID {} to the default class", pid);
        }
        self.fs.destroy_class(&self.name)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.teardown()
    }
}

impl<'a> Drop for ClassGuard<'a> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("class: unwinding {:?}", &self.name);
        if let Err(e) = self.teardown() {
            error!("class: failed to unwind {:?} ({:#})", &self.name, &e);
        }
    }
}
