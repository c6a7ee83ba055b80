use std::path::{Path, PathBuf};

use crate::error::MoxError;
use crate::vm_state::StorageArea;

/// Directory layout under `directories.base_dir`.
///
/// ```text
/// <base>/templates/<name>/<name>.qcow2   golden images + <name>.yaml
/// <base>/active/<instance>.qcow2         disks of non-suspended instances
/// <base>/suspended/<instance>.qcow2      disks of suspended instances
/// <base>/instances/<instance>.json       instance registry
/// <base>/instances/<instance>.lock       held by whichever process runs a flow on it
/// <base>/groups/<group>/templates/<name>  group members, mirrored from templates/
/// <base>/logs/mockmox.log
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.base.join("templates")
    }

    pub fn template_dir(&self, name: &str) -> PathBuf {
        self.templates_dir().join(name)
    }

    pub fn template_metadata(&self, name: &str) -> PathBuf {
        self.template_dir(name).join(format!("{name}.yaml"))
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.base.join("groups")
    }

    pub fn group_dir(&self, name: &str) -> PathBuf {
        self.groups_dir().join(name)
    }

    pub fn area_dir(&self, area: StorageArea) -> PathBuf {
        self.base.join(area.dir_name())
    }

    /// Disk path for an instance in the given area. `ext` is `qcow2` or `img`.
    pub fn disk_path(&self, area: StorageArea, instance: &str, ext: &str) -> PathBuf {
        self.area_dir(area).join(format!("{instance}.{ext}"))
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.base.join("instances")
    }

    pub fn instance_record(&self, name: &str) -> PathBuf {
        self.instances_dir().join(format!("{name}.json"))
    }

    pub fn instance_lock(&self, name: &str) -> PathBuf {
        self.instances_dir().join(format!("{name}.lock"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Which area a disk path sits in, if any.
    pub fn area_of(&self, disk: &Path) -> Option<StorageArea> {
        let parent = disk.parent()?;
        [StorageArea::Active, StorageArea::Suspended]
            .into_iter()
            .find(|area| parent == self.area_dir(*area))
    }

    /// Create every directory of the layout. Safe to run repeatedly.
    pub fn ensure(&self) -> Result<(), MoxError> {
        for dir in [
            self.templates_dir(),
            self.area_dir(StorageArea::Active),
            self.area_dir(StorageArea::Suspended),
            self.instances_dir(),
            self.groups_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| MoxError::io(format!("creating directory {}", dir.display()), e))?;
        }
        Ok(())
    }
}
