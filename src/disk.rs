//! Disk provisioner: derives instance disks from templates and moves them
//! between the active and suspended areas.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Provisioning;
use crate::error::MoxError;
use crate::paths::Layout;
use crate::qcow2;
use crate::registry::InstanceRegistry;
use crate::template::{DiskFormat, Template};
use crate::util::{GIB, gb_to_bytes};
use crate::vm_state::StorageArea;

/// Reports bytes available to unprivileged writers on the filesystem holding `path`.
pub type FreeSpaceProbe = Arc<dyn Fn(&Path) -> Result<u64, MoxError> + Send + Sync>;

pub struct DiskProvisioner {
    layout: Layout,
    mode: Provisioning,
    free_space: FreeSpaceProbe,
}

impl DiskProvisioner {
    pub fn new(layout: Layout, mode: Provisioning) -> Self {
        Self {
            layout,
            mode,
            free_space: Arc::new(available_bytes),
        }
    }

    /// Replace the free-space probe.
    pub fn with_free_space(mut self, probe: FreeSpaceProbe) -> Self {
        self.free_space = probe;
        self
    }

    /// Create `active/<instance>.<ext>` from `template`, grown to `size_gb`.
    pub async fn provision(
        &self,
        template: &Template,
        instance: &str,
        size_gb: u64,
    ) -> Result<PathBuf, MoxError> {
        let required = gb_to_bytes(size_gb)?;
        if size_gb < template.disk_gb {
            return Err(MoxError::DiskTooSmall {
                requested_gb: size_gb,
                minimum_gb: template.disk_gb,
            });
        }
        if let Some(existing) = self.find_disk(instance) {
            return Err(MoxError::DiskExists {
                path: existing.display().to_string(),
            });
        }

        let area = self.layout.area_dir(StorageArea::Active);
        tokio::fs::create_dir_all(&area)
            .await
            .map_err(|e| MoxError::io(format!("creating directory {}", area.display()), e))?;

        let available = (self.free_space)(&area)?;
        if available < required {
            return Err(MoxError::InsufficientSpace {
                path: area.display().to_string(),
                required_gb: size_gb,
                available_gb: available / GIB,
            });
        }

        let (format, build) = match self.mode {
            Provisioning::Overlay => (DiskFormat::Qcow2, Build::Overlay),
            Provisioning::Copy => (template.format, Build::Copy),
        };
        let disk = self
            .layout
            .disk_path(StorageArea::Active, instance, format.extension());
        let partial = partial_path(&disk);

        let result = async {
            match build {
                Build::Copy => copy_template(&template.disk, &partial).await?,
                Build::Overlay => create_overlay(template, &partial).await?,
            }
            resize(&partial, format, size_gb).await?;
            rename(&partial, &disk).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tracing::info!(
            instance,
            template = %template.name,
            disk = %disk.display(),
            size_gb,
            mode = ?self.mode,
            "disk provisioned"
        );
        Ok(disk)
    }

    /// Move `disk` into `to`. A disk already in `to` is returned unchanged.
    ///
    /// `disk` may be stale in either direction after an interrupted flow: it
    /// can name the source of a move that already happened, or name the
    /// destination of a move that never did. Both are finished here.
    pub async fn relocate(&self, disk: &Path, to: StorageArea) -> Result<PathBuf, MoxError> {
        let file_name = disk.file_name().ok_or_else(|| MoxError::Validation {
            message: format!("disk path {} has no file name", disk.display()),
        })?;
        let dest = self.layout.area_dir(to).join(file_name);

        let source = if self.layout.area_of(disk) == Some(to) {
            if disk.exists() {
                return Ok(disk.to_path_buf());
            }
            self.layout.area_dir(to.other()).join(file_name)
        } else {
            disk.to_path_buf()
        };
        let disk = source.as_path();

        if !disk.exists() {
            if dest.exists() {
                // A previous relocation got as far as the rename.
                tracing::debug!(disk = %dest.display(), "disk already relocated");
                return Ok(dest);
            }
            return Err(MoxError::NotFound {
                kind: "disk",
                name: dest.display().to_string(),
            });
        }
        if dest.exists() {
            return Err(MoxError::DiskExists {
                path: dest.display().to_string(),
            });
        }
        let dest_dir = self.layout.area_dir(to);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| MoxError::io(format!("creating directory {}", dest_dir.display()), e))?;

        match tokio::fs::rename(disk, &dest).await {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                tracing::debug!(
                    from = %disk.display(),
                    to = %dest.display(),
                    "areas on different filesystems, copying"
                );
                copy_across(disk, &dest).await?;
            }
            Err(e) => {
                return Err(MoxError::io(
                    format!("moving {} to {}", disk.display(), dest.display()),
                    e,
                ));
            }
        }

        tracing::info!(from = %disk.display(), to = %dest.display(), area = %to, "disk relocated");
        Ok(dest)
    }

    /// Delete `disk`. Refused while a live instance record still points at it.
    pub async fn destroy(&self, disk: &Path, instances: &InstanceRegistry) -> Result<(), MoxError> {
        if let Some(owner) = instances.find_by_disk(disk).await? {
            return Err(MoxError::DiskInUse {
                path: disk.display().to_string(),
                instance: owner.name,
            });
        }
        match tokio::fs::remove_file(disk).await {
            Ok(()) => {
                tracing::info!(disk = %disk.display(), "disk destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(disk = %disk.display(), "disk already gone");
                Ok(())
            }
            Err(e) => Err(MoxError::io(format!("removing {}", disk.display()), e)),
        }
    }

    /// Where the disk for `instance` currently lives, searching both areas.
    pub fn find_disk(&self, instance: &str) -> Option<PathBuf> {
        [StorageArea::Active, StorageArea::Suspended]
            .into_iter()
            .flat_map(|area| {
                [DiskFormat::Qcow2, DiskFormat::Raw]
                    .map(|f| self.layout.disk_path(area, instance, f.extension()))
            })
            .find(|p| p.exists())
    }
}

#[derive(Debug, Clone, Copy)]
enum Build {
    Copy,
    Overlay,
}

/// Grow `disk` to `size_gb`. Never shrinks.
pub async fn resize(disk: &Path, format: DiskFormat, size_gb: u64) -> Result<(), MoxError> {
    let target = gb_to_bytes(size_gb)?;
    let current = qcow2::virtual_size(disk)?;
    if target <= current {
        return Ok(());
    }

    match format {
        DiskFormat::Raw => {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(disk)
                .map_err(|e| MoxError::io(format!("opening {}", disk.display()), e))?;
            file.set_len(target)
                .map_err(|e| MoxError::io(format!("extending {}", disk.display()), e))?;
        }
        DiskFormat::Qcow2 => {
            if !qcow2::grow_in_place(disk, target)? {
                let size = format!("{size_gb}G");
                qemu_img(&[
                    OsStr::new("resize"),
                    OsStr::new("-f"),
                    OsStr::new("qcow2"),
                    disk.as_os_str(),
                    OsStr::new(&size),
                ])
                .await?;
            }
        }
    }

    tracing::debug!(disk = %disk.display(), from = current, to = target, "disk grown");
    Ok(())
}

async fn copy_template(source: &Path, dest: &Path) -> Result<(), MoxError> {
    tokio::fs::copy(source, dest).await.map_err(|e| {
        MoxError::io(
            format!("copying {} to {}", source.display(), dest.display()),
            e,
        )
    })?;

    // Templates are read-only; the copy must not inherit that.
    let mut perms = tokio::fs::metadata(dest)
        .await
        .map_err(|e| MoxError::io(format!("reading metadata of {}", dest.display()), e))?
        .permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    tokio::fs::set_permissions(dest, perms)
        .await
        .map_err(|e| MoxError::io(format!("making {} writable", dest.display()), e))
}

async fn create_overlay(template: &Template, overlay: &Path) -> Result<(), MoxError> {
    qemu_img(&[
        OsStr::new("create"),
        OsStr::new("-f"),
        OsStr::new("qcow2"),
        OsStr::new("-b"),
        template.disk.as_os_str(),
        OsStr::new("-F"),
        OsStr::new(template.format.driver()),
        overlay.as_os_str(),
    ])
    .await?;
    tracing::debug!(path = %overlay.display(), base = %template.disk.display(), "created qcow2 overlay");
    Ok(())
}

async fn qemu_img(args: &[&OsStr]) -> Result<(), MoxError> {
    let output = tokio::process::Command::new("qemu-img")
        .args(args)
        .output()
        .await
        .map_err(|e| MoxError::io("running qemu-img", e))?;

    if !output.status.success() {
        return Err(MoxError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Cross-filesystem move: copy to a temporary name beside `dest`, fsync,
/// verify, rename into place, and only then remove `src`.
async fn copy_across(src: &Path, dest: &Path) -> Result<(), MoxError> {
    let partial = partial_path(dest);
    let result = async {
        let copied = tokio::fs::copy(src, &partial).await.map_err(|e| {
            MoxError::io(
                format!("copying {} to {}", src.display(), partial.display()),
                e,
            )
        })?;
        let file = tokio::fs::File::open(&partial)
            .await
            .map_err(|e| MoxError::io(format!("opening {}", partial.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| MoxError::io(format!("syncing {}", partial.display()), e))?;

        let expected = tokio::fs::metadata(src)
            .await
            .map_err(|e| MoxError::io(format!("reading metadata of {}", src.display()), e))?
            .len();
        let written = file
            .metadata()
            .await
            .map_err(|e| MoxError::io(format!("reading metadata of {}", partial.display()), e))?
            .len();
        if copied != expected || written != expected {
            return Err(MoxError::Validation {
                message: format!(
                    "copy of {} is {written} bytes, expected {expected}",
                    src.display()
                ),
            });
        }
        rename(&partial, dest).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }

    tokio::fs::remove_file(src)
        .await
        .map_err(|e| MoxError::io(format!("removing {}", src.display()), e))
}

async fn rename(from: &Path, to: &Path) -> Result<(), MoxError> {
    tokio::fs::rename(from, to).await.map_err(|e| {
        MoxError::io(
            format!("renaming {} to {}", from.display(), to.display()),
            e,
        )
    })
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.partial"))
}

/// Free bytes on the filesystem holding `path`, via `statvfs`.
pub fn available_bytes(path: &Path) -> Result<u64, MoxError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| MoxError::Validation {
        message: format!("path {} contains a NUL byte", path.display()),
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(MoxError::io(
            format!("querying free space of {}", path.display()),
            std::io::Error::last_os_error(),
        ));
    }
    #[allow(clippy::unnecessary_cast)]
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}
