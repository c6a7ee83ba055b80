//! Template registry: golden disk images kept under `<base>/templates`.
//!
//! Each template is a directory holding the source disk and a small YAML
//! metadata file:
//!
//! ```text
//! templates/ubuntu/ubuntu.qcow2
//! templates/ubuntu/ubuntu.yaml
//! ```
//!
//! Registration also creates the file and key directories described in
//! [`crate::template_files`].
//!
//! The tree is scanned once and cached; templates change rarely and callers
//! only need additions and removals to show up after a `refresh`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use facet::Facet;

use crate::config::validate_name;
use crate::error::MoxError;
use crate::group::GroupRegistry;
use crate::paths::Layout;
use crate::qcow2;
use crate::registry::InstanceRegistry;
use crate::template_files::template_subdirs;
use crate::util::{gb_ceil, gb_to_bytes};

/// On-disk format of an image, detected from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn detect(path: &Path) -> Result<Self, MoxError> {
        Ok(match qcow2::read_header(path)? {
            Some(_) => DiskFormat::Qcow2,
            None => DiskFormat::Raw,
        })
    }

    pub fn extension(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "img",
        }
    }

    /// Driver type as libvirt spells it.
    pub fn driver(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }

    pub fn from_extension(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("qcow2") => DiskFormat::Qcow2,
            _ => DiskFormat::Raw,
        }
    }
}

/// Contents of `<name>.yaml`.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct TemplateMetadata {
    #[facet(default)]
    pub os: Option<String>,
    #[facet(default)]
    pub cpus: Option<u32>,
    #[facet(default)]
    pub memory_mb: Option<u64>,
    /// Minimum instance disk size. Defaults to the image's virtual size.
    #[facet(default)]
    pub disk_gb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    /// Source disk. Never written to after registration.
    pub disk: PathBuf,
    pub format: DiskFormat,
    pub os: Option<String>,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    /// Smallest disk an instance of this template may have.
    pub disk_gb: u64,
}

pub struct TemplateRegistry {
    layout: Layout,
    cache: RwLock<BTreeMap<String, Template>>,
}

impl TemplateRegistry {
    /// Scan the templates tree and cache what is found.
    pub fn scan(layout: Layout) -> Result<Self, MoxError> {
        let registry = Self {
            layout,
            cache: RwLock::new(BTreeMap::new()),
        };
        registry.refresh()?;
        Ok(registry)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Rescan the templates tree, replacing the cache.
    pub fn refresh(&self) -> Result<usize, MoxError> {
        let dir = self.layout.templates_dir();
        let mut found = BTreeMap::new();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %dir.display(), "no templates directory");
                *self.cache.write().unwrap_or_else(|p| p.into_inner()) = found;
                return Ok(0);
            }
            Err(e) => return Err(MoxError::io(format!("reading {}", dir.display()), e)),
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if !entry.path().is_dir() {
                continue;
            }
            match self.load(&name) {
                Ok(template) => {
                    found.insert(name, template);
                }
                Err(e) => tracing::warn!(template = %name, "skipping template: {e}"),
            }
        }

        let count = found.len();
        *self.cache.write().unwrap_or_else(|p| p.into_inner()) = found;
        tracing::debug!(count, "template registry refreshed");
        Ok(count)
    }

    fn load(&self, name: &str) -> Result<Template, MoxError> {
        let dir = self.layout.template_dir(name);
        let disk = ["qcow2", "img"]
            .iter()
            .map(|ext| dir.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| MoxError::Validation {
                message: format!("template '{name}' is missing its disk image"),
            })?;

        let meta_path = self.layout.template_metadata(name);
        let contents = std::fs::read_to_string(&meta_path).map_err(|source| {
            MoxError::ConfigLoad {
                path: meta_path.display().to_string(),
                source,
            }
        })?;
        let meta: TemplateMetadata = if contents.trim().is_empty() {
            TemplateMetadata::default()
        } else {
            facet_yaml::from_str(&contents).map_err(|e| MoxError::ConfigParse {
                path: meta_path.display().to_string(),
                message: e.to_string(),
            })?
        };

        let format = DiskFormat::detect(&disk)?;
        let disk_gb = match meta.disk_gb {
            Some(gb) => gb,
            None => gb_ceil(qcow2::virtual_size(&disk)?).max(1),
        };

        Ok(Template {
            name: name.to_string(),
            disk,
            format,
            os: meta.os,
            cpus: meta.cpus,
            memory_mb: meta.memory_mb,
            disk_gb,
        })
    }

    pub fn resolve(&self, name: &str) -> Result<Template, MoxError> {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| MoxError::NotFound {
                kind: "template",
                name: name.to_string(),
            })
    }

    pub fn list(&self) -> Vec<Template> {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Copy an existing disk image in as a new template.
    pub async fn import(
        &self,
        name: &str,
        source: &Path,
        meta: TemplateMetadata,
    ) -> Result<Template, MoxError> {
        validate_name(name)?;
        if !source.is_file() {
            return Err(MoxError::NotFound {
                kind: "disk image",
                name: source.display().to_string(),
            });
        }
        let format = DiskFormat::detect(source)?;
        let dir = self.claim_dir(name)?;
        let disk = dir.join(format!("{name}.{}", format.extension()));

        let result = async {
            tokio::fs::copy(source, &disk).await.map_err(|e| {
                MoxError::io(
                    format!("copying {} to {}", source.display(), disk.display()),
                    e,
                )
            })?;
            self.finish_registration(name, &disk, &meta)
        }
        .await;

        self.settle(name, &dir, result)
    }

    /// Register an empty qcow2 image of `size_gb` as a new template.
    pub fn create_blank(
        &self,
        name: &str,
        size_gb: u64,
        meta: TemplateMetadata,
    ) -> Result<Template, MoxError> {
        validate_name(name)?;
        let bytes = gb_to_bytes(size_gb)?;
        let dir = self.claim_dir(name)?;
        let disk = dir.join(format!("{name}.qcow2"));
        let result = qcow2::create_qcow2(&disk, bytes)
            .and_then(|()| self.finish_registration(name, &disk, &meta));
        self.settle(name, &dir, result)
    }

    /// Delete a template. Refused while any instance still derives from it
    /// or any group still mirrors it.
    pub async fn remove(
        &self,
        name: &str,
        instances: &InstanceRegistry,
        groups: &GroupRegistry,
    ) -> Result<(), MoxError> {
        self.resolve(name)?;
        let users: Vec<String> = instances
            .find_by_template(name)
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();
        if !users.is_empty() {
            return Err(MoxError::TemplateInUse {
                name: name.to_string(),
                instances: users,
            });
        }
        let grouped = groups.containing(name)?;
        if !grouped.is_empty() {
            return Err(MoxError::TemplateGrouped {
                name: name.to_string(),
                groups: grouped,
            });
        }

        let dir = self.layout.template_dir(name);
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| MoxError::io(format!("removing {}", dir.display()), e))?;
        self.cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        tracing::info!(template = name, "template removed");
        Ok(())
    }

    fn claim_dir(&self, name: &str) -> Result<PathBuf, MoxError> {
        let dir = self.layout.template_dir(name);
        std::fs::create_dir_all(self.layout.templates_dir()).map_err(|e| {
            MoxError::io(
                format!("creating {}", self.layout.templates_dir().display()),
                e,
            )
        })?;
        match std::fs::create_dir(&dir) {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(MoxError::NameTaken {
                kind: "template",
                name: name.to_string(),
            }),
            Err(e) => Err(MoxError::io(format!("creating {}", dir.display()), e)),
        }
    }

    fn finish_registration(
        &self,
        name: &str,
        disk: &Path,
        meta: &TemplateMetadata,
    ) -> Result<Template, MoxError> {
        let meta_path = self.layout.template_metadata(name);
        let yaml = facet_yaml::to_string(meta).map_err(|e| MoxError::Validation {
            message: format!("serializing template metadata: {e}"),
        })?;
        std::fs::write(&meta_path, yaml)
            .map_err(|e| MoxError::io(format!("writing {}", meta_path.display()), e))?;
        let dir = self.layout.template_dir(name);
        for sub in template_subdirs() {
            let path = dir.join(sub);
            std::fs::create_dir_all(&path)
                .map_err(|e| MoxError::io(format!("creating directory {}", path.display()), e))?;
        }

        // Templates are immutable once registered.
        let mut perms = std::fs::metadata(disk)
            .map_err(|e| MoxError::io(format!("reading metadata of {}", disk.display()), e))?
            .permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(disk, perms)
            .map_err(|e| MoxError::io(format!("marking {} read-only", disk.display()), e))?;

        self.load(name)
    }

    fn settle(
        &self,
        name: &str,
        dir: &Path,
        result: Result<Template, MoxError>,
    ) -> Result<Template, MoxError> {
        match result {
            Ok(template) => {
                self.cache
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(name.to_string(), template.clone());
                tracing::info!(
                    template = name,
                    disk = %template.disk.display(),
                    disk_gb = template.disk_gb,
                    "template registered"
                );
                Ok(template)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(dir);
                Err(e)
            }
        }
    }
}
