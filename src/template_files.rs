//! Files and SSH keys carried by a template.
//!
//! Template disks are immutable, so anything an instance should receive on top
//! of the image is kept beside it instead:
//!
//! ```text
//! templates/ubuntu/user_files/        copied into the unprivileged user's home
//! templates/ubuntu/user_executables/
//! templates/ubuntu/root_files/
//! templates/ubuntu/root_executables/
//! templates/ubuntu/ssh_keys/<user>    one key per guest user, mode 0600
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::config::validate_name;
use crate::error::MoxError;
use crate::template::TemplateRegistry;

/// Guest account a file is meant for.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOwner {
    User,
    Root,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Executable,
}

impl FileOwner {
    pub fn as_str(self) -> &'static str {
        match self {
            FileOwner::User => "user",
            FileOwner::Root => "root",
        }
    }
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Executable => "executable",
        }
    }

    fn mode(self) -> u32 {
        match self {
            FileKind::File => 0o644,
            FileKind::Executable => 0o755,
        }
    }
}

pub const SSH_KEY_DIR: &str = "ssh_keys";

/// Every per-template directory, created when a template is registered.
pub fn template_subdirs() -> Vec<String> {
    let mut dirs: Vec<String> = [FileOwner::User, FileOwner::Root]
        .into_iter()
        .flat_map(|owner| {
            [FileKind::File, FileKind::Executable].map(|kind| files_dir_name(owner, kind))
        })
        .collect();
    dirs.push(SSH_KEY_DIR.to_string());
    dirs
}

fn files_dir_name(owner: FileOwner, kind: FileKind) -> String {
    format!("{}_{}s", owner.as_str(), kind.as_str())
}

/// A bare file name: no separators, no `.` or `..`.
fn plain_file_name(name: &str) -> Result<&str, MoxError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(MoxError::Validation {
            message: format!("'{name}' is not a plain file name"),
        });
    }
    Ok(name)
}

impl TemplateRegistry {
    fn files_dir(
        &self,
        template: &str,
        owner: FileOwner,
        kind: FileKind,
    ) -> Result<PathBuf, MoxError> {
        self.resolve(template)?;
        Ok(self
            .layout()
            .template_dir(template)
            .join(files_dir_name(owner, kind)))
    }

    fn ssh_key_dir(&self, template: &str) -> Result<PathBuf, MoxError> {
        self.resolve(template)?;
        Ok(self.layout().template_dir(template).join(SSH_KEY_DIR))
    }

    /// Copy `source` into the template, replacing a file of the same name.
    pub async fn add_file(
        &self,
        template: &str,
        source: &Path,
        owner: FileOwner,
        kind: FileKind,
    ) -> Result<PathBuf, MoxError> {
        let dir = self.files_dir(template, owner, kind)?;
        if !source.is_file() {
            return Err(MoxError::NotFound {
                kind: "file",
                name: source.display().to_string(),
            });
        }
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MoxError::Validation {
                message: format!("{} has no usable file name", source.display()),
            })?;
        let dest = dir.join(plain_file_name(name)?);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MoxError::io(format!("creating directory {}", dir.display()), e))?;
        tokio::fs::copy(source, &dest).await.map_err(|e| {
            MoxError::io(
                format!("copying {} to {}", source.display(), dest.display()),
                e,
            )
        })?;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(kind.mode()))
            .await
            .map_err(|e| MoxError::io(format!("setting mode of {}", dest.display()), e))?;

        tracing::info!(
            template,
            owner = owner.as_str(),
            kind = kind.as_str(),
            file = %dest.display(),
            "template file added"
        );
        Ok(dest)
    }

    pub async fn remove_file(
        &self,
        template: &str,
        name: &str,
        owner: FileOwner,
        kind: FileKind,
    ) -> Result<(), MoxError> {
        let path = self
            .files_dir(template, owner, kind)?
            .join(plain_file_name(name)?);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(template, file = %path.display(), "template file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MoxError::NotFound {
                kind: "template file",
                name: format!("{template}/{}/{name}", files_dir_name(owner, kind)),
            }),
            Err(e) => Err(MoxError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// Files of one owner and kind, sorted by name.
    pub async fn list_files(
        &self,
        template: &str,
        owner: FileOwner,
        kind: FileKind,
    ) -> Result<Vec<PathBuf>, MoxError> {
        let dir = self.files_dir(template, owner, kind)?;
        list_dir(&dir).await
    }

    /// Install `key` as the SSH key for guest user `user`, mode 0600.
    pub async fn add_ssh_key(
        &self,
        template: &str,
        key: &Path,
        user: &str,
    ) -> Result<PathBuf, MoxError> {
        validate_name(user)?;
        let dir = self.ssh_key_dir(template)?;
        if !key.is_file() {
            return Err(MoxError::NotFound {
                kind: "key file",
                name: key.display().to_string(),
            });
        }
        let dest = dir.join(user);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MoxError::io(format!("creating directory {}", dir.display()), e))?;
        tokio::fs::copy(key, &dest).await.map_err(|e| {
            MoxError::io(format!("copying {} to {}", key.display(), dest.display()), e)
        })?;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| MoxError::io(format!("setting mode of {}", dest.display()), e))?;
        tracing::info!(template, user, "ssh key added");
        Ok(dest)
    }

    pub async fn remove_ssh_key(&self, template: &str, user: &str) -> Result<(), MoxError> {
        validate_name(user)?;
        let path = self.ssh_key_dir(template)?.join(user);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(template, user, "ssh key removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MoxError::NotFound {
                kind: "ssh key",
                name: format!("{template}/{user}"),
            }),
            Err(e) => Err(MoxError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// Guest users with a key installed, sorted.
    pub async fn ssh_key_users(&self, template: &str) -> Result<Vec<String>, MoxError> {
        let dir = self.ssh_key_dir(template)?;
        Ok(list_dir(&dir)
            .await?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect())
    }
}

/// Regular files directly under `dir`. A missing directory is empty.
async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, MoxError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MoxError::io(format!("reading {}", dir.display()), e)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MoxError::io(format!("reading {}", dir.display()), e))?
    {
        if entry.path().is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
