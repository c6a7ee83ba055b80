//! Instance registry: one JSON record per managed instance under
//! `<base>/instances`.
//!
//! This is the source of truth for what mockmox manages. Every `put` is
//! durable before it returns: the record is written to a uniquely named
//! temporary file, fsynced, renamed over the old record and the directory
//! is fsynced.
//! Records for different instances live in different files, so writers
//! never contend; writes to the same instance are serialized by the caller.

use std::io::Write;
use std::path::{Path, PathBuf};


use crate::error::MoxError;
use crate::instance::Instance;
use crate::paths::Layout;
use crate::vm_state::VmState;

pub struct InstanceRegistry {
    dir: PathBuf,
    layout: Layout,
}

impl InstanceRegistry {
    pub fn open(layout: Layout) -> Result<Self, MoxError> {
        let dir = layout.instances_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| MoxError::io(format!("creating directory {}", dir.display()), e))?;
        Ok(Self { dir, layout })
    }

    /// Look up an instance, `None` when there is no record.
    pub async fn find(&self, name: &str) -> Result<Option<Instance>, MoxError> {
        let path = self.layout.instance_record(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_record(&path, &contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MoxError::io(format!("reading {}", path.display()), e)),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Instance, MoxError> {
        self.find(name).await?.ok_or_else(|| MoxError::NotFound {
            kind: "instance",
            name: name.to_string(),
        })
    }

    /// Durably write the record for `instance.name`.
    pub async fn put(&self, instance: &Instance) -> Result<(), MoxError> {
        let path = self.layout.instance_record(&instance.name);
        let dir = self.dir.clone();
        let json = facet_json::to_string(instance).expect("serializing instance record");

        tokio::task::spawn_blocking(move || write_record(&dir, &path, json.as_bytes()))
            .await
            .map_err(|e| MoxError::io("writing registry record", std::io::Error::other(e)))??;

        tracing::trace!(instance = %instance.name, state = %instance.state, "record written");
        Ok(())
    }

    /// Remove the record for `name`. Fails with `NotFound` when there is none.
    pub async fn delete(&self, name: &str) -> Result<(), MoxError> {
        let path = self.layout.instance_record(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => sync_dir(&self.dir).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MoxError::NotFound {
                kind: "instance",
                name: name.to_string(),
            }),
            Err(e) => Err(MoxError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// All readable records, sorted by name. Unreadable records are logged and skipped.
    pub async fn list(&self) -> Result<Vec<Instance>, MoxError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| MoxError::io(format!("reading {}", self.dir.display()), e))?;

        let mut instances = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MoxError::io(format!("reading {}", self.dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable record: {e}");
                    continue;
                }
            };
            match parse_record(&path, &contents) {
                Ok(instance) => instances.push(instance),
                Err(e) => tracing::warn!("{e}"),
            }
        }

        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    /// The live instance (anything not yet `Destroyed`) whose disk is `disk`.
    pub async fn find_by_disk(&self, disk: &Path) -> Result<Option<Instance>, MoxError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|i| i.state != VmState::Destroyed && i.disk() == disk))
    }

    pub async fn find_by_template(&self, template: &str) -> Result<Vec<Instance>, MoxError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.template == template)
            .collect())
    }
}

fn parse_record(path: &Path, contents: &str) -> Result<Instance, MoxError> {
    facet_json::from_str(contents).map_err(|e| MoxError::RecordCorrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Each write gets its own temp file, so concurrent writers of one record
/// never share a half-written file. The last rename wins.
fn write_record(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), MoxError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".record-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| MoxError::io(format!("creating temp record in {}", dir.display()), e))?;
    let tmp_path = tmp.path().to_path_buf();
    let io_err = |what: &str, e| MoxError::io(format!("{what} {}", tmp_path.display()), e);
    tmp.write_all(bytes).map_err(|e| io_err("writing", e))?;
    tmp.as_file().sync_all().map_err(|e| io_err("syncing", e))?;

    tmp.persist(path)
        .map_err(|e| MoxError::io(format!("replacing {}", path.display()), e.error))?;
    std::fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|e| MoxError::io(format!("syncing {}", dir.display()), e))
}

async fn sync_dir(dir: &Path) -> Result<(), MoxError> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| MoxError::io(format!("opening {}", dir.display()), e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| MoxError::io(format!("syncing {}", dir.display()), e))
}
