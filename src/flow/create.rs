//! Create flow: provision a disk from a template and register the instance
//! as `Defined`. The hypervisor is not touched until the first start.

use super::Orchestrator;
use crate::config::validate_name;
use crate::error::MoxError;
use crate::gateway::Gateway;
use crate::instance::{Instance, unix_now};
use crate::vm_state::VmState;

/// Sizing left as `None` falls back to the template's metadata, then to
/// `defaults.*` in the config.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub template: String,
    pub name: String,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

impl CreateRequest {
    pub fn new(template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

impl<G: Gateway> Orchestrator<G> {
    pub async fn create(&self, req: CreateRequest) -> Result<Instance, MoxError> {
        validate_name(&req.name)?;
        let name = req.name.as_str();
        let _guard = self.lock(name).await?;

        if self.instances.find(name).await?.is_some() {
            return Err(MoxError::NameTaken {
                kind: "instance",
                name: name.to_string(),
            });
        }
        let template = self.templates.resolve(&req.template)?;
        let defaults = &self.config.defaults;

        let cpus = req.cpus.or(template.cpus).unwrap_or(defaults.vm_cpus);
        let memory_mb = req
            .memory_mb
            .or(template.memory_mb)
            .unwrap_or(defaults.vm_memory);
        if cpus == 0 {
            return Err(MoxError::Validation {
                message: "an instance needs at least 1 CPU".into(),
            });
        }
        if memory_mb < 256 {
            return Err(MoxError::Validation {
                message: format!("{memory_mb} MB of memory is below the 256 MB minimum"),
            });
        }
        let disk_gb = req
            .disk_gb
            .unwrap_or_else(|| defaults.vm_disk_size.max(template.disk_gb));

        let disk = self.disks.provision(&template, name, disk_gb).await?;

        let now = unix_now();
        let instance = Instance {
            name: name.to_string(),
            template: template.name.clone(),
            disk_path: disk.display().to_string(),
            cpus,
            memory_mb,
            disk_gb,
            state: VmState::Defined,
            previous_state: None,
            inconsistent: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.instances.put(&instance).await {
            // Nothing references the disk yet.
            let _ = tokio::fs::remove_file(&disk).await;
            return Err(e);
        }

        tracing::info!(
            instance = name,
            template = %template.name,
            cpus,
            memory_mb,
            disk_gb,
            "instance created"
        );
        Ok(instance)
    }
}
