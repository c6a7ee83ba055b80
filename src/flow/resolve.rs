//! Operator acknowledgement of an Inconsistent flag.

use super::{Orchestrator, hypervisor};
use crate::error::MoxError;
use crate::gateway::{DomainState, Gateway, GatewayError};
use crate::instance::Instance;
use crate::vm_state::{StorageArea, VmState};

impl<G: Gateway> Orchestrator<G> {
    /// Look at the live domain and where the disk actually is, settle the
    /// record on the state they imply and clear the flag. The flag stays
    /// when they still disagree.
    pub async fn resolve(&self, name: &str) -> Result<Instance, MoxError> {
        let _guard = self.lock(name).await?;
        let mut instance = self.instances.get(name).await?;
        if !instance.is_inconsistent() {
            tracing::info!(instance = name, "nothing to resolve");
            return Ok(instance);
        }

        let live = match self.gateway.domain_state(name).await {
            Ok(state) => Some(state),
            Err(GatewayError::NotFound { .. }) => None,
            Err(e) => return Err(hypervisor(name)(e)),
        };
        let refuse = |reason: String| MoxError::Inconsistent {
            name: name.to_string(),
            reason,
        };

        let Some(disk) = self.disks.find_disk(name) else {
            return Err(refuse("disk not found in either storage area".into()));
        };
        let area = self.layout.area_of(&disk);

        let (state, disk) = match (live, area) {
            (Some(DomainState::Running | DomainState::Paused), Some(StorageArea::Active)) => {
                (VmState::Running, disk)
            }
            (Some(DomainState::Saved), Some(StorageArea::Suspended)) => (VmState::Suspended, disk),
            (Some(DomainState::Saved), Some(StorageArea::Active)) => {
                let parked = self.disks.relocate(&disk, StorageArea::Suspended).await?;
                (VmState::Suspended, parked)
            }
            (Some(DomainState::Shutoff), Some(StorageArea::Active)) => (VmState::Stopped, disk),
            (None, Some(StorageArea::Active)) => (VmState::Defined, disk),
            (live, area) => {
                let live = live.map_or("absent", DomainState::as_str);
                let area = area.map_or("no".to_string(), |a| a.to_string());
                return Err(refuse(format!(
                    "domain is {live} while the disk is in the {area} area"
                )));
            }
        };

        let was = instance.inconsistent.take();
        instance.set_disk(disk);
        instance.transition(state);
        self.instances.put(&instance).await?;
        tracing::info!(
            instance = name,
            %state,
            was = was.as_deref().unwrap_or_default(),
            "inconsistency resolved"
        );
        Ok(instance)
    }
}
