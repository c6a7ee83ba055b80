//! Destroy flow: force-stop, undefine, mark `Destroyed`, remove the disk,
//! drop the record.

use super::{Orchestrator, hypervisor};
use crate::error::MoxError;
use crate::gateway::{DomainState, Gateway, GatewayError};
use crate::vm_state::VmState;

impl<G: Gateway> Orchestrator<G> {
    /// Allowed from any stable state, flagged or not. A record left in
    /// `Destroyed` by an earlier failed attempt picks up at disk removal.
    pub async fn destroy(&self, name: &str) -> Result<(), MoxError> {
        let _guard = self.lock(name).await?;
        let mut instance = self.instances.get(name).await?;

        if !instance.state.can_destroy() {
            return Err(MoxError::InvalidTransition {
                name: name.to_string(),
                state: instance.state,
                operation: "destroy",
            });
        }

        if instance.state != VmState::Destroyed {
            self.tear_down_domain(name).await?;
            self.persist(&mut instance, VmState::Destroyed).await?;
        }

        self.disks.destroy(instance.disk(), &self.instances).await?;
        self.instances.delete(name).await?;
        tracing::info!(instance = name, "instance destroyed");
        Ok(())
    }

    async fn tear_down_domain(&self, name: &str) -> Result<(), MoxError> {
        let state = match self.gateway.domain_state(name).await {
            Ok(state) => state,
            Err(GatewayError::NotFound { .. }) => {
                tracing::debug!(instance = name, "no domain to remove");
                return Ok(());
            }
            Err(e) => return Err(hypervisor(name)(e)),
        };

        if matches!(state, DomainState::Running | DomainState::Paused | DomainState::Other) {
            match self.gateway.force_stop(name).await {
                Ok(()) | Err(GatewayError::AlreadyInState { .. }) => {}
                Err(e) => return Err(hypervisor(name)(e)),
            }
        }

        match self.gateway.undefine_domain(name).await {
            Ok(()) | Err(GatewayError::NotFound { .. }) => Ok(()),
            Err(e) => Err(hypervisor(name)(e)),
        }
    }
}
