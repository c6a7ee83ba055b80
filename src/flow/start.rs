//! Start flow: `Defined|Stopped → Starting → Running`.

use super::{Orchestrator, hypervisor, require};
use crate::error::MoxError;
use crate::gateway::{Gateway, GatewayError};
use crate::instance::Instance;
use crate::vm_state::VmState;

impl<G: Gateway> Orchestrator<G> {
    pub async fn start(&self, name: &str) -> Result<Instance, MoxError> {
        let _guard = self.lock(name).await?;
        let mut instance = self.load(name).await?;

        if instance.state == VmState::Running {
            return Err(MoxError::AlreadyInState {
                name: name.to_string(),
                state: instance.state,
            });
        }
        require(&instance, "start", VmState::can_start)?;
        let prior = instance.state;

        self.persist(&mut instance, VmState::Starting).await?;

        let spec = self.domain_spec(&instance);
        let booted: Result<(), GatewayError> = async {
            self.gateway.define_domain(&spec).await?;
            match self.gateway.start_domain(name).await {
                Err(GatewayError::AlreadyInState { message, .. }) => {
                    tracing::warn!(instance = name, "domain was already running: {message}");
                    Ok(())
                }
                other => other,
            }
        }
        .await;

        if let Err(e) = booted {
            return Err(self.revert(&mut instance, prior, hypervisor(name)(e)).await);
        }

        self.persist(&mut instance, VmState::Running).await?;
        Ok(instance)
    }
}
