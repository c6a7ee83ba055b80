//! Stop flow: `Running → Stopping → Stopped`.
//!
//! ACPI shutdown first, then poll the domain until the configured timeout
//! runs out, then pull the plug.

use std::time::Duration;

use super::{Orchestrator, hypervisor, require};
use crate::error::MoxError;
use crate::gateway::{DomainState, Gateway, GatewayError};
use crate::instance::Instance;
use crate::vm_state::VmState;

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl<G: Gateway> Orchestrator<G> {
    pub async fn stop(&self, name: &str) -> Result<Instance, MoxError> {
        let _guard = self.lock(name).await?;
        let mut instance = self.load(name).await?;

        if instance.state == VmState::Stopped {
            return Err(MoxError::AlreadyInState {
                name: name.to_string(),
                state: instance.state,
            });
        }
        require(&instance, "stop", VmState::can_stop)?;

        self.persist(&mut instance, VmState::Stopping).await?;

        if let Err(e) = self.shut_down(name).await {
            return Err(self.revert(&mut instance, VmState::Running, e).await);
        }

        self.persist(&mut instance, VmState::Stopped).await?;
        Ok(instance)
    }

    async fn shut_down(&self, name: &str) -> Result<(), MoxError> {
        match self.gateway.graceful_shutdown(name).await {
            Ok(()) => {}
            Err(GatewayError::AlreadyInState { .. }) => {
                tracing::debug!(instance = name, "domain already off");
                return Ok(());
            }
            Err(GatewayError::Rejected { message }) => {
                tracing::warn!(instance = name, "ACPI shutdown refused: {message}");
                return self.force_off(name).await;
            }
            Err(e) => return Err(hypervisor(name)(e)),
        }

        let timeout = self.config.shutdown_timeout();
        if self.wait_for_shutoff(name, timeout).await? {
            return Ok(());
        }

        let timed_out = MoxError::Timeout {
            operation: "graceful shutdown",
            name: name.to_string(),
            secs: timeout.as_secs(),
        };
        tracing::warn!(instance = name, "{timed_out}, forcing");
        self.force_off(name).await
    }

    async fn force_off(&self, name: &str) -> Result<(), MoxError> {
        match self.gateway.force_stop(name).await {
            Ok(()) | Err(GatewayError::AlreadyInState { .. }) => Ok(()),
            Err(e) => Err(hypervisor(name)(e)),
        }
    }

    /// Poll until the domain is off. `false` when `timeout` runs out first.
    async fn wait_for_shutoff(&self, name: &str, timeout: Duration) -> Result<bool, MoxError> {
        let interval = (timeout / 10).clamp(Duration::from_millis(10), MAX_POLL_INTERVAL);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self
                .gateway
                .domain_state(name)
                .await
                .map_err(hypervisor(name))?;
            if matches!(state, DomainState::Shutoff | DomainState::Saved) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
