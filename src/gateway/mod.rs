//! Hypervisor gateway: the narrow set of domain operations the state machine
//! needs, behind a trait so the orchestrator can run against libvirt or an
//! in-memory model.

#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod memory;

use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::HypervisorConfig;
use crate::instance::Instance;
use crate::template::DiskFormat;

#[cfg(feature = "libvirt")]
pub use self::libvirt::LibvirtGateway;
pub use self::memory::MemoryGateway;

/// Hypervisor failures, normalized across implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("hypervisor unreachable: {message}")]
    Unreachable { message: String },

    #[error("domain '{domain}' does not exist")]
    NotFound { domain: String },

    #[error("domain '{domain}' is already in the requested state: {message}")]
    AlreadyInState { domain: String, message: String },

    #[error("hypervisor rejected the request: {message}")]
    Rejected { message: String },
}

/// State of a domain as the hypervisor reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    Shutoff,
    /// Shut off with a managed save image waiting to be restored.
    Saved,
    Other,
}

impl DomainState {
    pub fn as_str(self) -> &'static str {
        match self {
            DomainState::Running => "running",
            DomainState::Paused => "paused",
            DomainState::Shutoff => "shutoff",
            DomainState::Saved => "saved",
            DomainState::Other => "other",
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub name: String,
    pub state: DomainState,
}

/// Everything needed to render a domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub disk: PathBuf,
    pub disk_format: DiskFormat,
    pub domain_type: String,
    pub machine: String,
    pub network: String,
}

impl DomainSpec {
    pub fn for_instance(instance: &Instance, hypervisor: &HypervisorConfig) -> Self {
        let disk = instance.disk().to_path_buf();
        Self {
            name: instance.name.clone(),
            memory_mb: instance.memory_mb,
            vcpus: instance.cpus,
            disk_format: DiskFormat::from_extension(&disk),
            disk,
            domain_type: hypervisor.domain_type.clone(),
            machine: hypervisor.machine.clone(),
            network: hypervisor.network.clone(),
        }
    }
}

/// Domain operations. Calls for one domain are never issued concurrently.
pub trait Gateway: Send + Sync {
    /// Create or replace the persistent definition of a domain.
    fn define_domain(&self, spec: &DomainSpec)
    -> impl Future<Output = Result<(), GatewayError>> + Send;

    fn start_domain(&self, name: &str) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Ask the guest to power off (ACPI). Returns once the request is sent.
    fn graceful_shutdown(&self, name: &str)
    -> impl Future<Output = Result<(), GatewayError>> + Send;

    fn force_stop(&self, name: &str) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Save guest memory to the hypervisor's managed save area and stop it.
    fn pause_and_save(&self, name: &str) -> impl Future<Output = Result<(), GatewayError>> + Send;

    fn restore_and_start(&self, name: &str)
    -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Remove the definition, discarding any saved state.
    fn undefine_domain(&self, name: &str)
    -> impl Future<Output = Result<(), GatewayError>> + Send;

    fn list_domains(&self) -> impl Future<Output = Result<Vec<DomainInfo>, GatewayError>> + Send;

    fn domain_state(&self, name: &str)
    -> impl Future<Output = Result<DomainState, GatewayError>> + Send;

    /// Guest addresses from the DHCP lease table.
    fn domain_addresses(&self, name: &str)
    -> impl Future<Output = Result<Vec<String>, GatewayError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::sample;

    #[test]
    fn spec_follows_instance_and_config() {
        let mut inst = sample("web");
        inst.disk_path = "/opt/mockmox/active/web.img".into();
        let spec = DomainSpec::for_instance(&inst, &HypervisorConfig::default());
        assert_eq!(spec.name, "web");
        assert_eq!(spec.vcpus, 2);
        assert_eq!(spec.memory_mb, 2048);
        assert_eq!(spec.disk_format, DiskFormat::Raw);
        assert_eq!(spec.domain_type, "kvm");
        assert_eq!(spec.network, "default");
    }
}
