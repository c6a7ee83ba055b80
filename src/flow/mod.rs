//! Lifecycle orchestration.
//!
//! Each command (create, start, stop, suspend, resume, destroy) is a separate
//! flow over one instance. A flow holds the instance's lock from before it
//! reads the record until after its last durable write. The lock is both an
//! in-process mutex and a `flock` on `instances/<name>.lock`, so separate
//! mockmox processes exclude each other too. A flow persists the
//! transitional state before touching the hypervisor, and on failure puts
//! the record back in the stable state it started from. The only exception
//! is the explicit Inconsistent flag, set when the hypervisor and the disk
//! areas can no longer be brought into agreement automatically.

pub mod create;
pub mod destroy;
pub mod reconcile;
pub mod resolve;
pub mod start;
pub mod stop;
pub mod suspend;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{Config, validate_name};
use crate::disk::DiskProvisioner;
use crate::error::MoxError;
use crate::gateway::{DomainSpec, Gateway, GatewayError};
use crate::instance::Instance;
use crate::lockfile::FileLock;
use crate::paths::Layout;
use crate::registry::InstanceRegistry;
use crate::template::TemplateRegistry;
use crate::vm_state::VmState;

pub use create::CreateRequest;
pub use reconcile::ReconcileReport;

/// Operations that can be undone with `compensate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Start,
    Stop,
    Suspend,
    Resume,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Suspend => "suspend",
            Operation::Resume => "resume",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Orchestrator<G: Gateway> {
    config: Config,
    layout: Layout,
    gateway: G,
    templates: TemplateRegistry,
    instances: InstanceRegistry,
    disks: DiskProvisioner,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<G: Gateway> Orchestrator<G> {
    pub fn new(config: Config, gateway: G) -> Result<Self, MoxError> {
        let layout = Layout::new(config.base_dir());
        layout.ensure()?;
        let templates = TemplateRegistry::scan(layout.clone())?;
        let instances = InstanceRegistry::open(layout.clone())?;
        let disks = DiskProvisioner::new(layout.clone(), config.provisioning());
        Ok(Self {
            config,
            layout,
            gateway,
            templates,
            instances,
            disks,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_disks(mut self, disks: DiskProvisioner) -> Self {
        self.disks = disks;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    pub fn disks(&self) -> &DiskProvisioner {
        &self.disks
    }

    pub async fn get(&self, name: &str) -> Result<Instance, MoxError> {
        self.instances.get(name).await
    }

    pub async fn list(&self) -> Result<Vec<Instance>, MoxError> {
        self.instances.list().await
    }

    /// Guest IP addresses of a running instance.
    pub async fn addresses(&self, name: &str) -> Result<Vec<String>, MoxError> {
        let instance = self.get(name).await?;
        require(&instance, "query addresses of", |s| s == VmState::Running)?;
        self.gateway
            .domain_addresses(name)
            .await
            .map_err(hypervisor(name))
    }

    /// Undo `op` on `name` by running its inverse. Waits for any transition
    /// in flight on the instance to settle first.
    pub async fn compensate(&self, name: &str, op: Operation) -> Result<(), MoxError> {
        tracing::info!(instance = name, %op, "compensating");
        match op {
            Operation::Create => self.destroy(name).await,
            Operation::Start => self.stop(name).await.map(drop),
            Operation::Stop => self.start(name).await.map(drop),
            Operation::Suspend => self.resume(name).await.map(drop),
            Operation::Resume => self.suspend(name).await.map(drop),
        }
    }

    /// Serialize flows per instance, across processes. Different names never
    /// wait on each other.
    async fn lock(&self, name: &str) -> Result<InstanceLock, MoxError> {
        validate_name(name)?;
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(name.to_string()).or_default().clone()
        };
        let local = lock.lock_owned().await;
        let file = FileLock::acquire_owned(self.layout.instance_lock(name)).await?;
        Ok(InstanceLock {
            _file: file,
            _local: local,
        })
    }

    /// Load a record for a flow that must not run on a flagged instance.
    async fn load(&self, name: &str) -> Result<Instance, MoxError> {
        let instance = self.instances.get(name).await?;
        if let Some(reason) = &instance.inconsistent {
            return Err(MoxError::Inconsistent {
                name: name.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(instance)
    }

    /// Move to `next` and make it durable.
    async fn persist(&self, instance: &mut Instance, next: VmState) -> Result<(), MoxError> {
        let from = instance.state;
        instance.transition(next);
        self.instances.put(instance).await?;
        tracing::info!(instance = %instance.name, %from, to = %next, "state changed");
        Ok(())
    }

    /// Put a failed flow's record back in `prior`, keeping `err` as the outcome.
    async fn revert(&self, instance: &mut Instance, prior: VmState, err: MoxError) -> MoxError {
        tracing::warn!(instance = %instance.name, to = %prior, "reverting: {err}");
        if let Err(put_err) = self.persist(instance, prior).await {
            tracing::error!(instance = %instance.name, "revert not recorded: {put_err}");
        }
        err
    }

    /// Settle on `state` with the Inconsistent flag set and report it.
    async fn flag(&self, instance: &mut Instance, state: VmState, reason: String) -> MoxError {
        tracing::error!(instance = %instance.name, %state, "flagged inconsistent: {reason}");
        instance.transition(state);
        instance.flag_inconsistent(reason.clone());
        if let Err(put_err) = self.instances.put(instance).await {
            tracing::error!(instance = %instance.name, "flag not recorded: {put_err}");
        }
        MoxError::Inconsistent {
            name: instance.name.clone(),
            reason,
        }
    }

    fn domain_spec(&self, instance: &Instance) -> DomainSpec {
        DomainSpec::for_instance(instance, &self.config.hypervisor)
    }
}

/// Held for the duration of a flow. Field order releases the file lock first.
struct InstanceLock {
    _file: FileLock,
    _local: tokio::sync::OwnedMutexGuard<()>,
}

/// Reject `instance` unless its state passes `allowed`.
fn require(
    instance: &Instance,
    operation: &'static str,
    allowed: impl Fn(VmState) -> bool,
) -> Result<(), MoxError> {
    if allowed(instance.state) {
        Ok(())
    } else {
        Err(MoxError::InvalidTransition {
            name: instance.name.clone(),
            state: instance.state,
            operation,
        })
    }
}

fn hypervisor(name: &str) -> impl FnOnce(GatewayError) -> MoxError + '_ {
    move |source| MoxError::Hypervisor {
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::config::tests::test_config;
    use crate::gateway::MemoryGateway;
    use crate::qcow2;
    use crate::util::GIB;

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub orch: Orchestrator<MemoryGateway>,
    }

    impl Harness {
        pub fn gw(&self) -> &MemoryGateway {
            self.orch.gateway()
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(MemoryGateway::new())
    }

    /// Base directory with a 2 GB `ubuntu` template and plenty of free space.
    pub(crate) fn harness_with(gateway: MemoryGateway) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        qcow2::create_qcow2(&layout.template_dir("ubuntu").join("ubuntu.qcow2"), 2 * GIB)
            .unwrap();
        std::fs::write(layout.template_metadata("ubuntu"), "os: ubuntu\n").unwrap();

        let disks = DiskProvisioner::new(layout, config.provisioning())
            .with_free_space(Arc::new(|_: &Path| Ok::<_, MoxError>(1024 * GIB)));
        let orch = Orchestrator::new(config, gateway).unwrap().with_disks(disks);
        Harness { dir, orch }
    }

    /// Another orchestrator over the same base directory and hypervisor, as a
    /// second mockmox process would see them.
    pub(crate) fn second(h: &Harness) -> Orchestrator<MemoryGateway> {
        let config = test_config(h.dir.path());
        let disks = DiskProvisioner::new(Layout::new(h.dir.path()), config.provisioning())
            .with_free_space(Arc::new(|_: &Path| Ok::<_, MoxError>(1024 * GIB)));
        Orchestrator::new(config, h.gw().clone())
            .unwrap()
            .with_disks(disks)
    }

    pub(crate) async fn created(h: &Harness, name: &str) -> Instance {
        h.orch
            .create(CreateRequest::new("ubuntu", name))
            .await
            .unwrap()
    }

    pub(crate) async fn running(h: &Harness, name: &str) -> Instance {
        created(h, name).await;
        h.orch.start(name).await.unwrap()
    }
}
