//! In-memory gateway. Models domains and their states closely enough to drive
//! the state machine without a hypervisor.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{DomainInfo, DomainSpec, DomainState, Gateway, GatewayError};

#[derive(Default)]
struct Inner {
    domains: BTreeMap<String, Domain>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<GatewayError>>,
    ignores_acpi: HashSet<String>,
}

struct Domain {
    spec: Option<DomainSpec>,
    state: DomainState,
    addresses: Vec<String>,
}

/// Clones share the same domains, so two orchestrators can drive one host.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<Mutex<Inner>>,
    delay: Duration,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next call to `op` fail with `err`. Queued failures are used in order.
    pub fn fail_next(&self, op: &'static str, err: GatewayError) {
        self.lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// The guest named `name` will ignore ACPI shutdown requests.
    pub fn ignore_acpi(&self, name: &str) {
        self.lock().ignores_acpi.insert(name.to_string());
    }

    /// How many times `op` has been called, failed calls included.
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn state_of(&self, name: &str) -> Option<DomainState> {
        self.lock().domains.get(name).map(|d| d.state)
    }

    pub fn spec_of(&self, name: &str) -> Option<DomainSpec> {
        self.lock().domains.get(name).and_then(|d| d.spec.clone())
    }

    /// Put a domain in place behind the registry's back.
    pub fn insert_domain(&self, name: &str, state: DomainState) {
        self.lock().domains.insert(
            name.to_string(),
            Domain {
                spec: None,
                state,
                addresses: Vec::new(),
            },
        );
    }

    pub fn set_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = self.lock().domains.get_mut(name) {
            domain.state = state;
        }
    }

    pub fn set_addresses(&self, name: &str, addresses: &[&str]) {
        if let Some(domain) = self.lock().domains.get_mut(name) {
            domain.addresses = addresses.iter().map(|a| a.to_string()).collect();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Count the call, apply the delay, then run `f` unless a failure is queued.
    async fn call<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Inner) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        *self.lock().calls.entry(op).or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut inner = self.lock();
        if let Some(err) = inner.failures.get_mut(op).and_then(|q| q.pop_front()) {
            tracing::debug!(op, "injected gateway failure: {err}");
            return Err(err);
        }
        f(&mut inner)
    }
}

fn domain<'a>(inner: &'a mut Inner, name: &str) -> Result<&'a mut Domain, GatewayError> {
    inner
        .domains
        .get_mut(name)
        .ok_or_else(|| GatewayError::NotFound {
            domain: name.to_string(),
        })
}

fn already(name: &str, message: &str) -> GatewayError {
    GatewayError::AlreadyInState {
        domain: name.to_string(),
        message: message.to_string(),
    }
}

impl Gateway for MemoryGateway {
    async fn define_domain(&self, spec: &DomainSpec) -> Result<(), GatewayError> {
        self.call("define_domain", |inner| {
            let entry = inner
                .domains
                .entry(spec.name.clone())
                .or_insert_with(|| Domain {
                    spec: None,
                    state: DomainState::Shutoff,
                    addresses: Vec::new(),
                });
            entry.spec = Some(spec.clone());
            Ok(())
        })
        .await
    }

    async fn start_domain(&self, name: &str) -> Result<(), GatewayError> {
        self.call("start_domain", |inner| {
            let dom = domain(inner, name)?;
            match dom.state {
                DomainState::Running | DomainState::Paused => {
                    Err(already(name, "domain is already running"))
                }
                // libvirt restores a managed save on a plain start as well.
                _ => {
                    dom.state = DomainState::Running;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn graceful_shutdown(&self, name: &str) -> Result<(), GatewayError> {
        self.call("graceful_shutdown", |inner| {
            let ignores = inner.ignores_acpi.contains(name);
            let dom = domain(inner, name)?;
            if dom.state != DomainState::Running {
                return Err(already(name, "domain is not running"));
            }
            if !ignores {
                dom.state = DomainState::Shutoff;
            }
            Ok(())
        })
        .await
    }

    async fn force_stop(&self, name: &str) -> Result<(), GatewayError> {
        self.call("force_stop", |inner| {
            let dom = domain(inner, name)?;
            match dom.state {
                DomainState::Running | DomainState::Paused | DomainState::Other => {
                    dom.state = DomainState::Shutoff;
                    Ok(())
                }
                _ => Err(already(name, "domain is not running")),
            }
        })
        .await
    }

    async fn pause_and_save(&self, name: &str) -> Result<(), GatewayError> {
        self.call("pause_and_save", |inner| {
            let dom = domain(inner, name)?;
            match dom.state {
                DomainState::Running | DomainState::Paused => {
                    dom.state = DomainState::Saved;
                    Ok(())
                }
                DomainState::Saved => Err(already(name, "domain is already saved")),
                _ => Err(GatewayError::Rejected {
                    message: format!("domain '{name}' is not running"),
                }),
            }
        })
        .await
    }

    async fn restore_and_start(&self, name: &str) -> Result<(), GatewayError> {
        self.call("restore_and_start", |inner| {
            let dom = domain(inner, name)?;
            match dom.state {
                DomainState::Saved => {
                    dom.state = DomainState::Running;
                    Ok(())
                }
                DomainState::Running => Err(already(name, "domain is already running")),
                _ => Err(GatewayError::Rejected {
                    message: format!("domain '{name}' has no saved state"),
                }),
            }
        })
        .await
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), GatewayError> {
        self.call("undefine_domain", |inner| {
            let dom = domain(inner, name)?;
            if matches!(dom.state, DomainState::Running | DomainState::Paused) {
                return Err(GatewayError::Rejected {
                    message: format!("domain '{name}' is active"),
                });
            }
            inner.domains.remove(name);
            Ok(())
        })
        .await
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>, GatewayError> {
        self.call("list_domains", |inner| {
            Ok(inner
                .domains
                .iter()
                .map(|(name, d)| DomainInfo {
                    name: name.clone(),
                    state: d.state,
                })
                .collect())
        })
        .await
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, GatewayError> {
        self.call("domain_state", |inner| Ok(domain(inner, name)?.state))
            .await
    }

    async fn domain_addresses(&self, name: &str) -> Result<Vec<String>, GatewayError> {
        self.call("domain_addresses", |inner| {
            let dom = domain(inner, name)?;
            if dom.state != DomainState::Running {
                return Err(GatewayError::Rejected {
                    message: format!("domain '{name}' is not running"),
                });
            }
            Ok(dom.addresses.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::DiskFormat;

    fn spec(name: &str) -> DomainSpec {
        DomainSpec {
            name: name.into(),
            memory_mb: 512,
            vcpus: 1,
            disk: format!("/tmp/{name}.qcow2").into(),
            disk_format: DiskFormat::Qcow2,
            domain_type: "kvm".into(),
            machine: "q35".into(),
            network: "default".into(),
        }
    }

    #[tokio::test]
    async fn lifecycle() {
        let gw = MemoryGateway::new();
        gw.define_domain(&spec("a")).await.unwrap();
        assert_eq!(gw.state_of("a"), Some(DomainState::Shutoff));

        gw.start_domain("a").await.unwrap();
        assert!(matches!(
            gw.start_domain("a").await,
            Err(GatewayError::AlreadyInState { .. })
        ));

        gw.pause_and_save("a").await.unwrap();
        assert_eq!(gw.domain_state("a").await.unwrap(), DomainState::Saved);
        gw.restore_and_start("a").await.unwrap();

        gw.graceful_shutdown("a").await.unwrap();
        assert_eq!(gw.state_of("a"), Some(DomainState::Shutoff));
        gw.undefine_domain("a").await.unwrap();
        assert!(gw.list_domains().await.unwrap().is_empty());
        assert_eq!(gw.calls("start_domain"), 2);
    }

    #[tokio::test]
    async fn acpi_can_be_ignored() {
        let gw = MemoryGateway::new();
        gw.define_domain(&spec("stubborn")).await.unwrap();
        gw.start_domain("stubborn").await.unwrap();
        gw.ignore_acpi("stubborn");
        gw.graceful_shutdown("stubborn").await.unwrap();
        assert_eq!(gw.state_of("stubborn"), Some(DomainState::Running));
        gw.force_stop("stubborn").await.unwrap();
        assert_eq!(gw.state_of("stubborn"), Some(DomainState::Shutoff));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let gw = MemoryGateway::new();
        gw.define_domain(&spec("a")).await.unwrap();
        gw.fail_next(
            "start_domain",
            GatewayError::Unreachable {
                message: "socket closed".into(),
            },
        );
        assert!(matches!(
            gw.start_domain("a").await,
            Err(GatewayError::Unreachable { .. })
        ));
        assert_eq!(gw.state_of("a"), Some(DomainState::Shutoff));
        gw.start_domain("a").await.unwrap();
        assert_eq!(gw.calls("start_domain"), 2);
    }

    #[tokio::test]
    async fn unknown_domain_is_not_found() {
        let gw = MemoryGateway::new();
        assert!(matches!(
            gw.domain_state("ghost").await,
            Err(GatewayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn clones_share_domains() {
        let gw = MemoryGateway::new();
        let other = gw.clone();
        gw.define_domain(&spec("a")).await.unwrap();
        other.start_domain("a").await.unwrap();
        assert_eq!(gw.state_of("a"), Some(DomainState::Running));
        assert_eq!(gw.calls("start_domain"), 1);
    }
}
