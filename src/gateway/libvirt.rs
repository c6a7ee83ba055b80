use std::sync::{Arc, Mutex};

use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{self as virt_error, ErrorDomain, ErrorNumber};
use virt::sys;

use super::{DomainInfo, DomainSpec, DomainState, Gateway, GatewayError};
use crate::domain_xml;

struct ConnGuard(Connect);

// SAFETY: libvirt connections are thread-safe; calls on one handle from
// several threads are serialized inside the library.
unsafe impl Send for ConnGuard {}
unsafe impl Sync for ConnGuard {}

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// Gateway over one lazily opened libvirt connection.
pub struct LibvirtGateway {
    uri: String,
    conn: Mutex<Option<Arc<ConnGuard>>>,
}

impl LibvirtGateway {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            conn: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<Arc<ConnGuard>, GatewayError> {
        let mut slot = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        // Keep libvirt from printing errors to stderr; they surface as Results.
        virt_error::clear_error_callback();
        let conn = Connect::open(Some(&self.uri))
            .map(|c| Arc::new(ConnGuard(c)))
            .map_err(|e| GatewayError::Unreachable {
                message: format!("connecting to {}: {e}", self.uri),
            })?;
        tracing::debug!(uri = %self.uri, "opened libvirt connection");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn forget_connection(&self) {
        let dropped = self
            .conn
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if dropped.is_some() {
            tracing::warn!(uri = %self.uri, "libvirt connection lost, will reconnect");
        }
    }

    /// Run `f` against the connection off the async scheduler, normalizing errors.
    fn run<T>(
        &self,
        domain: &str,
        invalid: OnInvalid,
        f: impl FnOnce(&Connect) -> Result<T, virt_error::Error>,
    ) -> Result<T, GatewayError> {
        let conn = self.connection()?;
        let result = blocking(|| f(&conn)).map_err(|e| classify(e, domain, invalid));
        if let Err(GatewayError::Unreachable { .. }) = &result {
            self.forget_connection();
        }
        result
    }
}

fn blocking<T>(f: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// How to read `OperationInvalid`. For start, shutdown and destroy it means
/// the domain is already where the call would take it; anywhere else the
/// call was simply refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnInvalid {
    AlreadyInState,
    Rejected,
}

fn classify(e: virt_error::Error, domain: &str, invalid: OnInvalid) -> GatewayError {
    let transport = matches!(e.domain(), ErrorDomain::Rpc | ErrorDomain::Remote);
    classify_code(e.code(), transport, e.to_string(), domain, invalid)
}

/// `transport` is set when the error was raised by libvirt's RPC layer
/// rather than by the driver acting on the domain.
fn classify_code(
    code: ErrorNumber,
    transport: bool,
    message: String,
    domain: &str,
    invalid: OnInvalid,
) -> GatewayError {
    match code {
        ErrorNumber::NoDomain => GatewayError::NotFound {
            domain: domain.to_string(),
        },
        ErrorNumber::OperationInvalid if invalid == OnInvalid::AlreadyInState => {
            GatewayError::AlreadyInState {
                domain: domain.to_string(),
                message,
            }
        }
        ErrorNumber::NoConnect | ErrorNumber::InvalidConn | ErrorNumber::Rpc => {
            GatewayError::Unreachable { message }
        }
        ErrorNumber::SystemError if transport => GatewayError::Unreachable { message },
        _ => GatewayError::Rejected { message },
    }
}

fn lookup(conn: &Connect, name: &str) -> Result<Domain, virt_error::Error> {
    Domain::lookup_by_name(conn, name)
}

fn state_of(dom: &Domain) -> Result<DomainState, virt_error::Error> {
    let (state, _reason) = dom.get_state()?;
    Ok(match state {
        sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED => DomainState::Running,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTOFF | sys::VIR_DOMAIN_SHUTDOWN => {
            if dom.has_managed_save(0)? {
                DomainState::Saved
            } else {
                DomainState::Shutoff
            }
        }
        _ => DomainState::Other,
    })
}

impl Gateway for LibvirtGateway {
    async fn define_domain(&self, spec: &DomainSpec) -> Result<(), GatewayError> {
        let xml = domain_xml::generate_domain_xml(spec);
        self.run(&spec.name, OnInvalid::Rejected, |conn| {
            Domain::define_xml(conn, &xml).map(drop)
        })?;
        tracing::info!(domain = %spec.name, "domain defined");
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), GatewayError> {
        self.run(name, OnInvalid::AlreadyInState, |conn| {
            lookup(conn, name)?.create().map(drop)
        })?;
        tracing::info!(domain = name, "domain started");
        Ok(())
    }

    async fn graceful_shutdown(&self, name: &str) -> Result<(), GatewayError> {
        self.run(name, OnInvalid::AlreadyInState, |conn| {
            lookup(conn, name)?.shutdown().map(drop)
        })?;
        tracing::debug!(domain = name, "ACPI shutdown requested");
        Ok(())
    }

    async fn force_stop(&self, name: &str) -> Result<(), GatewayError> {
        self.run(name, OnInvalid::AlreadyInState, |conn| {
            lookup(conn, name)?.destroy().map(drop)
        })?;
        tracing::info!(domain = name, "domain force stopped");
        Ok(())
    }

    async fn pause_and_save(&self, name: &str) -> Result<(), GatewayError> {
        // managed_save pauses the guest itself and leaves it running on failure.
        self.run(name, OnInvalid::Rejected, |conn| {
            lookup(conn, name)?.managed_save(0).map(drop)
        })?;
        tracing::info!(domain = name, "domain saved");
        Ok(())
    }

    async fn restore_and_start(&self, name: &str) -> Result<(), GatewayError> {
        let restored = self.run(name, OnInvalid::Rejected, |conn| {
            let dom = lookup(conn, name)?;
            if !dom.has_managed_save(0)? {
                return Ok(false);
            }
            // A domain with a managed save image resumes from it on create.
            dom.create()?;
            Ok(true)
        })?;
        if !restored {
            return Err(GatewayError::Rejected {
                message: format!("domain '{name}' has no managed save image"),
            });
        }
        tracing::info!(domain = name, "domain restored");
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), GatewayError> {
        self.run(name, OnInvalid::Rejected, |conn| {
            lookup(conn, name)?
                .undefine_flags(sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE)
                .map(drop)
        })?;
        tracing::info!(domain = name, "domain undefined");
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>, GatewayError> {
        self.run("*", OnInvalid::Rejected, |conn| {
            let flags =
                sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
            conn.list_all_domains(flags)?
                .iter()
                .map(|dom| {
                    Ok(DomainInfo {
                        name: dom.get_name()?,
                        state: state_of(dom)?,
                    })
                })
                .collect()
        })
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, GatewayError> {
        self.run(name, OnInvalid::Rejected, |conn| {
            state_of(&lookup(conn, name)?)
        })
    }

    async fn domain_addresses(&self, name: &str) -> Result<Vec<String>, GatewayError> {
        self.run(name, OnInvalid::Rejected, |conn| {
            let ifaces = lookup(conn, name)?
                .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)?;
            Ok(ifaces
                .into_iter()
                .flat_map(|iface| iface.addrs.into_iter().map(|a| a.addr))
                .collect())
        })
    }
}
