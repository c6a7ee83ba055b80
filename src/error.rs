use miette::Diagnostic;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::vm_state::VmState;

#[derive(Debug, Error, Diagnostic)]
pub enum MoxError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    #[diagnostic(help("pick another name or destroy the existing one first"))]
    NameTaken { kind: &'static str, name: String },

    #[error(
        "not enough free space in {path}: {required_gb} GB requested, {available_gb} GB available"
    )]
    InsufficientSpace {
        path: String,
        required_gb: u64,
        available_gb: u64,
    },

    #[error("disk {path} already exists")]
    #[diagnostic(help("refusing to overwrite an existing disk; destroy the instance that owns it"))]
    DiskExists { path: String },

    #[error("disk {path} is still referenced by instance '{instance}'")]
    DiskInUse { path: String, instance: String },

    #[error("requested disk size {requested_gb} GB is below the template minimum of {minimum_gb} GB")]
    DiskTooSmall { requested_gb: u64, minimum_gb: u64 },

    #[error("template '{name}' is still used by: {}", .instances.join(", "))]
    TemplateInUse { name: String, instances: Vec<String> },

    #[error("template '{name}' is still a member of: {}", .groups.join(", "))]
    #[diagnostic(help("remove it from those groups with `mockmox group remove` first"))]
    TemplateGrouped { name: String, groups: Vec<String> },

    #[error("instance '{name}': {source}")]
    Hypervisor {
        name: String,
        #[source]
        source: GatewayError,
    },

    #[error("instance '{name}' is inconsistent: {reason}")]
    #[diagnostic(help("inspect the domain and disk, then run `mockmox vm resolve`"))]
    Inconsistent { name: String, reason: String },

    #[error("{operation} of '{name}' did not finish within {secs}s")]
    Timeout {
        operation: &'static str,
        name: String,
        secs: u64,
    },

    #[error("cannot {operation} instance '{name}' while it is {state}")]
    InvalidTransition {
        name: String,
        state: VmState,
        operation: &'static str,
    },

    #[error("instance '{name}' is already {state}")]
    AlreadyInState { name: String, state: VmState },

    #[error("registry record {path} is unreadable: {message}")]
    RecordCorrupt { path: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },
}

impl MoxError {
    /// Only a lost hypervisor connection is safe to retry without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MoxError::Hypervisor {
                source: GatewayError::Unreachable { .. },
                ..
            }
        )
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MoxError::Io {
            context: context.into(),
            source,
        }
    }
}
