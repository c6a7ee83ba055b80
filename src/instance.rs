use std::path::{Path, PathBuf};

use facet::Facet;

use crate::vm_state::VmState;

/// Durable record of one managed VM, as stored by the instance registry.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Instance {
    pub name: String,
    /// Template the disk was derived from. May dangle once the template is gone.
    pub template: String,
    pub disk_path: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub state: VmState,
    /// Stable state held before the current transitional one.
    #[facet(default)]
    pub previous_state: Option<VmState>,
    /// Set when registry and hypervisor disagree; operator must resolve.
    #[facet(default)]
    pub inconsistent: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds of the last state change.
    pub updated_at: u64,
}

impl Instance {
    pub fn disk(&self) -> &Path {
        Path::new(&self.disk_path)
    }

    pub fn set_disk(&mut self, path: PathBuf) {
        self.disk_path = path.display().to_string();
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.is_some()
    }

    /// Move to `next`, remembering the stable state we left when entering a
    /// transitional one.
    pub fn transition(&mut self, next: VmState) {
        if next.is_transitional() {
            if !self.state.is_transitional() {
                self.previous_state = Some(self.state);
            }
        } else {
            self.previous_state = None;
        }
        self.state = next;
        self.updated_at = unix_now();
    }

    pub fn flag_inconsistent(&mut self, reason: impl Into<String>) {
        self.inconsistent = Some(reason.into());
        self.updated_at = unix_now();
    }
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
