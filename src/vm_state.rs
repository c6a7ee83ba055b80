//! Shared vocabulary for VM lifecycle state.
//!
//! `VmState` is what the instance registry persists for every managed VM.
//! Transitional states are written before the hypervisor is touched, so a
//! record left in one of them after a crash tells reconciliation that an
//! operation was in flight and must be re-validated against libvirt.

use std::fmt;

use facet::Facet;

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[repr(u8)]
pub enum VmState {
    /// Disk provisioned, no domain started yet.
    Defined,
    Starting,
    Running,
    Stopping,
    Stopped,
    Suspending,
    /// Guest state saved by the hypervisor, disk parked in the suspended area.
    Suspended,
    Resuming,
    /// Terminal. Only visible on a record whose disk removal failed.
    Destroyed,
}

/// Where an instance's disk lives under the base directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageArea {
    Active,
    Suspended,
}

impl VmState {
    /// In-flight states. Nothing but reconciliation may act on these.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            VmState::Starting | VmState::Stopping | VmState::Suspending | VmState::Resuming
        )
    }

    /// The storage area the disk must be in while the instance is at rest in
    /// this state.
    ///
    /// Transitional states are not at rest. A `Suspending` record points at
    /// the active disk until the save is confirmed and the disk parked. A
    /// persisted `Resuming` record still points at the suspended disk until
    /// the move back to the active area has been recorded.
    pub fn storage_area(self) -> StorageArea {
        match self {
            VmState::Suspended => StorageArea::Suspended,
            _ => StorageArea::Active,
        }
    }

    pub fn can_start(self) -> bool {
        matches!(self, VmState::Defined | VmState::Stopped)
    }

    pub fn can_stop(self) -> bool {
        self == VmState::Running
    }

    pub fn can_suspend(self) -> bool {
        self == VmState::Running
    }

    pub fn can_resume(self) -> bool {
        self == VmState::Suspended
    }

    pub fn can_destroy(self) -> bool {
        !self.is_transitional()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Defined => "defined",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Suspending => "suspending",
            VmState::Suspended => "suspended",
            VmState::Resuming => "resuming",
            VmState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StorageArea {
    pub fn other(self) -> StorageArea {
        match self {
            StorageArea::Active => StorageArea::Suspended,
            StorageArea::Suspended => StorageArea::Active,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            StorageArea::Active => "active",
            StorageArea::Suspended => "suspended",
        }
    }
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [VmState; 9] = [
        VmState::Defined,
        VmState::Starting,
        VmState::Running,
        VmState::Stopping,
        VmState::Stopped,
        VmState::Suspending,
        VmState::Suspended,
        VmState::Resuming,
        VmState::Destroyed,
    ];

    #[test]
    fn only_suspended_lives_in_suspended_area() {
        for state in ALL {
            let expected = if state == VmState::Suspended {
                StorageArea::Suspended
            } else {
                StorageArea::Active
            };
            assert_eq!(state.storage_area(), expected, "{state}");
        }
    }

    #[test]
    fn destroy_refused_only_mid_transition() {
        for state in ALL {
            assert_eq!(state.can_destroy(), !state.is_transitional(), "{state}");
        }
    }

    #[test]
    fn start_allowed_from_defined_and_stopped() {
        let startable: Vec<_> = ALL.into_iter().filter(|s| s.can_start()).collect();
        assert_eq!(startable, vec![VmState::Defined, VmState::Stopped]);
    }

    #[test]
    fn suspend_and_resume_are_exclusive() {
        for state in ALL {
            assert!(!(state.can_suspend() && state.can_resume()));
        }
        assert!(VmState::Running.can_suspend());
        assert!(VmState::Suspended.can_resume());
    }
}
