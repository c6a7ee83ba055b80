//! Suspend and resume flows.
//!
//! Suspend saves guest state through the hypervisor first and moves the disk
//! to the suspended area only once the save is confirmed. Resume moves the
//! disk back before asking the hypervisor to restore. Either way the disk
//! is in exactly one area at every instant.

use super::{Orchestrator, hypervisor, require};
use crate::error::MoxError;
use crate::gateway::{DomainState, Gateway, GatewayError};
use crate::instance::Instance;
use crate::vm_state::{StorageArea, VmState};

impl<G: Gateway> Orchestrator<G> {
    /// `Running → Suspending → Suspended`.
    pub async fn suspend(&self, name: &str) -> Result<Instance, MoxError> {
        let _guard = self.lock(name).await?;
        let mut instance = self.load(name).await?;

        if instance.state == VmState::Suspended {
            return Err(MoxError::AlreadyInState {
                name: name.to_string(),
                state: instance.state,
            });
        }
        require(&instance, "suspend", VmState::can_suspend)?;

        self.persist(&mut instance, VmState::Suspending).await?;

        if let Err(e) = self.gateway.pause_and_save(name).await {
            return Err(self
                .revert(&mut instance, VmState::Running, hypervisor(name)(e))
                .await);
        }

        match self.gateway.domain_state(name).await {
            Ok(DomainState::Saved) => {}
            Ok(DomainState::Running) => {
                let err = hypervisor(name)(GatewayError::Rejected {
                    message: "save was not confirmed, domain is still running".into(),
                });
                return Err(self.revert(&mut instance, VmState::Running, err).await);
            }
            other => {
                let seen = match other {
                    Ok(state) => format!("domain reports {state}"),
                    Err(e) => e.to_string(),
                };
                return Err(self
                    .flag(
                        &mut instance,
                        VmState::Running,
                        format!("save could not be confirmed after suspend: {seen}"),
                    )
                    .await);
            }
        }

        match self
            .disks
            .relocate(instance.disk(), StorageArea::Suspended)
            .await
        {
            Ok(disk) => instance.set_disk(disk),
            Err(e) => {
                return Err(self
                    .flag(
                        &mut instance,
                        VmState::Suspended,
                        format!("guest state saved but disk left in the active area: {e}"),
                    )
                    .await);
            }
        }

        self.persist(&mut instance, VmState::Suspended).await?;
        Ok(instance)
    }

    /// `Suspended → Resuming → Running`.
    pub async fn resume(&self, name: &str) -> Result<Instance, MoxError> {
        let _guard = self.lock(name).await?;
        let mut instance = self.load(name).await?;

        if instance.state == VmState::Running {
            return Err(MoxError::AlreadyInState {
                name: name.to_string(),
                state: instance.state,
            });
        }
        require(&instance, "resume", VmState::can_resume)?;

        self.persist(&mut instance, VmState::Resuming).await?;

        match self.disks.relocate(instance.disk(), StorageArea::Active).await {
            Ok(disk) => {
                instance.set_disk(disk);
                self.instances.put(&instance).await?;
            }
            Err(e) => return Err(self.revert(&mut instance, VmState::Suspended, e).await),
        }

        if let Err(e) = self.gateway.restore_and_start(name).await {
            let reason = format!("disk is back in the active area but restore failed: {e}");
            self.flag(&mut instance, VmState::Suspended, reason).await;
            return Err(hypervisor(name)(e));
        }

        self.persist(&mut instance, VmState::Running).await?;
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::super::testing::*;
    use super::*;
    use crate::gateway::MemoryGateway;

    #[tokio::test]
    async fn suspend_resume_round_trip() {
        let h = harness();
        let before = running(&h, "vm1").await;
        let active = before.disk().to_path_buf();
        let bytes = std::fs::read(&active).unwrap();

        let suspended = h.orch.suspend("vm1").await.unwrap();
        assert_eq!(suspended.state, VmState::Suspended);
        assert_eq!(
            h.orch.layout().area_of(suspended.disk()),
            Some(StorageArea::Suspended)
        );
        assert!(!active.exists());
        assert_eq!(h.gw().state_of("vm1"), Some(DomainState::Saved));

        let resumed = h.orch.resume("vm1").await.unwrap();
        assert_eq!(resumed.state, VmState::Running);
        assert_eq!(resumed.disk(), active);
        assert!(!suspended.disk().exists());
        assert_eq!(std::fs::read(&active).unwrap(), bytes);
        assert_eq!(h.gw().state_of("vm1"), Some(DomainState::Running));
    }

    #[tokio::test]
    async fn disk_is_never_missing_from_both_areas() {
        let h = harness_with(MemoryGateway::new().with_delay(Duration::from_millis(5)));
        running(&h, "vm1").await;
        let done = AtomicBool::new(false);

        let watch = async {
            while !done.load(Ordering::SeqCst) {
                assert!(
                    h.orch.disks().find_disk("vm1").is_some(),
                    "disk vanished mid-transition"
                );
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        let cycle = async {
            h.orch.suspend("vm1").await.unwrap();
            h.orch.resume("vm1").await.unwrap();
            done.store(true, Ordering::SeqCst);
        };
        tokio::join!(watch, cycle);
    }

    #[tokio::test]
    async fn save_failure_reverts_to_running() {
        let h = harness();
        let inst = running(&h, "vm1").await;
        h.gw().fail_next(
            "pause_and_save",
            GatewayError::Rejected {
                message: "no space for save image".into(),
            },
        );

        assert!(h.orch.suspend("vm1").await.is_err());
        let after = h.orch.get("vm1").await.unwrap();
        assert_eq!(after.state, VmState::Running);
        assert!(!after.is_inconsistent());
        assert_eq!(after.disk(), inst.disk());
        assert!(inst.disk().exists());
    }

    #[tokio::test]
    async fn failed_relocation_after_save_is_flagged() {
        let h = harness();
        let inst = running(&h, "vm1").await;
        // Block the move with a disk already sitting in the suspended area.
        let blocker = h.orch.layout().disk_path(StorageArea::Suspended, "vm1", "qcow2");
        std::fs::write(&blocker, b"stale").unwrap();

        let err = h.orch.suspend("vm1").await.unwrap_err();
        assert!(matches!(err, MoxError::Inconsistent { .. }));
        let after = h.orch.get("vm1").await.unwrap();
        assert_eq!(after.state, VmState::Suspended);
        assert!(after.is_inconsistent());
        assert_eq!(after.disk(), inst.disk());
        assert!(inst.disk().exists());
    }

    #[tokio::test]
    async fn restore_failure_leaves_disk_active_and_flags() {
        let h = harness();
        running(&h, "vm1").await;
        h.orch.suspend("vm1").await.unwrap();
        h.gw().fail_next(
            "restore_and_start",
            GatewayError::Rejected {
                message: "save image corrupt".into(),
            },
        );

        let err = h.orch.resume("vm1").await.unwrap_err();
        assert!(matches!(err, MoxError::Hypervisor { .. }));
        let after = h.orch.get("vm1").await.unwrap();
        assert_eq!(after.state, VmState::Suspended);
        assert!(after.is_inconsistent());
        assert_eq!(
            h.orch.layout().area_of(after.disk()),
            Some(StorageArea::Active)
        );
        assert!(after.disk().exists());
        // No automatic retry.
        assert_eq!(h.gw().calls("restore_and_start"), 1);
        assert!(matches!(
            h.orch.resume("vm1").await,
            Err(MoxError::Inconsistent { .. })
        ));
    }

    #[tokio::test]
    async fn resume_relocation_failure_reverts() {
        let h = harness();
        running(&h, "vm1").await;
        let suspended = h.orch.suspend("vm1").await.unwrap();
        let blocker = h.orch.layout().disk_path(StorageArea::Active, "vm1", "qcow2");
        std::fs::write(&blocker, b"stale").unwrap();

        assert!(matches!(
            h.orch.resume("vm1").await,
            Err(MoxError::DiskExists { .. })
        ));
        let after = h.orch.get("vm1").await.unwrap();
        assert_eq!(after.state, VmState::Suspended);
        assert!(!after.is_inconsistent());
        assert_eq!(after.disk(), suspended.disk());
        assert_eq!(h.gw().calls("restore_and_start"), 0);
    }

    #[tokio::test]
    async fn suspend_state_checks() {
        let h = harness();
        created(&h, "vm1").await;
        assert!(matches!(
            h.orch.suspend("vm1").await,
            Err(MoxError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.orch.resume("vm1").await,
            Err(MoxError::InvalidTransition { .. })
        ));
        h.orch.start("vm1").await.unwrap();
        assert!(matches!(
            h.orch.resume("vm1").await,
            Err(MoxError::AlreadyInState { .. })
        ));
        h.orch.suspend("vm1").await.unwrap();
        assert!(matches!(
            h.orch.suspend("vm1").await,
            Err(MoxError::AlreadyInState { .. })
        ));
    }
}
