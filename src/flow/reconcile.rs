//! Startup reconciliation of the registry against the hypervisor.
//!
//! Records left in a transitional state by a crash are settled according to
//! what the hypervisor reports. Stable records that disagree with it are
//! flagged Inconsistent and left for the operator; nothing stable is ever
//! rewritten to match the hypervisor.

use std::collections::BTreeSet;

use facet::Facet;

use super::Orchestrator;
use crate::error::MoxError;
use crate::gateway::{DomainState, Gateway, GatewayError};
use crate::instance::Instance;
use crate::vm_state::{StorageArea, VmState};

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct ReconcileReport {
    /// Records examined.
    pub checked: usize,
    /// Records moved out of a transitional state.
    pub settled: Vec<String>,
    /// Records carrying the Inconsistent flag after the pass.
    pub inconsistent: Vec<String>,
    /// Hypervisor domains with no record.
    pub orphan_domains: Vec<String>,
}

enum Verdict {
    Ok,
    Settle(VmState),
    Flag(VmState, String),
}

impl<G: Gateway> Orchestrator<G> {
    pub async fn reconcile(&self) -> Result<ReconcileReport, MoxError> {
        let domains: BTreeSet<String> = self
            .gateway
            .list_domains()
            .await
            .map_err(|source| MoxError::Hypervisor {
                name: "*".into(),
                source,
            })?
            .into_iter()
            .map(|d| d.name)
            .collect();

        let mut report = ReconcileReport::default();
        let records = self.instances.list().await?;

        for record in &records {
            let _guard = self.lock(&record.name).await?;
            // Re-read under the lock; a flow may have finished meanwhile.
            let Some(mut instance) = self.instances.find(&record.name).await? else {
                continue;
            };
            report.checked += 1;

            if instance.is_inconsistent() {
                report.inconsistent.push(instance.name.clone());
                continue;
            }
            if instance.state == VmState::Destroyed {
                tracing::warn!(instance = %instance.name, "destroy did not finish; run it again");
                continue;
            }

            // Asked under the lock, so a flow that just finished is seen as it left things.
            let live = match self.gateway.domain_state(&instance.name).await {
                Ok(state) => Some(state),
                Err(GatewayError::NotFound { .. }) => None,
                Err(source) => {
                    return Err(MoxError::Hypervisor {
                        name: instance.name.clone(),
                        source,
                    });
                }
            };
            match self.judge(&mut instance, live).await {
                Verdict::Ok => {}
                Verdict::Settle(state) => {
                    tracing::info!(
                        instance = %instance.name,
                        from = %instance.state,
                        to = %state,
                        live = ?live,
                        "settled interrupted transition"
                    );
                    instance.transition(state);
                    self.instances.put(&instance).await?;
                    report.settled.push(instance.name.clone());
                }
                Verdict::Flag(state, reason) => {
                    self.flag(&mut instance, state, reason).await;
                    report.inconsistent.push(instance.name.clone());
                }
            }
        }

        report.orphan_domains = domains
            .iter()
            .filter(|name| !records.iter().any(|r| &r.name == *name))
            .cloned()
            .collect();
        for orphan in &report.orphan_domains {
            tracing::warn!(domain = %orphan, "domain is not managed by mockmox");
        }

        tracing::info!(
            checked = report.checked,
            settled = report.settled.len(),
            inconsistent = report.inconsistent.len(),
            orphans = report.orphan_domains.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn judge(&self, instance: &mut Instance, live: Option<DomainState>) -> Verdict {
        use DomainState as D;
        use VmState as S;

        let describe = |live: Option<DomainState>| match live {
            Some(state) => format!("hypervisor reports {state}"),
            None => "hypervisor has no such domain".to_string(),
        };

        match (instance.state, live) {
            // Interrupted transitions.
            (S::Starting, Some(D::Running)) => Verdict::Settle(S::Running),
            (S::Starting, Some(D::Shutoff) | None) => {
                Verdict::Settle(instance.previous_state.unwrap_or(S::Defined))
            }
            (S::Stopping, Some(D::Running)) => Verdict::Settle(S::Running),
            (S::Stopping, Some(D::Shutoff)) => Verdict::Settle(S::Stopped),
            (S::Suspending, Some(D::Running)) => Verdict::Settle(S::Running),
            (S::Suspending | S::Resuming, Some(D::Saved)) => {
                // Guest state is saved; finish parking the disk.
                match self
                    .disks
                    .relocate(instance.disk(), StorageArea::Suspended)
                    .await
                {
                    Ok(disk) => {
                        instance.set_disk(disk);
                        Verdict::Settle(S::Suspended)
                    }
                    Err(e) => Verdict::Flag(
                        S::Suspended,
                        format!("guest state saved but disk could not be parked: {e}"),
                    ),
                }
            }
            (S::Resuming, Some(D::Running)) => {
                match self.disks.relocate(instance.disk(), StorageArea::Active).await {
                    Ok(disk) => {
                        instance.set_disk(disk);
                        Verdict::Settle(S::Running)
                    }
                    Err(e) => Verdict::Flag(
                        S::Running,
                        format!("guest running but disk not in the active area: {e}"),
                    ),
                }
            }
            (state, live) if state.is_transitional() => Verdict::Flag(
                instance.previous_state.unwrap_or(state),
                format!("interrupted while {state}, {}", describe(live)),
            ),

            // Stable records: check, never correct.
            (state, live) => {
                let agrees = match state {
                    S::Defined | S::Stopped => matches!(live, None | Some(D::Shutoff)),
                    S::Running => matches!(live, Some(D::Running | D::Paused)),
                    S::Suspended => live == Some(D::Saved),
                    _ => true,
                };
                if !agrees {
                    return Verdict::Flag(state, format!("recorded {state}, {}", describe(live)));
                }
                let expected = state.storage_area();
                if !instance.disk().exists() {
                    return Verdict::Flag(
                        state,
                        format!("disk {} is missing", instance.disk().display()),
                    );
                }
                if self.layout.area_of(instance.disk()) != Some(expected) {
                    return Verdict::Flag(
                        state,
                        format!("disk {} is outside the {expected} area", instance.disk().display()),
                    );
                }
                Verdict::Ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[tokio::test]
    async fn consistent_registry_is_left_alone() {
        let h = harness();
        created(&h, "defined").await;
        running(&h, "up").await;
        running(&h, "parked").await;
        h.orch.suspend("parked").await.unwrap();
        running(&h, "down").await;
        h.orch.stop("down").await.unwrap();

        let report = h.orch.reconcile().await.unwrap();
        assert_eq!(report.checked, 4);
        assert!(report.settled.is_empty());
        assert!(report.inconsistent.is_empty());
        assert!(report.orphan_domains.is_empty());
    }

    #[tokio::test]
    async fn stale_running_record_is_flagged_not_corrected() {
        let h = harness();
        running(&h, "vm1").await;
        // The domain died behind our back.
        h.gw().set_state("vm1", DomainState::Shutoff);

        let report = h.orch.reconcile().await.unwrap();
        assert_eq!(report.inconsistent, vec!["vm1"]);
        let inst = h.orch.get("vm1").await.unwrap();
        assert_eq!(inst.state, VmState::Running);
        assert!(inst.is_inconsistent());
        assert!(matches!(
            h.orch.stop("vm1").await,
            Err(MoxError::Inconsistent { .. })
        ));

        // Still reported, not re-flagged, on the next pass.
        let again = h.orch.reconcile().await.unwrap();
        assert_eq!(again.inconsistent, vec!["vm1"]);
    }

    #[tokio::test]
    async fn interrupted_start_settles_on_live_state() {
        let h = harness();
        let mut booted = created(&h, "booted").await;
        let mut lost = created(&h, "lost").await;
        // Crash after persisting Starting; one domain made it, one didn't.
        for inst in [&mut booted, &mut lost] {
            inst.transition(VmState::Starting);
            h.orch.instances().put(inst).await.unwrap();
        }
        h.gw().insert_domain("booted", DomainState::Running);

        let report = h.orch.reconcile().await.unwrap();
        assert_eq!(report.settled, vec!["booted", "lost"]);
        assert_eq!(h.orch.get("booted").await.unwrap().state, VmState::Running);
        let lost = h.orch.get("lost").await.unwrap();
        assert_eq!(lost.state, VmState::Defined);
        assert_eq!(lost.previous_state, None);
    }

    #[tokio::test]
    async fn interrupted_suspend_finishes_parking_the_disk() {
        let h = harness();
        let mut inst = running(&h, "vm1").await;
        inst.transition(VmState::Suspending);
        h.orch.instances().put(&inst).await.unwrap();
        h.gw().set_state("vm1", DomainState::Saved);

        let report = h.orch.reconcile().await.unwrap();
        assert_eq!(report.settled, vec!["vm1"]);
        let after = h.orch.get("vm1").await.unwrap();
        assert_eq!(after.state, VmState::Suspended);
        assert_eq!(
            h.orch.layout().area_of(after.disk()),
            Some(StorageArea::Suspended)
        );
        h.orch.resume("vm1").await.unwrap();
    }

    #[tokio::test]
    async fn interrupted_resume_after_disk_move() {
        let h = harness();
        running(&h, "vm1").await;
        let suspended = h.orch.suspend("vm1").await.unwrap();
        // Crash after the disk went back to the active area, before restore.
        let mut inst = suspended.clone();
        inst.transition(VmState::Resuming);
        let active = h
            .orch
            .disks()
            .relocate(suspended.disk(), StorageArea::Active)
            .await
            .unwrap();
        inst.set_disk(active);
        h.orch.instances().put(&inst).await.unwrap();

        h.orch.reconcile().await.unwrap();
        let after = h.orch.get("vm1").await.unwrap();
        assert_eq!(after.state, VmState::Suspended);
        assert!(!after.is_inconsistent());
        assert_eq!(after.disk(), suspended.disk());
    }

    #[tokio::test]
    async fn interrupted_resume_before_disk_move_was_recorded() {
        let h = harness();
        running(&h, "vm1").await;
        let suspended = h.orch.suspend("vm1").await.unwrap();
        // Crash after the rename, before the record learned the new path.
        let mut inst = suspended.clone();
        inst.transition(VmState::Resuming);
        h.orch.instances().put(&inst).await.unwrap();
        let active = h
            .orch
            .layout()
            .area_dir(StorageArea::Active)
            .join(suspended.disk().file_name().unwrap());
        std::fs::rename(suspended.disk(), &active).unwrap();

        let report = h.orch.reconcile().await.unwrap();
        assert_eq!(report.settled, vec!["vm1"]);
        assert!(report.inconsistent.is_empty());
        let after = h.orch.get("vm1").await.unwrap();
        assert_eq!(after.state, VmState::Suspended);
        assert!(!after.is_inconsistent());
        assert_eq!(after.disk(), suspended.disk());
        assert!(after.disk().exists());
        assert!(!active.exists());

        h.orch.resume("vm1").await.unwrap();
    }

    #[tokio::test]
    async fn missing_disk_is_flagged() {
        let h = harness();
        let inst = created(&h, "vm1").await;
        std::fs::remove_file(inst.disk()).unwrap();
        let report = h.orch.reconcile().await.unwrap();
        assert_eq!(report.inconsistent, vec!["vm1"]);
        let flagged = h.orch.get("vm1").await.unwrap();
        assert!(flagged.inconsistent.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn unknown_domains_are_orphans() {
        let h = harness();
        running(&h, "vm1").await;
        h.gw().insert_domain("hand-made", DomainState::Running);
        let report = h.orch.reconcile().await.unwrap();
        assert_eq!(report.orphan_domains, vec!["hand-made"]);
        assert!(report.inconsistent.is_empty());
    }

    #[tokio::test]
    async fn report_serializes() {
        let report = ReconcileReport {
            checked: 2,
            settled: vec!["a".into()],
            inconsistent: vec![],
            orphan_domains: vec!["x".into()],
        };
        let json = facet_json::to_string(&report).unwrap();
        assert!(json.contains("\"orphan_domains\""));
    }
}
