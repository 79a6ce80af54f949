//! Hibernation controller
//!
//! Hibernating shrinks a cluster to its primary's claims. Before the pods go
//! away the primary's claims are annotated with a manifest of the cluster and
//! the primary's `pg_controldata`; everything else is deleted. Resuming reads
//! the record back and rebuilds the primary and the per-cluster objects from
//! the recorded spec, not from edits made while hibernated. Once the primary
//! is back the record is dropped and the live spec applies again, so the
//! bootstrap engine and rolling updates take over from there.

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::controller::error::Result;
use crate::controller::observed::{ObservedCluster, ObservedPvc};
use crate::controller::operations::{AncillaryKind, Operation};
use crate::crd::{ClusterPhase, Condition, PostgresCluster, PostgresClusterSpec, PostgresClusterStatus};
use crate::resources::common::{PvcRole, keys};
use crate::resources::config_map::config_map_name;
use crate::resources::rbac::service_account_name;
use crate::resources::secret::credentials_secret_name;
use crate::resources::service::{r_service_name, ro_service_name, rw_service_name};

/// Condition type reported while hibernating or resuming
pub const HIBERNATION_CONDITION: &str = "Hibernation";

pub mod reasons {
    pub const HIBERNATED: &str = "Hibernated";
    pub const DELETING_PODS: &str = "DeletingPods";
    pub const WAITING_PODS_DELETION: &str = "WaitingPodsDeletion";
    pub const NOT_HEALTHY: &str = "NotHealthy";
    pub const REHYDRATING: &str = "Rehydrating";
    pub const RECORD_MISSING: &str = "RecordMissing";
}

/// Value of the cluster's hibernation annotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HibernationRequest {
    On,
    Off,
    Unset,
}

impl HibernationRequest {
    pub fn from_cluster(cluster: &PostgresCluster) -> Self {
        match cluster.annotations().get(keys::HIBERNATION).map(String::as_str) {
            Some("on") => HibernationRequest::On,
            Some("off") => HibernationRequest::Off,
            _ => HibernationRequest::Unset,
        }
    }
}

/// Serialized form of the cluster kept on the primary's claims
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HibernationManifest {
    pub name: String,
    pub namespace: Option<String>,
    pub spec: PostgresClusterSpec,
    pub current_primary: String,
    pub latest_generated_node: i32,
}

impl HibernationManifest {
    pub fn capture(cluster: &PostgresCluster) -> Self {
        let status = cluster.status.clone().unwrap_or_default();
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace(),
            spec: cluster.spec.clone(),
            current_primary: status.current_primary,
            latest_generated_node: status.latest_generated_node,
        }
    }
}

/// Change to the `Hibernation` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HibernationCondition {
    Set {
        hibernated: bool,
        reason: &'static str,
        message: String,
    },
    Clear,
}

/// Decisions of one hibernation pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HibernationOutcome {
    pub operations: Vec<Operation>,
    pub condition: Option<HibernationCondition>,
    pub phase: Option<(ClusterPhase, String)>,
    /// Hibernation owns this pass; no other controller may run
    pub suspend: bool,
    /// Resuming: failover must not react to the missing primary
    pub rehydrating: bool,
    /// Primary identity taken from a retained record
    pub adopt_primary: Option<String>,
    pub adopt_latest_generated_node: Option<i32>,
    /// Spec recorded at hibernation, used until the primary is back
    pub restore_spec: Option<PostgresClusterSpec>,
}

impl HibernationOutcome {
    fn condition(mut self, hibernated: bool, reason: &'static str, message: impl Into<String>) -> Self {
        self.condition = Some(HibernationCondition::Set {
            hibernated,
            reason,
            message: message.into(),
        });
        self
    }
}

fn current_condition(status: &PostgresClusterStatus) -> Option<&Condition> {
    status
        .conditions
        .iter()
        .find(|c| c.type_ == HIBERNATION_CONDITION)
}

/// Drive hibernation on or off according to the cluster annotation
pub fn reconcile_hibernation(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
) -> Result<HibernationOutcome> {
    let status = cluster.status.clone().unwrap_or_default();
    match HibernationRequest::from_cluster(cluster) {
        HibernationRequest::On => hibernate(cluster, observed, &status),
        HibernationRequest::Off | HibernationRequest::Unset => resume(observed, &status),
    }
}

fn hibernate(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    status: &PostgresClusterStatus,
) -> Result<HibernationOutcome> {
    let mut outcome = HibernationOutcome::default();
    let reason = current_condition(status).map(|c| c.reason.as_str());
    let started = matches!(
        reason,
        Some(reasons::DELETING_PODS | reasons::WAITING_PODS_DELETION | reasons::HIBERNATED)
    );
    let primary = status.current_primary.as_str();

    if !started {
        let healthy = status.phase == Some(ClusterPhase::Healthy)
            && !primary.is_empty()
            && status.current_primary == status.target_primary;
        if !healthy {
            return Ok(outcome.condition(
                false,
                reasons::NOT_HEALTHY,
                "Cluster must be healthy before it can hibernate",
            ));
        }
    }

    let primary_claims: Vec<&ObservedPvc> = observed.pvcs_of(primary).collect();
    if primary_claims.is_empty() {
        outcome.suspend = started;
        return Ok(outcome.condition(
            false,
            reasons::RECORD_MISSING,
            format!("No claims found for primary {}", primary),
        ));
    }

    // Records are written once; an unstarted hibernation may replace a stale one
    let needs_record: Vec<&ObservedPvc> = primary_claims
        .iter()
        .copied()
        .filter(|pvc| pvc.hibernation.is_none() || !started)
        .collect();
    if !needs_record.is_empty() {
        match observed.controldata.as_ref() {
            Some(controldata) => {
                let manifest = serde_json::to_string(&HibernationManifest::capture(cluster))?;
                for pvc in needs_record {
                    outcome.operations.push(Operation::AnnotatePvc {
                        name: pvc.name.clone(),
                        annotations: [
                            (keys::HIBERNATION_CLUSTER_MANIFEST.to_string(), Some(manifest.clone())),
                            (keys::HIBERNATION_PG_CONTROLDATA.to_string(), Some(controldata.clone())),
                        ]
                        .into_iter()
                        .collect(),
                    });
                }
            }
            None if primary_claims.iter().all(|pvc| pvc.hibernation.is_some()) => {}
            None => {
                outcome.suspend = started;
                return Ok(outcome.condition(
                    false,
                    reasons::NOT_HEALTHY,
                    format!("Waiting for pg_controldata of primary {}", primary),
                ));
            }
        }
    }

    let live_pods: Vec<&str> = observed
        .pods
        .iter()
        .filter(|p| !p.terminating)
        .map(|p| p.name.as_str())
        .collect();
    outcome.suspend = true;

    if !live_pods.is_empty() {
        // Only after the records are in place
        for pod in live_pods {
            outcome.operations.push(Operation::DeletePod {
                name: pod.to_string(),
            });
        }
        return Ok(outcome.condition(false, reasons::DELETING_PODS, "Deleting instance pods"));
    }
    if !observed.pods.is_empty() {
        return Ok(outcome.condition(
            false,
            reasons::WAITING_PODS_DELETION,
            "Waiting for instance pods to terminate",
        ));
    }

    for job in &observed.jobs {
        outcome.operations.push(Operation::DeleteJob {
            name: job.name.clone(),
        });
    }
    for pvc in observed.pvcs.iter().filter(|p| p.instance != primary && !p.terminating) {
        outcome.operations.push(Operation::DeletePvc {
            name: pvc.name.clone(),
        });
    }
    if reason != Some(reasons::HIBERNATED) {
        outcome.operations.extend(ancillary_deletions(&cluster.name_any()));
        outcome
            .operations
            .push(Operation::normal("Hibernated", format!("Cluster hibernated on {}", primary)));
    }

    outcome.phase = Some((ClusterPhase::Hibernated, "Cluster is hibernated".to_string()));
    Ok(outcome.condition(true, reasons::HIBERNATED, "Cluster is hibernated"))
}

fn ancillary_deletions(cluster_name: &str) -> Vec<Operation> {
    let rbac = service_account_name(cluster_name);
    [
        (AncillaryKind::Service, rw_service_name(cluster_name)),
        (AncillaryKind::Service, ro_service_name(cluster_name)),
        (AncillaryKind::Service, r_service_name(cluster_name)),
        (AncillaryKind::ConfigMap, config_map_name(cluster_name)),
        (AncillaryKind::Secret, credentials_secret_name(cluster_name)),
        (AncillaryKind::RoleBinding, rbac.clone()),
        (AncillaryKind::Role, rbac.clone()),
        (AncillaryKind::ServiceAccount, rbac),
    ]
    .into_iter()
    .map(|(kind, name)| Operation::DeleteAncillary { kind, name })
    .collect()
}

/// Retained data claim carrying a record, preferring the recorded primary
fn record_claim<'a>(observed: &'a ObservedCluster, primary: &str) -> Option<&'a ObservedPvc> {
    let mut candidates = observed
        .pvcs
        .iter()
        .filter(|p| p.role == PvcRole::Data && p.hibernation.is_some() && !p.terminating);
    if primary.is_empty() {
        candidates.min_by_key(|p| p.ordinal)
    } else {
        candidates.find(|p| p.instance == primary)
    }
}

fn resume(observed: &ObservedCluster, status: &PostgresClusterStatus) -> Result<HibernationOutcome> {
    let mut outcome = HibernationOutcome::default();
    let condition = current_condition(status);
    let hibernated = status.phase == Some(ClusterPhase::Hibernated)
        || condition.is_some_and(|c| c.reason == reasons::HIBERNATED);
    let primary = status.current_primary.as_str();
    let record = record_claim(observed, primary);
    let adopting = primary.is_empty() && record.is_some();

    if condition.is_none() && !hibernated && !adopting {
        return Ok(outcome);
    }

    let primary_up = !primary.is_empty()
        && observed.pod(primary).is_some_and(|p| p.ready)
        && observed.is_primary(primary);
    if primary_up {
        for pvc in observed.pvcs_of(primary).filter(|p| p.hibernation.is_some()) {
            outcome.operations.push(Operation::AnnotatePvc {
                name: pvc.name.clone(),
                annotations: [
                    (keys::HIBERNATION_CLUSTER_MANIFEST.to_string(), None),
                    (keys::HIBERNATION_PG_CONTROLDATA.to_string(), None),
                ]
                .into_iter()
                .collect(),
            });
        }
        if condition.is_some() {
            outcome
                .operations
                .push(Operation::normal("Resumed", format!("Primary {} is back", primary)));
        }
        outcome.condition = Some(HibernationCondition::Clear);
        return Ok(outcome);
    }

    let Some(claim) = record else {
        if hibernated {
            outcome.suspend = true;
            return Ok(outcome.condition(
                false,
                reasons::RECORD_MISSING,
                "No retained claim carries a hibernation record",
            ));
        }
        // Record already consumed, waiting for the primary to come up
        outcome.rehydrating = true;
        return Ok(outcome.condition(false, reasons::REHYDRATING, "Waiting for primary"));
    };

    let Some(record) = claim.hibernation.as_ref() else {
        return Ok(outcome);
    };
    let manifest: HibernationManifest = match serde_json::from_str(&record.manifest) {
        Ok(manifest) => manifest,
        Err(e) => {
            outcome.suspend = true;
            return Ok(outcome.condition(
                false,
                reasons::RECORD_MISSING,
                format!("Hibernation record on {} is unreadable: {}", claim.name, e),
            ));
        }
    };

    if primary.is_empty() {
        let adopted = if manifest.current_primary == claim.instance {
            manifest.current_primary.clone()
        } else {
            claim.instance.clone()
        };
        tracing::info!(primary = %adopted, "Adopting primary from hibernation record");
        outcome.adopt_primary = Some(adopted);
        outcome.adopt_latest_generated_node = Some(manifest.latest_generated_node);
    }

    outcome.restore_spec = Some(manifest.spec);
    outcome.rehydrating = true;
    Ok(outcome.condition(
        false,
        reasons::REHYDRATING,
        format!("Resuming from claims of {}", claim.instance),
    ))
}
