//! Rolling updates and in-place resize
//!
//! Pods whose template hash no longer matches the cluster are recreated one
//! at a time on the same claims: replicas first, then the primary, which is
//! either restarted in place or handed over to the most advanced replica.
//! Resource changes that every affected resource allows without a restart are
//! patched onto running pods instead.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::controller::failover::{candidates, pick_winner};
use crate::controller::instance_set::InstanceSetPlan;
use crate::controller::observed::{ObservedCluster, ObservedPod};
use crate::controller::operations::Operation;
use crate::crd::{ClusterPhase, PostgresCluster, PrimaryUpdateMethod, ResizeRestartPolicy, ResourceName};
use crate::resources::pod::{container_resources, pod_spec_hash};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollingUpdateOutcome {
    pub operations: Vec<Operation>,
    /// Replica that should take over before the primary is updated
    pub switchover_to: Option<String>,
    pub phase: Option<(ClusterPhase, String)>,
    /// An instance is being restarted
    pub in_flight: bool,
}

type Section = fn(&ResourceRequirements) -> Option<&BTreeMap<String, Quantity>>;

fn limits(r: &ResourceRequirements) -> Option<&BTreeMap<String, Quantity>> {
    r.limits.as_ref()
}

fn requests(r: &ResourceRequirements) -> Option<&BTreeMap<String, Quantity>> {
    r.requests.as_ref()
}

fn quantities(resources: Option<&ResourceRequirements>, section: Section) -> BTreeMap<String, Quantity> {
    resources.and_then(section).cloned().unwrap_or_default()
}

/// Names of resources whose requests or limits differ
pub fn changed_resources(
    current: Option<&ResourceRequirements>,
    desired: Option<&ResourceRequirements>,
) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for section in [limits as Section, requests as Section] {
        let a = quantities(current, section);
        let b = quantities(desired, section);
        for key in a.keys().chain(b.keys()) {
            if a.get(key) != b.get(key) {
                changed.insert(key.clone());
            }
        }
    }
    changed
}

/// Whether every changed resource may be resized without a restart
fn resizable_in_place(cluster: &PostgresCluster, changed: &BTreeSet<String>) -> bool {
    changed.iter().all(|name| {
        let policy = cluster
            .spec
            .resize_policy
            .iter()
            .find(|p| match p.resource_name {
                ResourceName::Cpu => name == "cpu",
                ResourceName::Memory => name == "memory",
            })
            .map(|p| p.restart_policy)
            .unwrap_or_default();
        policy == ResizeRestartPolicy::NotRequired
    })
}

/// Decide which pod to update next
///
/// `primary` is the current primary when the topology is stable; updates
/// only start when every instance has a ready pod and nothing else is in flight.
pub fn reconcile_rolling_update(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    primary: Option<&str>,
    busy: bool,
) -> RollingUpdateOutcome {
    let mut outcome = RollingUpdateOutcome::default();
    let desired_hash = pod_spec_hash(cluster);
    let desired_resources = container_resources(cluster);
    let upgrading = cluster
        .status
        .as_ref()
        .is_some_and(|s| s.phase == Some(ClusterPhase::UpgradingCluster));

    let pods: Vec<&ObservedPod> = plan
        .with_pod
        .iter()
        .filter(|name| !plan.is_removed(name))
        .filter_map(|name| observed.pod(name))
        .collect();

    let mut stale = Vec::new();
    for pod in &pods {
        let changed = match desired_resources.as_ref() {
            Some(desired) => changed_resources(pod.resources.as_ref(), Some(desired)),
            None => BTreeSet::new(),
        };
        let hash_stale = pod.spec_hash.as_deref() != Some(desired_hash.as_str());
        if hash_stale || (!changed.is_empty() && !resizable_in_place(cluster, &changed)) {
            stale.push(*pod);
        } else if !changed.is_empty() {
            if let Some(resources) = desired_resources.clone() {
                outcome.operations.push(Operation::ResizePod {
                    name: pod.name.clone(),
                    resources,
                });
            }
        }
    }

    let all_ready = plan
        .existing
        .iter()
        .filter(|name| !plan.is_removed(name))
        .all(|name| plan.ready.contains(name));
    if stale.is_empty() {
        if upgrading && !all_ready {
            // A restarted pod is still coming back
            outcome.in_flight = true;
            outcome.phase = Some((
                ClusterPhase::UpgradingCluster,
                "Waiting for restarted instances".to_string(),
            ));
        }
        return outcome;
    }

    outcome.phase = Some((
        ClusterPhase::UpgradingCluster,
        format!("{} instances need a restart", stale.len()),
    ));
    let Some(primary) = primary else {
        return outcome;
    };
    if busy || !all_ready {
        outcome.in_flight = upgrading;
        return outcome;
    }

    // Replicas first, lowest ordinal first
    if let Some(replica) = stale.iter().find(|p| p.name != primary) {
        tracing::info!(instance = %replica.name, "Restarting replica for pod spec change");
        outcome.operations.push(Operation::DeletePod {
            name: replica.name.clone(),
        });
        outcome.in_flight = true;
        outcome.phase = Some((
            ClusterPhase::UpgradingCluster,
            format!("Restarting replica {}", replica.name),
        ));
        return outcome;
    }

    let method = cluster.spec.primary_update_method;
    let successor = candidates(observed, plan, primary, None);
    match (method, pick_winner(&successor, None)) {
        (PrimaryUpdateMethod::Switchover, Some(winner)) => {
            tracing::info!(to = %winner.name, "Handing over primary before update");
            outcome.switchover_to = Some(winner.name.clone());
        }
        _ => {
            tracing::info!(instance = %primary, "Restarting primary for pod spec change");
            outcome.operations.push(Operation::DeletePod {
                name: primary.to_string(),
            });
            outcome.phase = Some((
                ClusterPhase::UpgradingCluster,
                format!("Restarting primary {}", primary),
            ));
        }
    }
    outcome.in_flight = true;
    outcome
}

/// The primary pod is gone because a rolling update restarted it
pub fn is_planned_primary_restart(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    primary: &str,
) -> bool {
    let upgrading = cluster
        .status
        .as_ref()
        .is_some_and(|s| s.phase == Some(ClusterPhase::UpgradingCluster));
    let pod_restarting = match observed.pod(primary) {
        None => plan.reattach.iter().any(|name| name == primary),
        Some(pod) => pod.terminating || (!pod.ready && !pod.finished),
    };
    upgrading && pod_restarting
}
