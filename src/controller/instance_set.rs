//! Instance set model
//!
//! Works out which instances should exist, which ones go on scale-down and
//! which claims each instance must mount. Nothing here touches the API: the
//! reconciler turns the plan into operations.

use std::collections::BTreeSet;

use kube::ResourceExt;

use crate::controller::observed::{ObservedCluster, PvcStatus};
use crate::controller::operations::Operation;
use crate::crd::PostgresCluster;
use crate::resources::common::{PvcRole, keys};
use crate::resources::pvc::{PVC_STATUS_READY, StorageBindings, generate_pvc};

/// Output of the instance set model for one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceSetPlan {
    pub desired: usize,
    /// Instances with a usable data claim or a pod, by ordinal
    pub existing: Vec<String>,
    /// Instances whose pod reports ready
    pub ready: Vec<String>,
    /// Instances with a pod
    pub with_pod: Vec<String>,
    /// Ordinal the next new instance receives
    pub next_ordinal: u32,
    /// How many instances are missing
    pub missing: usize,
    /// Scale-down victims, in removal order
    pub to_remove: Vec<String>,
    /// Bootstrapped instances whose pod is gone
    pub reattach: Vec<String>,
    /// Claims the spec asks for that a bootstrapped instance does not have
    pub missing_volumes: Vec<(String, PvcRole)>,
    /// Pods that can no longer run: finished, or their data claim is gone
    pub broken_pods: Vec<String>,
    pub healthy_pvc: Vec<String>,
    pub dangling_pvc: Vec<String>,
    pub initializing_pvc: Vec<String>,
}

impl InstanceSetPlan {
    pub fn is_removed(&self, instance: &str) -> bool {
        self.to_remove.iter().any(|name| name == instance)
    }
}

/// Compute the instance set plan
pub fn plan(cluster: &PostgresCluster, observed: &ObservedCluster) -> InstanceSetPlan {
    let desired = usize::try_from(cluster.spec.instances.max(0)).unwrap_or_default();
    let status = cluster.status.clone().unwrap_or_default();
    let protected: BTreeSet<&str> = [status.current_primary.as_str(), status.target_primary.as_str()]
        .into_iter()
        .filter(|name| !name.is_empty())
        .collect();

    let has_data = |instance: &str| {
        observed
            .data_pvc(instance)
            .is_some_and(|pvc| !pvc.terminating)
    };

    let mut result = InstanceSetPlan {
        desired,
        ..Default::default()
    };

    let mut broken = BTreeSet::new();
    for pod in &observed.pods {
        if pod.terminating {
            continue;
        }
        if pod.finished || !has_data(&pod.name) {
            broken.insert(pod.name.clone());
        }
    }

    for instance in observed.instance_names() {
        if !has_data(&instance) {
            continue;
        }
        let pod = observed
            .pod(&instance)
            .filter(|p| !p.terminating && !broken.contains(&p.name));
        if pod.is_some() {
            result.with_pod.push(instance.clone());
        }
        if pod.is_some_and(|p| p.ready) {
            result.ready.push(instance.clone());
        }
        result.existing.push(instance);
    }
    result.broken_pods = broken.into_iter().collect();

    let max_seen = observed
        .pods
        .iter()
        .map(|p| p.ordinal)
        .chain(observed.pvcs.iter().map(|p| p.ordinal))
        .max()
        .unwrap_or(0);
    let latest = u32::try_from(status.latest_generated_node.max(0)).unwrap_or_default();
    result.next_ordinal = latest.max(max_seen) + 1;

    result.missing = desired.saturating_sub(result.existing.len());

    if result.existing.len() > desired {
        let excess = result.existing.len() - desired;
        result.to_remove = removal_order(&result, &protected)
            .into_iter()
            .take(excess)
            .collect();
    }

    for pvc in &observed.pvcs {
        match pvc.status {
            PvcStatus::Initializing => result.initializing_pvc.push(pvc.name.clone()),
            PvcStatus::Ready if result.with_pod.contains(&pvc.instance) => {
                result.healthy_pvc.push(pvc.name.clone())
            }
            PvcStatus::Ready => result.dangling_pvc.push(pvc.name.clone()),
        }
    }

    for instance in &result.existing {
        let bootstrapped = observed
            .data_pvc(instance)
            .is_some_and(|pvc| pvc.status == PvcStatus::Ready);
        if !bootstrapped || result.is_removed(instance) {
            continue;
        }

        if !result.with_pod.contains(instance) && observed.pod(instance).is_none() {
            result.reattach.push(instance.clone());
        }

        let bindings = StorageBindings::for_instance(cluster, instance);
        for (role, claim) in bindings.roles() {
            if role != PvcRole::Data && !observed.pvcs.iter().any(|p| p.name == claim) {
                result.missing_volumes.push((instance.clone(), role));
            }
        }
    }

    result
}

/// Instances without a pod go first, then the highest non-primary ordinals
fn removal_order(plan: &InstanceSetPlan, protected: &BTreeSet<&str>) -> Vec<String> {
    let (mut without_pod, mut with_pod): (Vec<&String>, Vec<&String>) = plan
        .existing
        .iter()
        .filter(|name| !protected.contains(name.as_str()))
        .partition(|name| !plan.with_pod.contains(name));

    // `existing` is in ordinal order
    without_pod.reverse();
    with_pod.reverse();

    without_pod
        .into_iter()
        .chain(with_pod)
        .cloned()
        .collect()
}

/// Operations that remove one instance with everything it owns
pub fn removal_operations(observed: &ObservedCluster, instance: &str) -> Vec<Operation> {
    let mut ops = Vec::new();
    if observed.pod(instance).is_some() {
        ops.push(Operation::DeletePod {
            name: instance.to_string(),
        });
    }
    for job in observed.jobs_of(instance) {
        ops.push(Operation::DeleteJob {
            name: job.name.clone(),
        });
    }
    for pvc in observed.pvcs_of(instance) {
        ops.push(Operation::DeletePvc {
            name: pvc.name.clone(),
        });
    }
    ops
}

/// Claims a bootstrapped instance is missing, created directly as ready
pub fn missing_volume_operations(cluster: &PostgresCluster, plan: &InstanceSetPlan) -> Vec<Operation> {
    plan.missing_volumes
        .iter()
        .filter_map(|(instance, role)| {
            let mut pvc = generate_pvc(cluster, instance, role, None)?;
            if let Some(annotations) = pvc.metadata.annotations.as_mut() {
                annotations.insert(keys::PVC_STATUS.to_string(), PVC_STATUS_READY.to_string());
            }
            tracing::info!(
                cluster = %cluster.name_any(),
                instance = %instance,
                role = %role,
                "Creating missing volume for existing instance"
            );
            Some(Operation::CreatePvc(Box::new(pvc)))
        })
        .collect()
}
