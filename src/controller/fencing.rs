//! Fencing
//!
//! The cluster annotation `fenced-instances` holds a JSON list of instance
//! names, or `["*"]` to fence every instance. A fenced instance keeps its pod
//! and claims; the operator marks the pod and the instance agent stops
//! PostgreSQL on it. While the current primary is fenced no failover or
//! switchover is started.

use std::collections::BTreeSet;

use kube::ResourceExt;

use crate::controller::instance_set::InstanceSetPlan;
use crate::controller::observed::ObservedCluster;
use crate::controller::operations::Operation;
use crate::crd::PostgresCluster;
use crate::resources::common::keys;

/// Entry of the fenced list that fences every instance
pub const FENCE_ALL_INSTANCES: &str = "*";

/// Parsed value of the `fenced-instances` annotation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FencedInstances {
    all: bool,
    names: BTreeSet<String>,
}

impl FencedInstances {
    pub fn parse(value: &str) -> Result<Self, serde_json::Error> {
        let names: BTreeSet<String> = serde_json::from_str(value)?;
        Ok(Self {
            all: names.contains(FENCE_ALL_INSTANCES),
            names,
        })
    }

    /// A missing annotation fences nothing
    pub fn from_cluster(cluster: &PostgresCluster) -> Result<Self, serde_json::Error> {
        match cluster.annotations().get(keys::FENCED_INSTANCES) {
            Some(value) => Self::parse(value),
            None => Ok(Self::default()),
        }
    }

    pub fn is_fenced(&self, instance: &str) -> bool {
        self.all || self.names.contains(instance)
    }
}

/// Decisions of one fencing pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FencingOutcome {
    pub operations: Vec<Operation>,
    /// Instances fenced after this pass, in ordinal order
    pub fenced: Vec<String>,
}

impl FencingOutcome {
    pub fn is_fenced(&self, instance: &str) -> bool {
        self.fenced.iter().any(|name| name == instance)
    }
}

/// Bring the fence mark on every pod in line with the annotation
///
/// An unreadable annotation changes nothing: pods keep the mark they have.
pub fn reconcile_fencing(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
) -> FencingOutcome {
    let mut outcome = FencingOutcome::default();
    let requested = match FencedInstances::from_cluster(cluster) {
        Ok(requested) => Some(requested),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unreadable fenced instances annotation");
            outcome.operations.push(Operation::warning(
                "InvalidFencing",
                format!("{} is not a JSON list of instance names: {}", keys::FENCED_INSTANCES, e),
            ));
            None
        }
    };
    let wanted = |instance: &str, current: bool| match &requested {
        Some(requested) => requested.is_fenced(instance),
        None => current,
    };

    for pod in observed.pods.iter().filter(|p| !p.terminating) {
        let fenced = wanted(&pod.name, pod.fenced);
        if fenced == pod.fenced {
            continue;
        }
        tracing::info!(instance = %pod.name, fenced, "Changing instance fence");
        outcome.operations.push(Operation::SetPodFencing {
            name: pod.name.clone(),
            fenced,
        });
        outcome.operations.push(if fenced {
            Operation::normal("Fenced", format!("Stopping PostgreSQL on {}", pod.name))
        } else {
            Operation::normal("Unfenced", format!("Starting PostgreSQL on {}", pod.name))
        });
    }

    outcome.fenced = plan
        .existing
        .iter()
        .filter(|name| wanted(name, observed.pod(name).is_some_and(|p| p.fenced)))
        .cloned()
        .collect();
    outcome
}

/// Pods created for fenced instances start with the mark already set
pub fn mark_new_pods(operations: &mut [Operation], fencing: &FencingOutcome) {
    for op in operations {
        let Operation::CreatePod(pod) = op else {
            continue;
        };
        if fencing.is_fenced(&pod.name_any()) {
            pod.annotations_mut()
                .insert(keys::FENCED.to_string(), "true".to_string());
        }
    }
}
