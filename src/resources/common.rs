//! Common utilities for Kubernetes resource generation
//!
//! This module holds the labeling contract consumed by external tooling
//! (label and annotation keys, instance and volume naming) and the helpers
//! every generator uses to stamp ownership onto child resources.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// API version for PostgresCluster CRD
pub const API_VERSION: &str = "postgres-operator.smoketurner.com/v1alpha1";

/// Kind for PostgresCluster CRD
pub const KIND: &str = "PostgresCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "postgres-topology-operator";

/// Label and annotation keys
pub mod keys {
    pub const CLUSTER: &str = "postgres-operator.smoketurner.com/cluster";
    pub const INSTANCE_NAME: &str = "postgres-operator.smoketurner.com/instance-name";
    pub const INSTANCE_ROLE: &str = "postgres-operator.smoketurner.com/role";
    pub const PVC_ROLE: &str = "postgres-operator.smoketurner.com/pvc-role";
    pub const TABLESPACE_NAME: &str = "postgres-operator.smoketurner.com/tablespace-name";
    pub const JOB_ROLE: &str = "postgres-operator.smoketurner.com/job-role";

    pub const PVC_STATUS: &str = "postgres-operator.smoketurner.com/pvc-status";
    pub const FALLBACK_ELIGIBLE: &str = "postgres-operator.smoketurner.com/fallback-eligible";
    pub const JOB_ATTEMPT: &str = "postgres-operator.smoketurner.com/job-attempt";
    pub const POD_SPEC_HASH: &str = "postgres-operator.smoketurner.com/pod-spec-hash";
    pub const HIBERNATION: &str = "postgres-operator.smoketurner.com/hibernation";
    pub const HIBERNATION_CLUSTER_MANIFEST: &str =
        "postgres-operator.smoketurner.com/hibernation-cluster-manifest";
    pub const HIBERNATION_PG_CONTROLDATA: &str =
        "postgres-operator.smoketurner.com/hibernation-pgcontroldata";
    /// Cluster annotation: JSON list of fenced instances, `"*"` fences all
    pub const FENCED_INSTANCES: &str = "postgres-operator.smoketurner.com/fenced-instances";
    /// Pod annotation the instance agent stops PostgreSQL on
    pub const FENCED: &str = "postgres-operator.smoketurner.com/fenced";
}

/// Role of an instance as published on its pod
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceRole {
    Primary,
    Replica,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Primary => "primary",
            InstanceRole::Replica => "replica",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(InstanceRole::Primary),
            "replica" => Some(InstanceRole::Replica),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a managed volume
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PvcRole {
    Data,
    Wal,
    Tablespace(String),
}

impl PvcRole {
    /// Value stored in the `pvc-role` label
    pub fn label_value(&self) -> &'static str {
        match self {
            PvcRole::Data => "pg-data",
            PvcRole::Wal => "pg-wal",
            PvcRole::Tablespace(_) => "pg-tablespace",
        }
    }

    /// Rebuild the role from the `pvc-role` and `tablespace-name` labels
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        match labels.get(keys::PVC_ROLE).map(String::as_str) {
            Some("pg-data") => Some(PvcRole::Data),
            Some("pg-wal") => Some(PvcRole::Wal),
            Some("pg-tablespace") => labels
                .get(keys::TABLESPACE_NAME)
                .map(|name| PvcRole::Tablespace(name.clone())),
            _ => None,
        }
    }

    /// Name of the claim holding this role for an instance
    pub fn pvc_name(&self, instance: &str) -> String {
        match self {
            PvcRole::Data => instance.to_string(),
            PvcRole::Wal => format!("{instance}-wal"),
            PvcRole::Tablespace(name) => format!("{instance}-tbs-{name}"),
        }
    }
}

impl fmt::Display for PvcRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvcRole::Tablespace(name) => write!(f, "pg-tablespace:{name}"),
            other => f.write_str(other.label_value()),
        }
    }
}

/// Name of the instance holding `ordinal`
pub fn instance_name(cluster_name: &str, ordinal: u32) -> String {
    format!("{cluster_name}-{ordinal}")
}

/// Ordinal encoded in an instance name, if it belongs to the cluster
pub fn instance_ordinal(cluster_name: &str, instance: &str) -> Option<u32> {
    instance
        .strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
        .filter(|ordinal| *ordinal > 0)
}

/// Generate an owner reference for a PostgresCluster
///
/// This ensures that all child resources are properly owned by the cluster
/// and will be garbage collected when the cluster is deleted.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (keys::CLUSTER.to_string(), cluster_name.to_string()),
    ])
}

/// Labels shared by every object tied to one instance
pub fn instance_labels(cluster_name: &str, instance: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(keys::INSTANCE_NAME.to_string(), instance.to_string());
    labels
}

/// Label selector matching every managed object of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", keys::CLUSTER, cluster_name)
}
