use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker stored in `targetPrimary` while a failover waits for WAL receivers to stop
pub const PENDING_FAILOVER_MARKER: &str = "pending";

/// Default prefix of high-availability replication slot names
pub const DEFAULT_HA_SLOT_PREFIX: &str = "_pto_";

/// Default PostgreSQL image for instances and bootstrap jobs
pub const DEFAULT_IMAGE_NAME: &str = "ghcr.io/smoketurner/postgres-instance:17";

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyInstances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of instances (one primary, the rest replicas)
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// Container image running PostgreSQL and the instance agent
    #[serde(default = "default_image_name")]
    pub image_name: String,

    /// Storage for PGDATA
    pub storage: StorageSpec,

    /// Dedicated storage for the write-ahead log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_storage: Option<StorageSpec>,

    /// Tablespaces, each with its own volume per instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tablespaces: Vec<TablespaceSpec>,

    /// Replication slot management
    #[serde(default)]
    pub replication_slots: ReplicationSlotsSpec,

    /// How the primary is updated when a restart is required
    #[serde(default)]
    pub primary_update_method: PrimaryUpdateMethod,

    /// Resource requirements for instance pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Per-resource restart policy applied when resources change
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resize_policy: Vec<ResizePolicy>,

    /// PostgreSQL configuration parameters (postgresql.conf)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub postgresql_params: BTreeMap<String, String>,

    /// How new instances obtain their data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapSpec>,

    /// Seconds to wait before failing over an unhealthy primary
    #[serde(default)]
    pub failover_delay: i64,
}

fn default_instances() -> i32 {
    1
}

fn default_image_name() -> String {
    DEFAULT_IMAGE_NAME.to_string()
}

/// Storage configuration for a persistent volume
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi", "100Gi")
    pub size: String,
}

/// A tablespace backed by one volume per instance
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TablespaceSpec {
    /// Tablespace name inside PostgreSQL
    pub name: String,

    /// Volume backing the tablespace
    pub storage: StorageSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSlotsSpec {
    #[serde(default)]
    pub high_availability: HighAvailabilitySlotsSpec,
}

/// One physical slot per replica, kept on the primary and mirrored on replicas
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HighAvailabilitySlotsSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,
}

impl Default for HighAvailabilitySlotsSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            slot_prefix: default_slot_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_slot_prefix() -> String {
    DEFAULT_HA_SLOT_PREFIX.to_string()
}

/// Strategy used to apply a restart-requiring change to the primary
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum PrimaryUpdateMethod {
    /// Restart the primary in place
    #[default]
    Restart,
    /// Hand the primary role to the most advanced replica first
    Switchover,
}

/// Resource requirements for instance pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Restart policy for one container resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResizePolicy {
    pub resource_name: ResourceName,
    #[serde(default)]
    pub restart_policy: ResizeRestartPolicy,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceName::Cpu => write!(f, "cpu"),
            ResourceName::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ResizeRestartPolicy {
    #[default]
    NotRequired,
    RestartContainer,
}

impl std::fmt::Display for ResizeRestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResizeRestartPolicy::NotRequired => write!(f, "NotRequired"),
            ResizeRestartPolicy::RestartContainer => write!(f, "RestartContainer"),
        }
    }
}

/// Bootstrap configuration for new instances
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    #[serde(default)]
    pub replica_join: ReplicaJoinMethod,

    /// VolumeSnapshots usable by `VolumeSnapshot` joins, most recent first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_names: Vec<String>,
}

/// How a new replica gets its first copy of the data
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ReplicaJoinMethod {
    /// Streaming copy from the current primary
    #[default]
    Streaming,
    /// Provision the data volume from a VolumeSnapshot
    VolumeSnapshot,
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,

    /// Human readable detail for the phase
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase_reason: String,

    /// Instance currently accepting writes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_primary: String,

    /// Instance the reconciler is converging toward
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_primary: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_primary_timestamp: Option<String>,

    /// When the current primary was first seen unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary_failing_since_timestamp: Option<String>,

    /// Number of instances reporting ready
    #[serde(default)]
    pub ready_instances: i32,

    /// Number of instances with a pod
    #[serde(default)]
    pub instances: i32,

    /// Names of every instance known to the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_names: Vec<String>,

    /// Highest ordinal ever assigned
    #[serde(default)]
    pub latest_generated_node: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub healthy_pvc: Vec<String>,

    /// PVCs of instances whose pod is missing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dangling_pvc: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initializing_pvc: Vec<String>,

    /// Replicas whose HA slot was last confirmed on the primary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ha_slot_instances: Vec<String>,

    /// Instances whose PostgreSQL is stopped by the fenced instances annotation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fenced_instances: Vec<String>,

    /// Snapshots that failed to recover and must not be used again
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_snapshots: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_architectures: Vec<AvailableArchitecture>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Content hash of the instance agent for one CPU architecture
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableArchitecture {
    #[serde(rename = "goArch")]
    pub arch: String,
    pub hash: String,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// The first instance is being initialized
    SettingUpPrimary,
    /// A new replica is being bootstrapped
    CreatingReplica,
    /// Instances exist but not all of them are ready
    WaitingForInstances,
    /// Topology is converged
    Healthy,
    /// The primary was lost and a replacement is being promoted
    FailingOver,
    /// The primary role is being handed to a named replica
    SwitchingOver,
    /// Instances are being restarted for a configuration change
    UpgradingCluster,
    /// Suspended to the primary's storage
    Hibernated,
}

impl ClusterPhase {
    /// Phases that describe work in flight rather than a settled state
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ClusterPhase::CreatingReplica
                | ClusterPhase::WaitingForInstances
                | ClusterPhase::FailingOver
                | ClusterPhase::SwitchingOver
                | ClusterPhase::UpgradingCluster
        )
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::SettingUpPrimary => write!(f, "SettingUpPrimary"),
            ClusterPhase::CreatingReplica => write!(f, "CreatingReplica"),
            ClusterPhase::WaitingForInstances => write!(f, "WaitingForInstances"),
            ClusterPhase::Healthy => write!(f, "Healthy"),
            ClusterPhase::FailingOver => write!(f, "FailingOver"),
            ClusterPhase::SwitchingOver => write!(f, "SwitchingOver"),
            ClusterPhase::UpgradingCluster => write!(f, "UpgradingCluster"),
            ClusterPhase::Hibernated => write!(f, "Hibernated"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PostgresCluster {
    /// Whether HA replication slots are managed for this cluster
    pub fn ha_slots_enabled(&self) -> bool {
        self.spec.replication_slots.high_availability.enabled
    }

    /// Prefix used for HA replication slot names
    pub fn ha_slot_prefix(&self) -> &str {
        &self.spec.replication_slots.high_availability.slot_prefix
    }

    /// Replica join method, defaulting to a streaming copy
    pub fn replica_join(&self) -> ReplicaJoinMethod {
        self.spec
            .bootstrap
            .as_ref()
            .map(|b| b.replica_join)
            .unwrap_or_default()
    }

    /// First configured snapshot that has not been excluded by a failed recovery
    pub fn usable_snapshot(&self) -> Option<&str> {
        let excluded = self
            .status
            .as_ref()
            .map(|s| s.excluded_snapshots.as_slice())
            .unwrap_or_default();
        self.spec
            .bootstrap
            .as_ref()?
            .snapshot_names
            .iter()
            .find(|name| !excluded.contains(name))
            .map(String::as_str)
    }
}
