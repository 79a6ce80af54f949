//! Instance pod generation
//!
//! Each instance runs as a bare pod (no StatefulSet) so that the operator,
//! not a workload controller, decides which claims a recreated pod mounts and
//! which instance carries the primary role label.
//!
//! The container runs PostgreSQL under the instance agent. The agent watches
//! its own `role` label: `primary` means promote (or stay primary), `replica`
//! means follow the `-rw` service.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, ContainerResizePolicy, EnvVar, EnvVarSource,
    HTTPGetAction, ObjectFieldSelector, Pod, PodSecurityContext, PodSpec, Probe,
    ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{PostgresCluster, ResourceList};
use crate::postgres::config::restart_params;
use crate::resources::common::{InstanceRole, instance_labels, keys, owner_reference};
use crate::resources::config_map::config_map_name;
use crate::resources::postgres_client::POSTGRES_PORT;
use crate::resources::pvc::{PGDATA_PATH, StorageBindings, WAL_MOUNT_PATH};
use crate::resources::rbac::service_account_name;
use crate::resources::secret::{
    POSTGRES_PASSWORD_KEY, REPLICATION_PASSWORD_KEY, credentials_secret_name,
};
use crate::resources::service::rw_service_name;

/// Name of the PostgreSQL container in instance pods
pub const POSTGRES_CONTAINER: &str = "postgres";

/// Mount point of the rendered configuration
pub const CONFIG_MOUNT_PATH: &str = "/etc/postgresql/conf.d";

/// Hash of everything in the pod template that needs a restart to change
///
/// Resources are compared separately because they may be resized in place.
pub fn pod_spec_hash(cluster: &PostgresCluster) -> String {
    let mut hasher = DefaultHasher::new();
    cluster.spec.image_name.hash(&mut hasher);
    restart_params(&cluster.spec.postgresql_params).hash(&mut hasher);
    cluster.spec.wal_storage.is_some().hash(&mut hasher);
    for tbs in &cluster.spec.tablespaces {
        tbs.name.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

fn resource_map(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Container resources requested by the cluster spec
pub fn container_resources(cluster: &PostgresCluster) -> Option<ResourceRequirements> {
    cluster
        .spec
        .resources
        .as_ref()
        .map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(resource_map),
            requests: r.requests.as_ref().map(resource_map),
            ..Default::default()
        })
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment shared by instance pods and bootstrap jobs
pub fn instance_env(
    cluster: &PostgresCluster,
    bindings: &StorageBindings,
    agent_port: u16,
) -> Vec<EnvVar> {
    let cluster_name = cluster.name_any();
    let secret_name = credentials_secret_name(&cluster_name);

    let mut env = vec![
        value_env("CLUSTER_NAME", cluster_name.clone()),
        value_env("INSTANCE_NAME", bindings.instance.clone()),
        field_env("POD_NAMESPACE", "metadata.namespace"),
        field_env("POD_IP", "status.podIP"),
        value_env("PGDATA", PGDATA_PATH),
        value_env("PRIMARY_HOST", rw_service_name(&cluster_name)),
        value_env("AGENT_PORT", agent_port.to_string()),
        secret_env("POSTGRES_PASSWORD", &secret_name, POSTGRES_PASSWORD_KEY),
        secret_env("REPLICATION_PASSWORD", &secret_name, REPLICATION_PASSWORD_KEY),
    ];
    if bindings.wal.is_some() {
        env.push(value_env("PGWAL", WAL_MOUNT_PATH));
    }
    if !bindings.tablespaces.is_empty() {
        let names: Vec<&str> = bindings.tablespaces.keys().map(String::as_str).collect();
        env.push(value_env("TABLESPACES", names.join(",")));
    }
    env
}

/// Volumes and mounts shared by instance pods and bootstrap jobs
pub fn instance_volumes(
    cluster: &PostgresCluster,
    bindings: &StorageBindings,
) -> (Vec<Volume>, Vec<VolumeMount>) {
    let (mut volumes, mut mounts) = bindings.volumes_and_mounts();
    volumes.push(Volume {
        name: "pg-config".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name(&cluster.name_any()),
            default_mode: Some(0o644),
            ..Default::default()
        }),
        ..Default::default()
    });
    mounts.push(VolumeMount {
        name: "pg-config".to_string(),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    });
    (volumes, mounts)
}

fn agent_probe(path: &str, agent_port: u16, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(i32::from(agent_port)),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Generate the pod of one instance
pub fn generate_instance_pod(
    cluster: &PostgresCluster,
    bindings: &StorageBindings,
    role: InstanceRole,
    agent_port: u16,
) -> Pod {
    let cluster_name = cluster.name_any();

    let mut labels = instance_labels(&cluster_name, &bindings.instance);
    labels.insert(keys::INSTANCE_ROLE.to_string(), role.as_str().to_string());

    let annotations = BTreeMap::from([(keys::POD_SPEC_HASH.to_string(), pod_spec_hash(cluster))]);

    let (volumes, volume_mounts) = instance_volumes(cluster, bindings);

    let resize_policy: Vec<ContainerResizePolicy> = cluster
        .spec
        .resize_policy
        .iter()
        .map(|p| ContainerResizePolicy {
            resource_name: p.resource_name.to_string(),
            restart_policy: p.restart_policy.to_string(),
        })
        .collect();

    let container = Container {
        name: POSTGRES_CONTAINER.to_string(),
        image: Some(cluster.spec.image_name.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec!["instance".to_string(), "run".to_string()]),
        ports: Some(vec![
            ContainerPort {
                container_port: i32::from(POSTGRES_PORT),
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: i32::from(agent_port),
                name: Some("agent".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(instance_env(cluster, bindings, agent_port)),
        volume_mounts: Some(volume_mounts),
        resources: container_resources(cluster),
        resize_policy: if resize_policy.is_empty() {
            None
        } else {
            Some(resize_policy)
        },
        startup_probe: Some(agent_probe("/healthz", agent_port, 60)),
        readiness_probe: Some(agent_probe("/readyz", agent_port, 3)),
        liveness_probe: Some(agent_probe("/healthz", agent_port, 6)),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(bindings.instance.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(bindings.instance.clone()),
            service_account_name: Some(service_account_name(&cluster_name)),
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Always".to_string()),
            termination_grace_period_seconds: Some(30),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                fs_group: Some(26),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
