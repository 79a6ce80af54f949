//! Bootstrap job generation
//!
//! A bootstrap job mounts the claims of exactly one instance, fills them
//! (initdb, streaming copy or snapshot recovery) and exits. Jobs never retry
//! on their own: the bootstrap engine decides what replaces a failed job.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::bootstrap::JobRole;
use crate::crd::PostgresCluster;
use crate::resources::common::{instance_labels, keys, owner_reference};
use crate::resources::pod::{POSTGRES_CONTAINER, container_resources, instance_env, instance_volumes};
use crate::resources::pvc::StorageBindings;
use crate::resources::rbac::service_account_name;

/// Name of a bootstrap job; retries carry their attempt number
pub fn job_name(instance: &str, role: JobRole, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}-{}", instance, role.as_str())
    } else {
        format!("{}-{}-{}", instance, role.as_str(), attempt)
    }
}

/// Generate the job that bootstraps the claims in `bindings`
pub fn generate_bootstrap_job(
    cluster: &PostgresCluster,
    bindings: &StorageBindings,
    role: JobRole,
    attempt: u32,
    agent_port: u16,
) -> Job {
    let cluster_name = cluster.name_any();
    let name = job_name(&bindings.instance, role, attempt);

    let mut labels = instance_labels(&cluster_name, &bindings.instance);
    labels.insert(keys::JOB_ROLE.to_string(), role.as_str().to_string());

    let annotations = BTreeMap::from([
        (
            keys::FALLBACK_ELIGIBLE.to_string(),
            role.fallback().is_some().to_string(),
        ),
        (keys::JOB_ATTEMPT.to_string(), attempt.to_string()),
    ]);

    let (volumes, volume_mounts) = instance_volumes(cluster, bindings);

    let container = Container {
        name: POSTGRES_CONTAINER.to_string(),
        image: Some(cluster.spec.image_name.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            "instance".to_string(),
            "bootstrap".to_string(),
            "--role".to_string(),
            role.as_str().to_string(),
        ]),
        env: Some(instance_env(cluster, bindings, agent_port)),
        volume_mounts: Some(volume_mounts),
        resources: container_resources(cluster),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account_name(&cluster_name)),
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
