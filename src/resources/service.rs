//! Service generation
//!
//! Services route on the `role` label the operator stamps onto instance pods,
//! so a promotion moves traffic as soon as the labels change:
//!
//! - `<cluster>-rw`: the primary
//! - `<cluster>-ro`: replicas only
//! - `<cluster>-r`: any instance

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec as K8sServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::PostgresCluster;
use crate::resources::common::{InstanceRole, keys, owner_reference, standard_labels};
use crate::resources::postgres_client::POSTGRES_PORT;

pub fn rw_service_name(cluster_name: &str) -> String {
    format!("{}-rw", cluster_name)
}

pub fn ro_service_name(cluster_name: &str) -> String {
    format!("{}-ro", cluster_name)
}

pub fn r_service_name(cluster_name: &str) -> String {
    format!("{}-r", cluster_name)
}

fn generate_service(
    cluster: &PostgresCluster,
    name: String,
    role: Option<InstanceRole>,
) -> Service {
    let cluster_name = cluster.name_any();

    let mut selector = BTreeMap::from([(keys::CLUSTER.to_string(), cluster_name.clone())]);
    if let Some(role) = role {
        selector.insert(keys::INSTANCE_ROLE.to_string(), role.as_str().to_string());
    }

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(standard_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: i32::from(POSTGRES_PORT),
                target_port: Some(IntOrString::Int(i32::from(POSTGRES_PORT))),
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the read-write, read-only and any-instance services
pub fn generate_services(cluster: &PostgresCluster) -> Vec<Service> {
    let cluster_name = cluster.name_any();
    vec![
        generate_service(
            cluster,
            rw_service_name(&cluster_name),
            Some(InstanceRole::Primary),
        ),
        generate_service(
            cluster,
            ro_service_name(&cluster_name),
            Some(InstanceRole::Replica),
        ),
        generate_service(cluster, r_service_name(&cluster_name), None),
    ]
}
