//! ServiceAccount, Role and RoleBinding for instance pods
//!
//! The instance agent reads its own pod to learn its role label and reads the
//! cluster's ConfigMap and Secret; it never writes cluster state.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::PostgresCluster;
use crate::resources::common::{owner_reference, standard_labels};

/// ServiceAccount, Role and RoleBinding share the cluster's name
pub fn service_account_name(cluster_name: &str) -> String {
    cluster_name.to_string()
}

fn metadata(cluster: &PostgresCluster) -> ObjectMeta {
    let cluster_name = cluster.name_any();
    ObjectMeta {
        name: Some(service_account_name(&cluster_name)),
        namespace: cluster.namespace(),
        labels: Some(standard_labels(&cluster_name)),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

fn read_rule(resource: &str) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
        ..Default::default()
    }
}

pub fn generate_service_account(cluster: &PostgresCluster) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(cluster),
        ..Default::default()
    }
}

pub fn generate_role(cluster: &PostgresCluster) -> Role {
    Role {
        metadata: metadata(cluster),
        rules: Some(vec![
            read_rule("pods"),
            read_rule("configmaps"),
            read_rule("secrets"),
        ]),
    }
}

pub fn generate_role_binding(cluster: &PostgresCluster) -> RoleBinding {
    let name = service_account_name(&cluster.name_any());
    RoleBinding {
        metadata: metadata(cluster),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: cluster.namespace(),
            ..Default::default()
        }]),
    }
}
