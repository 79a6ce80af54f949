use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::crd::PostgresCluster;
use crate::resources::common::{owner_reference, standard_labels};

pub const POSTGRES_PASSWORD_KEY: &str = "POSTGRES_PASSWORD";
pub const REPLICATION_PASSWORD_KEY: &str = "REPLICATION_PASSWORD";

/// Name of the Secret holding a cluster's superuser and replication passwords
pub fn credentials_secret_name(cluster_name: &str) -> String {
    format!("{}-credentials", cluster_name)
}

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET.get(idx).copied().map(char::from).unwrap_or('x')
        })
        .collect()
}

/// Generate the credentials Secret
///
/// Passwords are random on every call, so the Secret is only ever created,
/// never re-applied.
pub fn generate_credentials_secret(cluster: &PostgresCluster) -> Secret {
    let cluster_name = cluster.name_any();

    let superuser_password = generate_password(32);
    let replication_password = generate_password(32);

    let string_data = BTreeMap::from([
        (POSTGRES_PASSWORD_KEY.to_string(), superuser_password.clone()),
        (REPLICATION_PASSWORD_KEY.to_string(), replication_password),
        ("PGPASSWORD".to_string(), superuser_password),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(credentials_secret_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(standard_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}
