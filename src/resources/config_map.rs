use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::PostgresCluster;
use crate::postgres::config::{effective_params, render_conf};
use crate::resources::common::{owner_reference, standard_labels};

/// Key of the rendered configuration inside the ConfigMap
pub const CONF_KEY: &str = "postgresql.conf";

pub fn config_map_name(cluster_name: &str) -> String {
    format!("{}-config", cluster_name)
}

/// Generate the ConfigMap holding the rendered parameters
///
/// Instance agents reload when the mounted file changes, so parameters that
/// do not need a restart are applied through this object alone.
pub fn generate_config_map(cluster: &PostgresCluster) -> ConfigMap {
    let cluster_name = cluster.name_any();
    let params = effective_params(&cluster.spec.postgresql_params);

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(standard_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONF_KEY.to_string(), render_conf(&params))])),
        ..Default::default()
    }
}
