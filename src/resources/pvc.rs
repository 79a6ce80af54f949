//! PersistentVolumeClaim generation
//!
//! Every instance owns a data claim, an optional WAL claim and one claim per
//! tablespace. Claims are created before the bootstrap job that fills them and
//! outlive every pod that mounts them.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    TypedLocalObjectReference, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{PostgresCluster, StorageSpec};
use crate::resources::common::{PvcRole, instance_labels, keys, owner_reference};

/// `pvc-status` while the bootstrap job has not succeeded yet
pub const PVC_STATUS_INITIALIZING: &str = "initializing";

/// `pvc-status` once the volume holds usable data
pub const PVC_STATUS_READY: &str = "ready";

/// Mount point of the data volume; PGDATA is a subdirectory
pub const DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";
pub const PGDATA_PATH: &str = "/var/lib/postgresql/data/pgdata";
pub const WAL_MOUNT_PATH: &str = "/var/lib/postgresql/wal";
pub const TABLESPACES_MOUNT_ROOT: &str = "/var/lib/postgresql/tablespaces";

/// Claims an instance is expected to mount, derived from the cluster spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageBindings {
    pub instance: String,
    pub data: String,
    pub wal: Option<String>,
    /// Tablespace name to claim name
    pub tablespaces: BTreeMap<String, String>,
}

impl StorageBindings {
    pub fn for_instance(cluster: &PostgresCluster, instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            data: PvcRole::Data.pvc_name(instance),
            wal: cluster
                .spec
                .wal_storage
                .as_ref()
                .map(|_| PvcRole::Wal.pvc_name(instance)),
            tablespaces: cluster
                .spec
                .tablespaces
                .iter()
                .map(|tbs| {
                    (
                        tbs.name.clone(),
                        PvcRole::Tablespace(tbs.name.clone()).pvc_name(instance),
                    )
                })
                .collect(),
        }
    }

    /// Every role with the claim it maps to
    pub fn roles(&self) -> Vec<(PvcRole, String)> {
        let mut roles = vec![(PvcRole::Data, self.data.clone())];
        if let Some(wal) = &self.wal {
            roles.push((PvcRole::Wal, wal.clone()));
        }
        roles.extend(
            self.tablespaces
                .iter()
                .map(|(name, claim)| (PvcRole::Tablespace(name.clone()), claim.clone())),
        );
        roles
    }

    /// Pod volumes and container mounts for these claims
    pub fn volumes_and_mounts(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        self.roles()
            .into_iter()
            .map(|(role, claim)| {
                let (volume_name, mount_path) = match &role {
                    PvcRole::Data => ("pgdata".to_string(), DATA_MOUNT_PATH.to_string()),
                    PvcRole::Wal => ("pg-wal".to_string(), WAL_MOUNT_PATH.to_string()),
                    PvcRole::Tablespace(name) => (
                        format!("tbs-{}", name),
                        format!("{}/{}", TABLESPACES_MOUNT_ROOT, name),
                    ),
                };
                let volume = Volume {
                    name: volume_name.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim,
                        read_only: Some(false),
                    }),
                    ..Default::default()
                };
                let mount = VolumeMount {
                    name: volume_name,
                    mount_path,
                    ..Default::default()
                };
                (volume, mount)
            })
            .unzip()
    }
}

fn storage_for<'a>(cluster: &'a PostgresCluster, role: &PvcRole) -> Option<&'a StorageSpec> {
    match role {
        PvcRole::Data => Some(&cluster.spec.storage),
        PvcRole::Wal => cluster.spec.wal_storage.as_ref(),
        PvcRole::Tablespace(name) => cluster
            .spec
            .tablespaces
            .iter()
            .find(|tbs| &tbs.name == name)
            .map(|tbs| &tbs.storage),
    }
}

/// Generate one claim of an instance
///
/// Returns `None` when the spec no longer configures storage for `role`.
/// A data claim restored from a VolumeSnapshot records the snapshot as its
/// data source.
pub fn generate_pvc(
    cluster: &PostgresCluster,
    instance: &str,
    role: &PvcRole,
    snapshot: Option<&str>,
) -> Option<PersistentVolumeClaim> {
    let storage = storage_for(cluster, role)?;
    let cluster_name = cluster.name_any();

    let mut labels = instance_labels(&cluster_name, instance);
    labels.insert(keys::PVC_ROLE.to_string(), role.label_value().to_string());
    if let PvcRole::Tablespace(name) = role {
        labels.insert(keys::TABLESPACE_NAME.to_string(), name.clone());
    }

    let annotations = BTreeMap::from([(
        keys::PVC_STATUS.to_string(),
        PVC_STATUS_INITIALIZING.to_string(),
    )]);

    let data_source = match (role, snapshot) {
        (PvcRole::Data, Some(name)) => Some(TypedLocalObjectReference {
            api_group: Some("snapshot.storage.k8s.io".to_string()),
            kind: "VolumeSnapshot".to_string(),
            name: name.to_string(),
        }),
        _ => None,
    };

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(role.pvc_name(instance)),
            namespace: cluster.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            data_source,
            ..Default::default()
        }),
        ..Default::default()
    })
}
