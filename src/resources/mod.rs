pub mod common;
pub mod config_map;
pub mod job;
pub mod pod;
pub mod postgres_client;
pub mod pvc;
pub mod rbac;
pub mod secret;
pub mod service;

pub use common::{
    API_VERSION, FIELD_MANAGER, InstanceRole, KIND, PvcRole, instance_labels, owner_reference,
    standard_labels,
};
