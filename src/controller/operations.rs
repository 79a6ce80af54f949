//! Side effects decided by a reconciliation pass
//!
//! Sub-controllers return `Operation`s instead of calling the API, which keeps
//! their decisions testable. The executor applies one group of operations in
//! order and stops that group at the first failure; other groups still run.

use std::collections::BTreeMap;
use std::collections::HashMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, ResourceRequirements, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::slots::{SlotAction, SlotOperation};
use crate::crd::PostgresCluster;
use crate::resources::common::{FIELD_MANAGER, InstanceRole, keys};
use crate::resources::pod::POSTGRES_CONTAINER;
use crate::resources::postgres_client::{PostgresConnection, fetch_credentials};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Kinds of per-cluster objects that are not tied to one instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AncillaryKind {
    Secret,
    ConfigMap,
    Service,
    ServiceAccount,
    Role,
    RoleBinding,
}

/// One side effect against the Kubernetes API or an instance
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    CreatePvc(Box<PersistentVolumeClaim>),
    DeletePvc {
        name: String,
    },
    /// Set (`Some`) or remove (`None`) annotations on a claim
    AnnotatePvc {
        name: String,
        annotations: BTreeMap<String, Option<String>>,
    },
    CreatePod(Box<Pod>),
    DeletePod {
        name: String,
    },
    /// Rewrite the role label the instance agent acts on
    SetPodRole {
        name: String,
        role: InstanceRole,
    },
    /// Set or clear the fence mark the instance agent stops PostgreSQL on
    SetPodFencing {
        name: String,
        fenced: bool,
    },
    /// Change container resources without recreating the pod
    ResizePod {
        name: String,
        resources: ResourceRequirements,
    },
    CreateJob(Box<Job>),
    DeleteJob {
        name: String,
    },
    DeleteAncillary {
        kind: AncillaryKind,
        name: String,
    },
    Slot(SlotOperation),
    Event {
        severity: EventSeverity,
        reason: String,
        message: String,
    },
}

impl Operation {
    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Operation::Event {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn normal(reason: &str, message: impl Into<String>) -> Self {
        Operation::Event {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// Operations that only report and never change the topology
    pub fn is_event(&self) -> bool {
        matches!(self, Operation::Event { .. })
    }
}

fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(api_err) if api_err.code == code)
}

async fn create<T>(api: &Api<T>, resource: &T) -> Result<()>
where
    T: Resource + serde::Serialize + DeserializeOwned + Clone + std::fmt::Debug,
{
    match api.create(&PostParams::default(), resource).await {
        Ok(_) => Ok(()),
        // Already created by an earlier pass
        Err(e) if is_status(&e, 409) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn delete<T>(api: &Api<T>, name: &str, params: &DeleteParams) -> Result<()>
where
    T: Resource + DeserializeOwned + Clone + std::fmt::Debug,
{
    match api.delete(name, params).await {
        Ok(_) => Ok(()),
        Err(e) if is_status(&e, 404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Applies operations for one cluster
pub struct Executor<'a> {
    ctx: &'a Context,
    cluster: &'a PostgresCluster,
    ns: String,
    /// Pod IP to open connection, reused within a pass
    connections: HashMap<String, PostgresConnection>,
}

impl<'a> Executor<'a> {
    pub fn new(ctx: &'a Context, cluster: &'a PostgresCluster) -> Self {
        Self {
            ctx,
            cluster,
            ns: cluster.namespace().unwrap_or_else(|| "default".to_string()),
            connections: HashMap::new(),
        }
    }

    /// Run a group of operations in order, stopping at the first failure
    ///
    /// Returns whether every operation succeeded. Failures are logged and
    /// never propagated so sibling groups still run.
    pub async fn run_group(&mut self, group: &str, ops: Vec<Operation>) -> bool {
        for op in ops {
            if let Err(e) = self.apply(&op).await {
                warn!(
                    cluster = %self.cluster.name_any(),
                    group = group,
                    operation = ?op,
                    error = %e,
                    "Operation failed, remaining {} operations deferred to the next pass",
                    group
                );
                return false;
            }
        }
        true
    }

    async fn apply(&mut self, op: &Operation) -> Result<()> {
        let client = self.ctx.client.clone();
        let ns = self.ns.as_str();
        match op {
            Operation::CreatePvc(pvc) => {
                info!(pvc = %pvc.name_any(), "Creating volume claim");
                create(&Api::<PersistentVolumeClaim>::namespaced(client, ns), pvc.as_ref()).await
            }
            Operation::DeletePvc { name } => {
                info!(pvc = %name, "Deleting volume claim");
                delete(
                    &Api::<PersistentVolumeClaim>::namespaced(client, ns),
                    name,
                    &DeleteParams::default(),
                )
                .await
            }
            Operation::AnnotatePvc { name, annotations } => {
                debug!(pvc = %name, "Annotating volume claim");
                let api: Api<PersistentVolumeClaim> = Api::namespaced(client, ns);
                let patch = json!({ "metadata": { "annotations": annotations } });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Operation::CreatePod(pod) => {
                info!(pod = %pod.name_any(), "Creating instance pod");
                create(&Api::<Pod>::namespaced(client, ns), pod.as_ref()).await
            }
            Operation::DeletePod { name } => {
                info!(pod = %name, "Deleting instance pod");
                delete(&Api::<Pod>::namespaced(client, ns), name, &DeleteParams::default()).await
            }
            Operation::SetPodRole { name, role } => {
                info!(pod = %name, role = %role, "Setting instance role");
                let api: Api<Pod> = Api::namespaced(client, ns);
                let labels = BTreeMap::from([(keys::INSTANCE_ROLE, role.as_str())]);
                let patch = json!({ "metadata": { "labels": labels } });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Operation::SetPodFencing { name, fenced } => {
                info!(pod = %name, fenced = fenced, "Setting instance fence");
                let api: Api<Pod> = Api::namespaced(client, ns);
                // null removes the annotation
                let annotations = BTreeMap::from([(keys::FENCED, fenced.then_some("true"))]);
                let patch = json!({ "metadata": { "annotations": annotations } });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Operation::ResizePod { name, resources } => {
                info!(pod = %name, "Resizing instance pod in place");
                let api: Api<Pod> = Api::namespaced(client, ns);
                let patch = json!({
                    "spec": { "containers": [{ "name": POSTGRES_CONTAINER, "resources": resources }] }
                });
                api.patch_subresource(
                    "resize",
                    name,
                    &PatchParams::default(),
                    &Patch::Strategic(&patch),
                )
                .await?;
                Ok(())
            }
            Operation::CreateJob(job) => {
                info!(job = %job.name_any(), "Creating bootstrap job");
                create(&Api::<Job>::namespaced(client, ns), job.as_ref()).await
            }
            Operation::DeleteJob { name } => {
                info!(job = %name, "Deleting bootstrap job");
                delete(&Api::<Job>::namespaced(client, ns), name, &DeleteParams::background()).await
            }
            Operation::DeleteAncillary { kind, name } => {
                info!(kind = ?kind, name = %name, "Deleting cluster resource");
                let dp = DeleteParams::default();
                match kind {
                    AncillaryKind::Secret => delete(&Api::<Secret>::namespaced(client, ns), name, &dp).await,
                    AncillaryKind::ConfigMap => {
                        delete(&Api::<ConfigMap>::namespaced(client, ns), name, &dp).await
                    }
                    AncillaryKind::Service => delete(&Api::<Service>::namespaced(client, ns), name, &dp).await,
                    AncillaryKind::ServiceAccount => {
                        delete(&Api::<ServiceAccount>::namespaced(client, ns), name, &dp).await
                    }
                    AncillaryKind::Role => delete(&Api::<Role>::namespaced(client, ns), name, &dp).await,
                    AncillaryKind::RoleBinding => {
                        delete(&Api::<RoleBinding>::namespaced(client, ns), name, &dp).await
                    }
                }
            }
            Operation::Slot(slot_op) => self.apply_slot(slot_op).await,
            Operation::Event {
                severity,
                reason,
                message,
            } => {
                let event = Event {
                    type_: match severity {
                        EventSeverity::Normal => EventType::Normal,
                        EventSeverity::Warning => EventType::Warning,
                    },
                    reason: reason.clone(),
                    note: Some(message.clone()),
                    action: "Reconcile".to_string(),
                    secondary: None,
                };
                let reference = self.cluster.object_ref(&());
                // Events are best effort
                if let Err(e) = self.ctx.recorder.publish(&event, &reference).await {
                    debug!(error = %e, reason = %reason, "Failed to publish event");
                }
                Ok(())
            }
        }
    }

    async fn apply_slot(&mut self, op: &SlotOperation) -> Result<()> {
        if !self.connections.contains_key(&op.host) {
            let credentials =
                fetch_credentials(&self.ctx.client, &self.ns, &self.cluster.name_any()).await?;
            let conn = PostgresConnection::connect(
                &op.host,
                &credentials,
                self.ctx.config.instance_status_timeout,
            )
            .await?;
            self.connections.insert(op.host.clone(), conn);
        }
        let conn = self
            .connections
            .get(&op.host)
            .ok_or_else(|| Error::TransientError(format!("no connection to {}", op.host)))?;

        info!(instance = %op.instance, slot = %op.slot, action = ?op.action, "Replication slot change");
        match op.action {
            SlotAction::Create => conn.create_slot(&op.slot).await?,
            SlotAction::Drop => conn.drop_slot(&op.slot).await?,
            SlotAction::Advance(lsn) => conn.advance_slot(&op.slot, lsn).await?,
        }
        Ok(())
    }
}

/// Server-side apply a namespaced resource owned by the operator
pub async fn apply_resource<T>(ctx: &Context, ns: &str, resource: &T) -> Result<()>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + serde::Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    let name = resource.name_any();

    let patch = Patch::Apply(resource);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    api.patch(&name, &params, &patch).await?;
    debug!("Applied resource: {}", name);

    Ok(())
}

/// Create a namespaced resource unless it already exists
pub async fn create_resource<T>(ctx: &Context, ns: &str, resource: &T) -> Result<()>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + serde::Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    create(&Api::<T>::namespaced(ctx.client.clone(), ns), resource).await
}
