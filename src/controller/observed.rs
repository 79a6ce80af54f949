//! Observed state of a cluster
//!
//! One reconciliation pass starts by listing every pod, claim and job carrying
//! the cluster label and asking each reachable instance agent for its status.
//! The result is a plain snapshot; everything after observation is a pure
//! function of this snapshot and the cluster object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::{debug, warn};

use crate::controller::bootstrap::JobRole;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::hibernation::HibernationRequest;
use crate::controller::instance_status::InstanceStatus;
use crate::crd::PostgresCluster;
use crate::resources::common::{InstanceRole, PvcRole, cluster_selector, instance_ordinal, keys};
use crate::resources::pod::POSTGRES_CONTAINER;
use crate::resources::postgres_client::{
    PostgresConnection, PostgresCredentials, SlotInfo, fetch_credentials,
};
use crate::resources::pvc::{PVC_STATUS_INITIALIZING, PVC_STATUS_READY};

/// An instance pod
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedPod {
    pub name: String,
    pub ordinal: u32,
    /// Role label as last written by the operator
    pub role: Option<InstanceRole>,
    pub ready: bool,
    pub terminating: bool,
    /// Pod phase is Failed or Succeeded; the kubelet will not restart it
    pub finished: bool,
    pub ip: Option<String>,
    pub spec_hash: Option<String>,
    pub resources: Option<ResourceRequirements>,
    /// The pod carries the fence mark; its agent keeps PostgreSQL stopped
    pub fenced: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PvcStatus {
    Initializing,
    Ready,
}

/// Metadata written onto the primary's claims when the cluster hibernates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HibernationRecord {
    pub manifest: String,
    pub controldata: String,
}

/// A claim belonging to an instance
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedPvc {
    pub name: String,
    pub instance: String,
    pub ordinal: u32,
    pub role: PvcRole,
    pub status: PvcStatus,
    /// VolumeSnapshot the claim was provisioned from
    pub snapshot: Option<String>,
    pub hibernation: Option<HibernationRecord>,
    pub terminating: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
}

/// A bootstrap job
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedJob {
    pub name: String,
    pub instance: String,
    pub ordinal: u32,
    pub role: JobRole,
    pub outcome: JobOutcome,
    pub failure_reason: Option<String>,
    pub fallback_eligible: bool,
    pub attempt: u32,
    /// When the job was marked failed
    pub failed_at: Option<DateTime<Utc>>,
}

/// Everything a pass knows about the cluster's children
#[derive(Clone, Debug, Default)]
pub struct ObservedCluster {
    pub pods: Vec<ObservedPod>,
    pub pvcs: Vec<ObservedPvc>,
    pub jobs: Vec<ObservedJob>,
    /// Agent status per instance; unreachable instances are absent
    pub statuses: BTreeMap<String, InstanceStatus>,
    /// Operator-managed slots per instance; instances that could not be queried are absent
    pub slots: BTreeMap<String, Vec<SlotInfo>>,
    /// `pg_controldata` of the current primary, only fetched for hibernation
    pub controldata: Option<String>,
}

impl ObservedCluster {
    pub fn pod(&self, instance: &str) -> Option<&ObservedPod> {
        self.pods.iter().find(|p| p.name == instance)
    }

    pub fn status(&self, instance: &str) -> Option<&InstanceStatus> {
        self.statuses.get(instance)
    }

    pub fn pvcs_of<'a>(&'a self, instance: &str) -> impl Iterator<Item = &'a ObservedPvc> + use<'a> {
        let instance = instance.to_string();
        self.pvcs.iter().filter(move |p| p.instance == instance)
    }

    pub fn data_pvc(&self, instance: &str) -> Option<&ObservedPvc> {
        self.pvcs_of(instance).find(|p| p.role == PvcRole::Data)
    }

    pub fn jobs_of<'a>(&'a self, instance: &str) -> impl Iterator<Item = &'a ObservedJob> + use<'a> {
        let instance = instance.to_string();
        self.jobs.iter().filter(move |j| j.instance == instance)
    }

    /// Only running jobs hold an instance slot
    pub fn running_jobs(&self) -> impl Iterator<Item = &ObservedJob> {
        self.jobs.iter().filter(|j| j.outcome == JobOutcome::Running)
    }

    /// Instance whose ready pod reports it is out of recovery
    pub fn is_primary(&self, instance: &str) -> bool {
        self.status(instance).is_some_and(|s| s.is_primary)
    }

    /// Every instance that has a pod or a data claim
    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<(u32, String)> = self
            .pods
            .iter()
            .map(|p| (p.ordinal, p.name.clone()))
            .chain(
                self.pvcs
                    .iter()
                    .filter(|p| p.role == PvcRole::Data)
                    .map(|p| (p.ordinal, p.instance.clone())),
            )
            .collect();
        names.sort();
        names.dedup();
        names.into_iter().map(|(_, name)| name).collect()
    }
}

fn label<'a>(labels: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    labels.get(key).map(String::as_str)
}

/// Convert a listed pod; pods outside the naming scheme are ignored
pub fn observe_pod(cluster_name: &str, pod: &Pod) -> Option<ObservedPod> {
    let name = pod.name_any();
    let ordinal = instance_ordinal(cluster_name, &name)?;
    let labels = pod.labels();
    let status = pod.status.as_ref();

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let finished = status
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Failed" || phase == "Succeeded");

    let resources = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == POSTGRES_CONTAINER))
        .and_then(|c| c.resources.clone());

    Some(ObservedPod {
        ordinal,
        role: label(labels, keys::INSTANCE_ROLE).and_then(InstanceRole::parse),
        ready,
        terminating: pod.metadata.deletion_timestamp.is_some(),
        finished,
        ip: status.and_then(|s| s.pod_ip.clone()),
        spec_hash: pod.annotations().get(keys::POD_SPEC_HASH).cloned(),
        resources,
        fenced: pod.annotations().get(keys::FENCED).is_some_and(|v| v == "true"),
        name,
    })
}

/// Convert a listed claim; claims without an instance or role label are ignored
pub fn observe_pvc(cluster_name: &str, pvc: &PersistentVolumeClaim) -> Option<ObservedPvc> {
    let labels = pvc.labels();
    let instance = label(labels, keys::INSTANCE_NAME)?.to_string();
    let ordinal = instance_ordinal(cluster_name, &instance)?;
    let role = PvcRole::from_labels(labels)?;
    let annotations = pvc.annotations();

    let status = match annotations.get(keys::PVC_STATUS).map(String::as_str) {
        Some(PVC_STATUS_INITIALIZING) => PvcStatus::Initializing,
        Some(PVC_STATUS_READY) => PvcStatus::Ready,
        // Claims written before the annotation existed hold data
        _ => PvcStatus::Ready,
    };

    let hibernation = match (
        annotations.get(keys::HIBERNATION_CLUSTER_MANIFEST),
        annotations.get(keys::HIBERNATION_PG_CONTROLDATA),
    ) {
        (Some(manifest), Some(controldata)) => Some(HibernationRecord {
            manifest: manifest.clone(),
            controldata: controldata.clone(),
        }),
        _ => None,
    };

    let snapshot = pvc
        .spec
        .as_ref()
        .and_then(|s| s.data_source.as_ref())
        .filter(|ds| ds.kind == "VolumeSnapshot")
        .map(|ds| ds.name.clone());

    Some(ObservedPvc {
        name: pvc.name_any(),
        instance,
        ordinal,
        role,
        status,
        snapshot,
        hibernation,
        terminating: pvc.metadata.deletion_timestamp.is_some(),
    })
}

/// Convert a listed job; jobs without a known role are ignored
pub fn observe_job(cluster_name: &str, job: &Job) -> Option<ObservedJob> {
    let labels = job.labels();
    let instance = label(labels, keys::INSTANCE_NAME)?.to_string();
    let ordinal = instance_ordinal(cluster_name, &instance)?;
    let role = label(labels, keys::JOB_ROLE).and_then(JobRole::parse)?;
    let annotations = job.annotations();

    let status = job.status.as_ref();
    let condition = |type_: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| {
                conds
                    .iter()
                    .find(|c| c.type_ == type_ && c.status == "True")
            })
    };

    let failed_at = condition("Failed")
        .and_then(|c| c.last_transition_time.as_ref())
        .and_then(timestamp);
    let (outcome, failure_reason) = if let Some(failed) = condition("Failed") {
        let reason = failed
            .reason
            .clone()
            .filter(|r| !r.is_empty())
            .or_else(|| failed.message.clone().filter(|m| !m.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        (JobOutcome::Failed, Some(reason))
    } else if condition("Complete").is_some() || status.and_then(|s| s.succeeded).unwrap_or(0) > 0
    {
        (JobOutcome::Succeeded, None)
    } else if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
        (JobOutcome::Failed, Some("unknown".to_string()))
    } else {
        (JobOutcome::Running, None)
    };

    Some(ObservedJob {
        name: job.name_any(),
        instance,
        ordinal,
        role,
        outcome,
        failure_reason,
        fallback_eligible: annotations
            .get(keys::FALLBACK_ELIGIBLE)
            .is_some_and(|v| v == "true"),
        attempt: annotations
            .get(keys::JOB_ATTEMPT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        failed_at,
    })
}

/// API timestamps serialize as RFC 3339
fn timestamp(time: &Time) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(raw.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Read the cluster's children and ask every reachable instance for its status
pub async fn observe(cluster: &PostgresCluster, ctx: &Context) -> Result<ObservedCluster> {
    let cluster_name = cluster.name_any();
    let ns = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let lp = ListParams::default().labels(&cluster_selector(&cluster_name));

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);

    let (pod_list, pvc_list, job_list) =
        futures::try_join!(pods.list(&lp), pvcs.list(&lp), jobs.list(&lp))?;

    let mut observed = ObservedCluster {
        pods: pod_list
            .items
            .iter()
            .filter_map(|p| observe_pod(&cluster_name, p))
            .collect(),
        pvcs: pvc_list
            .items
            .iter()
            .filter_map(|p| observe_pvc(&cluster_name, p))
            .collect(),
        jobs: job_list
            .items
            .iter()
            .filter_map(|j| observe_job(&cluster_name, j))
            .collect(),
        ..Default::default()
    };
    observed.pods.sort_by_key(|p| p.ordinal);

    let reachable: Vec<(String, String)> = observed
        .pods
        .iter()
        .filter(|p| !p.terminating && !p.finished)
        .filter_map(|p| p.ip.clone().map(|ip| (p.name.clone(), ip)))
        .collect();

    let statuses = join_all(reachable.iter().map(|(name, ip)| async move {
        match ctx.instances.status(name, ip).await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(instance = %name, error = %e, "Instance status unavailable");
                None
            }
        }
    }))
    .await;
    observed.statuses = statuses
        .into_iter()
        .flatten()
        .map(|s| (s.name.clone(), s))
        .collect();

    let hibernation = HibernationRequest::from_cluster(cluster);
    if hibernation != HibernationRequest::On {
        observed.slots = observe_slots(cluster, ctx, &ns, &reachable).await;
    } else if let Some(status) = cluster.status.as_ref() {
        let primary_ip = reachable
            .iter()
            .find(|(name, _)| *name == status.current_primary)
            .map(|(_, ip)| ip.as_str());
        if let Some(ip) = primary_ip {
            match ctx.instances.controldata(ip).await {
                Ok(data) => observed.controldata = Some(data),
                Err(e) => warn!(error = %e, "Could not read pg_controldata from primary"),
            }
        }
    }

    Ok(observed)
}

/// List operator-managed slots on every reachable instance
async fn observe_slots(
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
    reachable: &[(String, String)],
) -> BTreeMap<String, Vec<SlotInfo>> {
    if reachable.is_empty() {
        return BTreeMap::new();
    }

    let credentials = match fetch_credentials(&ctx.client, ns, &cluster.name_any()).await {
        Ok(creds) => creds,
        Err(e) => {
            debug!(error = %e, "Skipping slot observation");
            return BTreeMap::new();
        }
    };
    let prefix = cluster.ha_slot_prefix().to_string();
    let timeout = ctx.config.instance_status_timeout;

    let results = join_all(reachable.iter().map(|(name, ip)| {
        let credentials: &PostgresCredentials = &credentials;
        let prefix = prefix.as_str();
        async move {
            let listed = async {
                let conn = PostgresConnection::connect(ip, credentials, timeout).await?;
                conn.list_slots(prefix).await
            }
            .await;
            match listed {
                Ok(slots) => Some((name.clone(), slots)),
                Err(e) => {
                    debug!(instance = %name, error = %e, "Replication slots unavailable");
                    None
                }
            }
        }
    }))
    .await;

    results.into_iter().flatten().collect()
}
