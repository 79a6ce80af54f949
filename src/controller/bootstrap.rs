//! Bootstrap job engine
//!
//! New instances get their data from a one-shot job before any pod mounts
//! their claims. Per instance the engine walks
//! `NoJob -> Running -> {Succeeded, Failed}`:
//!
//! - `Succeeded`: the claims are marked ready and the instance pod is created
//! - `Failed`: the job stays in place for inspection but no longer occupies
//!   the instance. A replacement is scheduled once the retry delay for its
//!   attempt has passed, and older failed attempts are deleted with it. Roles
//!   with a fallback edge switch role instead of retrying the same path.
//!
//! Claims are never deleted on failure; the replacement reuses them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use crate::controller::error::BackoffConfig;
use crate::controller::instance_set::InstanceSetPlan;
use crate::controller::observed::{JobOutcome, ObservedCluster, ObservedJob, PvcStatus};
use crate::controller::operations::Operation;
use crate::crd::{ClusterPhase, PostgresCluster, ReplicaJoinMethod};
use crate::resources::common::{InstanceRole, PvcRole, instance_name, keys};
use crate::resources::job::generate_bootstrap_job;
use crate::resources::pod::generate_instance_pod;
use crate::resources::pvc::{PVC_STATUS_READY, StorageBindings, generate_pvc};

/// What a bootstrap job does to an instance's claims
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobRole {
    /// Create a brand new database; only ever the first instance
    Initdb,
    /// Streaming copy from the primary onto empty claims
    Join,
    /// Wipe whatever is on the claims and take a full streaming copy
    FullRecovery,
    /// Start from a VolumeSnapshot restored into the data claim
    SnapshotRecovery,
}

/// Delay before replacing a failed job: 10s doubling per attempt, at most 5 minutes
pub fn retry_delay(attempt: u32) -> Duration {
    BackoffConfig {
        initial_delay: Duration::from_secs(10),
        jitter: 0.0,
        ..BackoffConfig::default()
    }
    .delay_for_attempt(attempt)
}

/// Role a failed, fallback-eligible job is replaced with
const FALLBACK_EDGES: &[(JobRole, JobRole)] = &[(JobRole::SnapshotRecovery, JobRole::FullRecovery)];

impl JobRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRole::Initdb => "initdb",
            JobRole::Join => "join",
            JobRole::FullRecovery => "full-recovery",
            JobRole::SnapshotRecovery => "snapshot-recovery",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initdb" => Some(JobRole::Initdb),
            "join" => Some(JobRole::Join),
            "full-recovery" => Some(JobRole::FullRecovery),
            "snapshot-recovery" => Some(JobRole::SnapshotRecovery),
            _ => None,
        }
    }

    pub fn fallback(&self) -> Option<JobRole> {
        FALLBACK_EDGES
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, to)| *to)
    }

    /// Whether the job copies data from a running primary
    pub fn needs_primary(&self) -> bool {
        matches!(self, JobRole::Join | JobRole::FullRecovery)
    }

    /// Role used to retry after `self` failed
    pub fn replacement(&self, fallback_eligible: bool) -> JobRole {
        if fallback_eligible {
            self.fallback().unwrap_or(*self)
        } else {
            *self
        }
    }
}

impl fmt::Display for JobRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs the engine needs beyond the observed state
#[derive(Clone, Copy, Debug)]
pub struct BootstrapParams<'a> {
    /// Instance that should carry the primary role label when its pod is created
    pub designated_primary: Option<&'a str>,
    /// Whether a healthy primary is available to copy from
    pub primary_available: bool,
    /// New instances may be added (no failover, switchover or scale-down running)
    pub allow_new: bool,
    pub agent_port: u16,
    pub now: DateTime<Utc>,
}

/// Decisions of one bootstrap pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BootstrapOutcome {
    pub operations: Vec<Operation>,
    /// Full `excludedSnapshots` list after this pass
    pub excluded_snapshots: Vec<String>,
    /// New `latestGeneratedNode` when an instance was added
    pub latest_generated_node: Option<u32>,
    /// Phase this engine claims, if it has work in progress
    pub phase: Option<(ClusterPhase, String)>,
    /// A job is running
    pub in_flight: bool,
    /// Instances are missing or still bootstrapping
    pub pending: bool,
    /// Instance created by initdb, which becomes the first primary
    pub initial_primary: Option<String>,
    pub failed_jobs: u32,
    /// Shortest wait until a failed job may be replaced
    pub retry_after: Option<Duration>,
}

impl BootstrapOutcome {
    fn claim(&mut self, phase: ClusterPhase, reason: String) {
        // SettingUpPrimary outranks CreatingReplica
        if self.phase.as_ref().is_some_and(|(p, _)| *p == ClusterPhase::SettingUpPrimary) {
            return;
        }
        self.phase = Some((phase, reason));
    }

    fn retry_in(&mut self, wait: Duration) {
        self.retry_after = Some(self.retry_after.map_or(wait, |current| current.min(wait)));
    }
}

fn latest_job<'a>(observed: &'a ObservedCluster, instance: &str) -> Option<&'a ObservedJob> {
    observed.jobs_of(instance).max_by_key(|j| j.attempt)
}

/// Role for an initializing instance that has no job yet
fn initial_role(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    instance: &str,
) -> JobRole {
    let any_bootstrapped = observed
        .pvcs
        .iter()
        .any(|p| p.role == PvcRole::Data && p.status == PvcStatus::Ready && p.instance != instance);
    let has_primary = cluster
        .status
        .as_ref()
        .is_some_and(|s| !s.current_primary.is_empty() && s.current_primary != instance);

    if !any_bootstrapped && !has_primary {
        JobRole::Initdb
    } else if observed
        .data_pvc(instance)
        .is_some_and(|pvc| pvc.snapshot.is_some())
    {
        JobRole::SnapshotRecovery
    } else {
        JobRole::Join
    }
}

/// Drive bootstrap jobs for every instance that does not have usable data yet
pub fn reconcile_bootstrap(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    params: BootstrapParams<'_>,
) -> BootstrapOutcome {
    let cluster_name = cluster.name_any();
    let mut outcome = BootstrapOutcome {
        excluded_snapshots: cluster
            .status
            .as_ref()
            .map(|s| s.excluded_snapshots.clone())
            .unwrap_or_default(),
        in_flight: observed.running_jobs().next().is_some(),
        ..Default::default()
    };

    // Jobs whose instance lost its claims have nothing left to do
    for job in &observed.jobs {
        if !plan.existing.contains(&job.instance) {
            outcome.operations.push(Operation::DeleteJob {
                name: job.name.clone(),
            });
        }
    }

    for instance in &plan.existing {
        if plan.is_removed(instance) {
            continue;
        }
        let Some(data) = observed.data_pvc(instance) else {
            continue;
        };

        if data.status == PvcStatus::Ready {
            // Finished jobs of bootstrapped instances are garbage
            for job in observed.jobs_of(instance) {
                if job.outcome != JobOutcome::Running {
                    outcome.operations.push(Operation::DeleteJob {
                        name: job.name.clone(),
                    });
                }
            }
            continue;
        }

        outcome.pending = true;
        let bindings = StorageBindings::for_instance(cluster, instance);

        match latest_job(observed, instance) {
            Some(job) if job.outcome == JobOutcome::Running => {
                claim_for_role(&mut outcome, job.role, instance);
                if job.role == JobRole::Initdb {
                    outcome.initial_primary = Some(instance.clone());
                }
            }
            Some(job) if job.outcome == JobOutcome::Succeeded => {
                let role = if job.role == JobRole::Initdb
                    || params.designated_primary == Some(instance.as_str())
                {
                    InstanceRole::Primary
                } else {
                    InstanceRole::Replica
                };
                if job.role == JobRole::Initdb {
                    outcome.initial_primary = Some(instance.clone());
                }
                for pvc in observed.pvcs_of(instance) {
                    outcome.operations.push(Operation::AnnotatePvc {
                        name: pvc.name.clone(),
                        annotations: [(keys::PVC_STATUS.to_string(), Some(PVC_STATUS_READY.to_string()))]
                            .into_iter()
                            .collect(),
                    });
                }
                outcome.operations.push(Operation::CreatePod(Box::new(generate_instance_pod(
                    cluster,
                    &bindings,
                    role,
                    params.agent_port,
                ))));
                claim_for_role(&mut outcome, job.role, instance);
                tracing::info!(
                    cluster = %cluster_name,
                    instance = %instance,
                    job = %job.name,
                    "Bootstrap job succeeded, starting instance"
                );
            }
            Some(job) => {
                // Failed: excluded from occupancy, only the latest attempt is kept
                outcome.failed_jobs += 1;
                for older in observed.jobs_of(instance) {
                    if older.name != job.name && older.outcome == JobOutcome::Failed {
                        outcome.operations.push(Operation::DeleteJob {
                            name: older.name.clone(),
                        });
                    }
                }
                let reason = job.failure_reason.as_deref().unwrap_or("unknown");
                let next = job.role.replacement(job.fallback_eligible);

                if job.role == JobRole::SnapshotRecovery {
                    if let Some(snapshot) = data.snapshot.as_ref() {
                        if !outcome.excluded_snapshots.contains(snapshot) {
                            outcome.excluded_snapshots.push(snapshot.clone());
                        }
                    }
                }

                if next.needs_primary() && !params.primary_available {
                    outcome.operations.push(Operation::warning(
                        "FailedJob",
                        format!(
                            "Bootstrap job {} failed ({}), waiting for a primary before retrying",
                            job.name, reason
                        ),
                    ));
                    claim_for_role(&mut outcome, next, instance);
                    continue;
                }

                let wait = job
                    .failed_at
                    .and_then(|at| {
                        let due = at + chrono::Duration::from_std(retry_delay(job.attempt)).ok()?;
                        // Negative once the delay has passed
                        (due - params.now).to_std().ok()
                    })
                    .filter(|left| !left.is_zero());
                if let Some(wait) = wait {
                    tracing::debug!(
                        instance = %instance,
                        job = %job.name,
                        wait = ?wait,
                        "Waiting before replacing failed bootstrap job"
                    );
                    outcome.retry_in(wait);
                    claim_for_role(&mut outcome, next, instance);
                    continue;
                }

                tracing::warn!(
                    cluster = %cluster_name,
                    instance = %instance,
                    job = %job.name,
                    reason = %reason,
                    replacement = %next,
                    "Bootstrap job failed, scheduling replacement"
                );
                outcome.operations.push(Operation::warning(
                    "FailedJob",
                    format!(
                        "Bootstrap job {} failed ({}), retrying as {}",
                        job.name, reason, next
                    ),
                ));
                outcome.operations.push(Operation::CreateJob(Box::new(generate_bootstrap_job(
                    cluster,
                    &bindings,
                    next,
                    job.attempt + 1,
                    params.agent_port,
                ))));
                outcome.in_flight = true;
                claim_for_role(&mut outcome, next, instance);
            }
            None => {
                let role = initial_role(cluster, observed, instance);
                if role.needs_primary() && !params.primary_available {
                    claim_for_role(&mut outcome, role, instance);
                    continue;
                }
                if role == JobRole::Initdb {
                    outcome.initial_primary = Some(instance.clone());
                }
                outcome.operations.push(Operation::CreateJob(Box::new(generate_bootstrap_job(
                    cluster,
                    &bindings,
                    role,
                    0,
                    params.agent_port,
                ))));
                outcome.in_flight = true;
                claim_for_role(&mut outcome, role, instance);
            }
        }
    }

    if plan.missing > 0 {
        outcome.pending = true;
        // One new instance at a time, only when nothing else is bootstrapping
        let busy = outcome.in_flight || !plan.initializing_pvc.is_empty();
        if params.allow_new && !busy {
            add_instance(cluster, plan, params, &mut outcome);
        }
    }

    outcome
}

fn claim_for_role(outcome: &mut BootstrapOutcome, role: JobRole, instance: &str) {
    if role == JobRole::Initdb {
        outcome.phase = Some((
            ClusterPhase::SettingUpPrimary,
            format!("Initializing primary instance {}", instance),
        ));
    } else {
        outcome.claim(
            ClusterPhase::CreatingReplica,
            format!("Creating replica {}", instance),
        );
    }
}

/// Create the claims and first job of the next instance
fn add_instance(
    cluster: &PostgresCluster,
    plan: &InstanceSetPlan,
    params: BootstrapParams<'_>,
    outcome: &mut BootstrapOutcome,
) {
    let cluster_name = cluster.name_any();
    let ordinal = plan.next_ordinal;
    let instance = instance_name(&cluster_name, ordinal);
    let has_primary = cluster
        .status
        .as_ref()
        .is_some_and(|s| !s.current_primary.is_empty());

    let (role, snapshot) = if plan.existing.is_empty() && !has_primary {
        (JobRole::Initdb, None)
    } else if !params.primary_available {
        // Replicas copy from the primary; wait until there is one
        return;
    } else {
        match (cluster.replica_join(), cluster.usable_snapshot()) {
            (ReplicaJoinMethod::VolumeSnapshot, Some(snapshot)) => {
                (JobRole::SnapshotRecovery, Some(snapshot.to_string()))
            }
            _ => (JobRole::Join, None),
        }
    };

    tracing::info!(
        cluster = %cluster_name,
        instance = %instance,
        role = %role,
        "Adding instance"
    );

    let bindings = StorageBindings::for_instance(cluster, &instance);
    for (pvc_role, _) in bindings.roles() {
        let source = if pvc_role == PvcRole::Data {
            snapshot.as_deref()
        } else {
            None
        };
        if let Some(pvc) = generate_pvc(cluster, &instance, &pvc_role, source) {
            outcome.operations.push(Operation::CreatePvc(Box::new(pvc)));
        }
    }
    outcome.operations.push(Operation::CreateJob(Box::new(generate_bootstrap_job(
        cluster,
        &bindings,
        role,
        0,
        params.agent_port,
    ))));

    if role == JobRole::Initdb {
        outcome.initial_primary = Some(instance.clone());
    }
    outcome.latest_generated_node = Some(ordinal);
    outcome.in_flight = true;
    claim_for_role(outcome, role, &instance);
}
