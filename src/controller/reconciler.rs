//! Reconciliation logic for PostgresCluster resources
//!
//! One pass observes the cluster, lets every sub-controller decide on the same
//! snapshot, writes the resulting status and only then applies the decided
//! operations. A status conflict therefore aborts the pass before anything
//! else changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::controller::bootstrap::{BootstrapOutcome, BootstrapParams, reconcile_bootstrap};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::failover::{FailoverParams, Topology, reconcile_failover};
use crate::controller::fencing::{mark_new_pods, reconcile_fencing};
use crate::controller::hibernation::{HibernationOutcome, HibernationRequest, reconcile_hibernation};
use crate::controller::instance_set::{
    InstanceSetPlan, missing_volume_operations, plan, removal_operations,
};
use crate::controller::observed::{ObservedCluster, observe};
use crate::controller::operations::{Executor, Operation, apply_resource, create_resource};
use crate::controller::rolling_update::{is_planned_primary_restart, reconcile_rolling_update};
use crate::controller::safety_net::{SafetyNetInput, safety_net};
use crate::controller::slots::sync_slots;
use crate::controller::state_machine::{
    ClusterStateMachine, PhaseClaims, TransitionContext, resolve_phase,
};
use crate::controller::status::{ConditionBuilder, StatusManager};
use crate::crd::{
    AvailableArchitecture, PENDING_FAILOVER_MARKER, PostgresCluster, PostgresClusterSpec,
    PostgresClusterStatus,
};
use crate::resources::common::InstanceRole;
use crate::resources::pod::generate_instance_pod;
use crate::resources::pvc::StorageBindings;
use crate::resources::{config_map, rbac, secret, service};

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();

    debug!("Reconciling PostgresCluster");

    let observed = observe(&cluster, &ctx).await?;
    let pass = decide_pass(&cluster, &observed, &ctx.config, Utc::now())?;

    if !pass.suspended && HibernationRequest::from_cluster(&cluster) != HibernationRequest::On {
        match &pass.restored_spec {
            Some(spec) => {
                let mut restored = (*cluster).clone();
                restored.spec = spec.clone();
                apply_ancillary_resources(&restored, &ctx, &ns).await?;
            }
            None => apply_ancillary_resources(&cluster, &ctx, &ns).await?,
        }
    }

    let written = StatusManager::new(&cluster, &ctx, &ns)
        .update(&pass.status)
        .await?;
    if written {
        debug!(phase = ?pass.status.phase, "Status updated");
    }

    let mut executor = Executor::new(&ctx, &cluster);
    for (group, ops) in pass.groups {
        if !ops.is_empty() {
            executor.run_group(group, ops).await;
        }
    }

    if let Some(health) = &ctx.health_state {
        let metrics = &health.metrics;
        metrics.record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
        metrics.set_cluster_instances(
            &ns,
            &name,
            i64::from(cluster.spec.instances),
            i64::from(pass.status.ready_instances),
        );
        if let Some(phase) = pass.status.phase {
            let previous = cluster
                .status
                .as_ref()
                .and_then(|s| s.phase)
                .map(|p| p.to_string());
            metrics.set_cluster_phase(&ns, &name, previous.as_deref(), &phase.to_string());
        }
        if pass.failover_started {
            metrics.record_failover(&ns, &name);
        }
        if pass.failed_jobs > 0 {
            metrics.record_failed_jobs(&ns, &name, pass.failed_jobs);
        }
        health.mark_reconciled();
    }

    ctx.reset_errors(&format!("{}/{}", ns, name));

    let mut interval = if pass.in_flight {
        ctx.config.in_flight_resync_interval
    } else {
        ctx.config.resync_interval
    };
    if let Some(retry) = pass.retry_after {
        interval = interval.min(retry);
    }
    Ok(Action::requeue(interval))
}

/// Error policy for the controller
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let attempt = ctx.record_error(&format!("{}/{}", ns, name), error);
    let delay = BackoffConfig::default().delay_for_error(error, attempt.saturating_sub(1));

    if let Some(health) = &ctx.health_state {
        health.metrics.record_error(&ns, &name);
    }

    if error.is_retryable() {
        warn!(
            "Retryable error for {}/{} (attempt {}): {}, requeuing in {:?}",
            ns, name, attempt, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}/{} (attempt {}): {}, requeuing in {:?} for manual intervention",
            ns, name, attempt, error, delay
        );
    }

    Action::requeue(delay)
}

/// Everything one pass decided
#[derive(Clone, Debug)]
pub struct PassPlan {
    pub status: PostgresClusterStatus,
    /// Operation groups in execution order
    pub groups: Vec<(&'static str, Vec<Operation>)>,
    pub in_flight: bool,
    pub failover_started: bool,
    pub failed_jobs: u32,
    /// Hibernation owned the pass
    pub suspended: bool,
    /// Spec the per-cluster objects are built from while resuming
    pub restored_spec: Option<PostgresClusterSpec>,
    /// A failed job is waiting out its backoff
    pub retry_after: Option<Duration>,
}

impl PassPlan {
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.groups.iter().flat_map(|(_, ops)| ops.iter())
    }
}

/// Decide one pass from a snapshot; nothing here talks to the API server
pub fn decide_pass(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> Result<PassPlan> {
    let hibernation = reconcile_hibernation(cluster, observed)?;
    Ok(if hibernation.suspend {
        suspended_pass(cluster, hibernation)
    } else {
        topology_pass(cluster, config, observed, hibernation, now)
    })
}

/// Hibernation owns the cluster; nothing else runs
fn suspended_pass(cluster: &PostgresCluster, hibernation: HibernationOutcome) -> PassPlan {
    let mut status = cluster.status.clone().unwrap_or_default();
    if let Some((phase, reason)) = hibernation.phase {
        status.phase = Some(phase);
        status.phase_reason = reason;
    }
    status.conditions = ConditionBuilder::from_existing(
        std::mem::take(&mut status.conditions),
        cluster.metadata.generation,
    )
    .hibernation(hibernation.condition.as_ref())
    .build();
    status.observed_generation = cluster.metadata.generation;

    let in_flight = !hibernation.operations.is_empty();
    PassPlan {
        status,
        groups: vec![("hibernation", hibernation.operations)],
        in_flight,
        failover_started: false,
        failed_jobs: 0,
        suspended: true,
        restored_spec: None,
        retry_after: None,
    }
}

fn topology_pass(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
    observed: &ObservedCluster,
    hibernation: HibernationOutcome,
    now: DateTime<Utc>,
) -> PassPlan {
    let mut status = cluster.status.clone().unwrap_or_default();
    if let Some(primary) = hibernation.adopt_primary.as_ref() {
        status.current_primary = primary.clone();
        status.target_primary = primary.clone();
    }
    if let Some(node) = hibernation.adopt_latest_generated_node {
        status.latest_generated_node = status.latest_generated_node.max(node);
    }

    // Sub-controllers read the status the pass is building, not the stale one
    let mut view = cluster.clone();
    view.status = Some(status.clone());
    if let Some(spec) = hibernation.restore_spec.clone() {
        view.spec = spec;
    }
    let cluster = &view;

    let plan = plan(cluster, observed);
    let fencing = reconcile_fencing(cluster, observed, &plan);
    status.fenced_instances = fencing.fenced.clone();

    let stable = status.current_primary == status.target_primary;
    let current = status.current_primary.clone();
    let confirmed_primary =
        (!current.is_empty() && observed.is_primary(&current)).then_some(current.as_str());

    let designated = [status.target_primary.as_str(), current.as_str()]
        .into_iter()
        .find(|name| !name.is_empty() && *name != PENDING_FAILOVER_MARKER);
    let mut bootstrap = reconcile_bootstrap(
        cluster,
        observed,
        &plan,
        BootstrapParams {
            designated_primary: designated,
            primary_available: confirmed_primary.is_some(),
            allow_new: stable && plan.to_remove.is_empty() && !hibernation.rehydrating,
            agent_port: config.instance_agent_port,
            now,
        },
    );
    mark_new_pods(&mut bootstrap.operations, &fencing);

    let slots = sync_slots(cluster, observed, &plan, confirmed_primary.filter(|_| stable));
    if let Some(instances) = slots.ha_slot_instances.clone() {
        status.ha_slot_instances = instances;
    }

    let busy = bootstrap.in_flight || bootstrap.pending || hibernation.rehydrating;
    let rolling = reconcile_rolling_update(
        cluster,
        observed,
        &plan,
        (stable && !current.is_empty()).then_some(current.as_str()),
        busy,
    );

    let planned_restart =
        !current.is_empty() && is_planned_primary_restart(cluster, observed, &plan, &current);
    let failover = reconcile_failover(
        cluster,
        observed,
        &plan,
        &status,
        FailoverParams {
            now,
            max_lag_bytes: config.failover_max_lag_bytes,
            rehydrating: hibernation.rehydrating,
            initial_primary: bootstrap.initial_primary.as_deref(),
            switchover_to: rolling.switchover_to.as_deref(),
            planned_restart,
            fenced: &fencing.fenced,
        },
    );
    failover.topology.write_into(&mut status);

    let settled = !bootstrap.in_flight
        && !rolling.in_flight
        && !failover.in_flight
        && failover.topology.is_stable();
    let scale_down = match plan.to_remove.first() {
        Some(instance) if settled => {
            info!(instance = %instance, "Scaling down");
            let mut ops = removal_operations(observed, instance);
            ops.push(Operation::normal(
                "ScaledDown",
                format!("Removed instance {}", instance),
            ));
            ops
        }
        _ => Vec::new(),
    };

    let mut volumes = volume_operations(cluster, observed, &plan, &failover.topology, config);
    mark_new_pods(&mut volumes, &fencing);

    record_instances(&mut status, cluster, observed, &plan, &bootstrap);

    let topology_stable =
        failover.topology.is_stable() && !failover.topology.current_primary.is_empty();
    let tctx = TransitionContext::new(plan.ready.len(), plan.desired, topology_stable);
    let claims = PhaseClaims {
        hibernation: hibernation.phase.clone(),
        failover: failover.phase.clone(),
        bootstrap: bootstrap.phase.clone(),
        rolling_update: rolling.phase.clone(),
    };
    let (mut phase, mut reason) = resolve_phase(
        &ClusterStateMachine::new(),
        status.phase,
        &status.phase_reason,
        &claims,
        &tctx,
    );
    if let Some((forced, forced_reason)) = safety_net(SafetyNetInput {
        phase: Some(phase),
        ready_instances: plan.ready.len(),
        desired_instances: plan.desired,
        job_in_flight: bootstrap.in_flight,
        promotion_in_flight: failover.in_flight || rolling.in_flight,
        topology_stable,
    }) {
        phase = forced;
        reason = forced_reason;
    }
    status.phase = Some(phase);
    status.phase_reason = reason;

    let all_ready = tctx.all_instances_ready();
    let in_flight = bootstrap.in_flight
        || bootstrap.pending
        || rolling.in_flight
        || failover.in_flight
        || hibernation.rehydrating
        || !scale_down.is_empty()
        || phase.is_transitional();
    status.conditions = ConditionBuilder::from_existing(
        std::mem::take(&mut status.conditions),
        cluster.metadata.generation,
    )
    .ready(
        all_ready,
        if all_ready { "AllInstancesReady" } else { "InstancesNotReady" },
        &format!("{}/{} instances ready", plan.ready.len(), plan.desired),
    )
    .progressing(in_flight, &phase.to_string(), &status.phase_reason)
    .hibernation(hibernation.condition.as_ref())
    .build();
    status.observed_generation = cluster.metadata.generation;

    PassPlan {
        status,
        groups: vec![
            ("hibernation", hibernation.operations),
            ("fencing", fencing.operations),
            ("bootstrap", bootstrap.operations),
            ("volumes", volumes),
            ("slots", slots.operations),
            ("rolling-update", rolling.operations),
            ("failover", failover.operations),
            ("scale-down", scale_down),
        ],
        in_flight,
        failover_started: failover.failover_started,
        failed_jobs: bootstrap.failed_jobs,
        suspended: false,
        restored_spec: hibernation.restore_spec,
        retry_after: bootstrap.retry_after,
    }
}

/// Role a dangling instance comes back with, `None` to leave it detached
///
/// Only a settled primary, or the first one while nothing has been promoted
/// yet, comes back as primary. A current primary that is being replaced
/// stays down until the new one has taken over; everything else rejoins as
/// a replica and is promoted through the failover path.
pub fn reattach_role(topology: &Topology, instance: &str) -> Option<InstanceRole> {
    let current = topology.current_primary.as_str();
    let target = topology.target_primary.as_str();
    if current.is_empty() {
        return Some(if instance == target && target != PENDING_FAILOVER_MARKER {
            InstanceRole::Primary
        } else {
            InstanceRole::Replica
        });
    }
    if instance == current {
        return topology.is_stable().then_some(InstanceRole::Primary);
    }
    Some(InstanceRole::Replica)
}

/// Recreate missing claims and pods of bootstrapped instances, drop broken pods
fn volume_operations(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    topology: &Topology,
    config: &OperatorConfig,
) -> Vec<Operation> {
    let mut ops = missing_volume_operations(cluster, plan);
    for instance in &plan.reattach {
        let Some(role) = reattach_role(topology, instance) else {
            debug!(instance = %instance, target = %topology.target_primary, "Old primary stays down until the new one takes over");
            continue;
        };
        info!(instance = %instance, role = %role, "Reattaching pod to existing claims");
        ops.push(Operation::CreatePod(Box::new(generate_instance_pod(
            cluster,
            &StorageBindings::for_instance(cluster, instance),
            role,
            config.instance_agent_port,
        ))));
    }
    for pod in &plan.broken_pods {
        if observed.pod(pod).is_some() {
            warn!(pod = %pod, "Deleting pod without usable data or with a finished container");
            ops.push(Operation::DeletePod { name: pod.clone() });
        }
    }
    ops
}

fn record_instances(
    status: &mut PostgresClusterStatus,
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    bootstrap: &BootstrapOutcome,
) {
    status.ready_instances = i32::try_from(plan.ready.len()).unwrap_or(i32::MAX);
    status.instances = i32::try_from(plan.existing.len()).unwrap_or(i32::MAX);
    status.instance_names = plan.existing.clone();
    status.healthy_pvc = plan.healthy_pvc.clone();
    status.dangling_pvc = plan.dangling_pvc.clone();
    status.initializing_pvc = plan.initializing_pvc.clone();
    status.excluded_snapshots = bootstrap.excluded_snapshots.clone();
    if let Some(node) = bootstrap.latest_generated_node {
        let node = i32::try_from(node).unwrap_or(i32::MAX);
        status.latest_generated_node = status.latest_generated_node.max(node);
    }

    for instance in observed.statuses.values() {
        let (Some(arch), Some(hash)) = (&instance.arch, &instance.executable_hash) else {
            continue;
        };
        if !status.available_architectures.iter().any(|a| a.arch == *arch) {
            debug!(cluster = %cluster.name_any(), arch = %arch, "Recording architecture");
            status.available_architectures.push(AvailableArchitecture {
                arch: arch.clone(),
                hash: hash.clone(),
            });
        }
    }
}

/// Apply the per-cluster objects every instance depends on
async fn apply_ancillary_resources(cluster: &PostgresCluster, ctx: &Context, ns: &str) -> Result<()> {
    // The password is generated once and never rotated by the operator
    create_resource(ctx, ns, &secret::generate_credentials_secret(cluster)).await?;
    apply_resource(ctx, ns, &config_map::generate_config_map(cluster)).await?;
    apply_resource(ctx, ns, &rbac::generate_service_account(cluster)).await?;
    apply_resource(ctx, ns, &rbac::generate_role(cluster)).await?;
    apply_resource(ctx, ns, &rbac::generate_role_binding(cluster)).await?;
    for svc in service::generate_services(cluster) {
        apply_resource(ctx, ns, &svc).await?;
    }
    Ok(())
}
