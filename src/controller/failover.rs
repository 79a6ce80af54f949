//! Failover and switchover controller
//!
//! Primary changes are expressed through `targetPrimary`. When it differs from
//! `currentPrimary` a transition is in flight; the controller relabels pods and
//! the instance agents act on their role label. The transition completes when
//! the target reports it is out of recovery.
//!
//! Failover: the primary is lost, `targetPrimary` becomes the pending marker
//! until every replica's WAL receiver has stopped, then the most advanced
//! eligible replica is elected. Switchover: a named replica is validated, the
//! old primary is demoted and the target promoted once it has caught up.

use std::cmp::Reverse;

use chrono::{DateTime, Duration, Utc};

use crate::controller::instance_set::InstanceSetPlan;
use crate::controller::instance_status::Lsn;
use crate::controller::observed::ObservedCluster;
use crate::controller::operations::Operation;
use crate::crd::{ClusterPhase, PENDING_FAILOVER_MARKER, PostgresCluster, PostgresClusterStatus};
use crate::resources::common::InstanceRole;

/// A replica that may take over the primary role
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub ordinal: u32,
    pub replay_lsn: Lsn,
    pub received_lsn: Option<Lsn>,
}

/// Most advanced replica, lowest ordinal on ties
///
/// With `max_lag_bytes`, candidates whose replay position trails the highest
/// received position among all candidates by more than the limit are not eligible.
pub fn pick_winner(candidates: &[Candidate], max_lag_bytes: Option<u64>) -> Option<&Candidate> {
    let horizon = candidates
        .iter()
        .map(|c| c.received_lsn.unwrap_or(c.replay_lsn).max(c.replay_lsn))
        .max()?;

    candidates
        .iter()
        .filter(|c| max_lag_bytes.is_none_or(|limit| horizon.bytes_after(c.replay_lsn) <= limit))
        .min_by_key(|c| (Reverse(c.replay_lsn), c.ordinal))
}

/// Ready replicas reporting a replay position, minus `exclude`
pub fn candidates(
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    exclude: &str,
    ha_slot_instances: Option<&[String]>,
) -> Vec<Candidate> {
    plan.existing
        .iter()
        .filter(|name| name.as_str() != exclude && !plan.is_removed(name))
        .filter(|name| ha_slot_instances.is_none_or(|allowed| allowed.contains(name)))
        .filter_map(|name| {
            let pod = observed.pod(name).filter(|p| p.ready && !p.terminating)?;
            let status = observed.status(name)?;
            Some(Candidate {
                name: name.clone(),
                ordinal: pod.ordinal,
                replay_lsn: status.replay_lsn?,
                received_lsn: status.received_lsn,
            })
        })
        .collect()
}

/// Primary-related status fields, as written back at the end of a pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    pub current_primary: String,
    pub target_primary: String,
    pub current_primary_timestamp: Option<String>,
    pub target_primary_timestamp: Option<String>,
    pub failing_since: Option<String>,
}

impl Topology {
    pub fn from_status(status: &PostgresClusterStatus) -> Self {
        Self {
            current_primary: status.current_primary.clone(),
            target_primary: status.target_primary.clone(),
            current_primary_timestamp: status.current_primary_timestamp.clone(),
            target_primary_timestamp: status.target_primary_timestamp.clone(),
            failing_since: status.current_primary_failing_since_timestamp.clone(),
        }
    }

    pub fn write_into(&self, status: &mut PostgresClusterStatus) {
        status.current_primary = self.current_primary.clone();
        status.target_primary = self.target_primary.clone();
        status.current_primary_timestamp = self.current_primary_timestamp.clone();
        status.target_primary_timestamp = self.target_primary_timestamp.clone();
        status.current_primary_failing_since_timestamp = self.failing_since.clone();
    }

    pub fn is_stable(&self) -> bool {
        self.current_primary == self.target_primary
    }

    fn set_target(&mut self, target: &str, now: &str) {
        self.target_primary = target.to_string();
        self.target_primary_timestamp = Some(now.to_string());
    }

    fn complete(&mut self, now: &str) {
        self.current_primary = self.target_primary.clone();
        self.current_primary_timestamp = Some(now.to_string());
        self.failing_since = None;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FailoverParams<'a> {
    pub now: DateTime<Utc>,
    pub max_lag_bytes: Option<u64>,
    /// Hibernation is bringing the primary back; a missing primary is expected
    pub rehydrating: bool,
    /// Instance being created by initdb
    pub initial_primary: Option<&'a str>,
    /// Replica a rolling update wants to hand the primary role to
    pub switchover_to: Option<&'a str>,
    /// The primary pod is down because a rolling update restarted it
    pub planned_restart: bool,
    /// Instances whose PostgreSQL is stopped on purpose
    pub fenced: &'a [String],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FailoverOutcome {
    pub topology: Topology,
    pub operations: Vec<Operation>,
    pub phase: Option<(ClusterPhase, String)>,
    /// A primary change is in flight
    pub in_flight: bool,
    /// A failover was started during this pass
    pub failover_started: bool,
}

/// Whether the instance's pod is alive and ready
fn primary_alive(observed: &ObservedCluster, instance: &str) -> bool {
    observed
        .pod(instance)
        .is_some_and(|p| p.ready && !p.terminating && !p.finished)
}

/// The pod is gone, going, or neither ready nor answering its agent
///
/// A pod that is not ready but still reports status may be refreshing its
/// readiness probe after a promotion; that does not count as lost.
fn target_lost(observed: &ObservedCluster, instance: &str) -> bool {
    match observed.pod(instance) {
        None => true,
        Some(pod) => {
            pod.terminating || pod.finished || (!pod.ready && observed.status(instance).is_none())
        }
    }
}

fn relabel(observed: &ObservedCluster, instance: &str, role: InstanceRole) -> Option<Operation> {
    let pod = observed.pod(instance)?;
    if pod.terminating || pod.role == Some(role) {
        return None;
    }
    Some(Operation::SetPodRole {
        name: instance.to_string(),
        role,
    })
}

fn failing_for(failing_since: Option<&str>, now: DateTime<Utc>) -> Duration {
    failing_since
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| now - ts.with_timezone(&Utc))
        .unwrap_or_else(Duration::zero)
}

/// Drive primary election and hand-over
pub fn reconcile_failover(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    status: &PostgresClusterStatus,
    params: FailoverParams<'_>,
) -> FailoverOutcome {
    let now = params.now.to_rfc3339();
    let mut outcome = FailoverOutcome {
        topology: Topology::from_status(status),
        ..Default::default()
    };
    let topo = &mut outcome.topology;

    if params.rehydrating {
        return outcome;
    }

    // First primary: initdb designates it, the agent promotes it
    if topo.current_primary.is_empty() {
        if topo.target_primary.is_empty() {
            if let Some(initial) = params.initial_primary {
                topo.set_target(initial, &now);
            }
        }
        if !topo.target_primary.is_empty()
            && topo.target_primary != PENDING_FAILOVER_MARKER
            && observed.is_primary(&topo.target_primary)
        {
            tracing::info!(primary = %topo.target_primary, "First primary is up");
            topo.complete(&now);
        }
        return outcome;
    }

    if params.fenced.contains(&topo.current_primary) {
        tracing::info!(
            primary = %topo.current_primary,
            "Current primary is fenced, not starting a failover or switchover"
        );
        if topo.is_stable() {
            topo.failing_since = None;
        } else {
            outcome.in_flight = true;
        }
        return outcome;
    }

    if topo.is_stable() {
        let primary = topo.current_primary.clone();
        if primary_alive(observed, &primary) {
            topo.failing_since = None;
            outcome
                .operations
                .extend(relabel(observed, &primary, InstanceRole::Primary));

            if let Some(target) = params.switchover_to.filter(|t| *t != primary) {
                tracing::info!(from = %primary, to = %target, "Starting switchover");
                topo.set_target(target, &now);
                outcome.operations.push(Operation::normal(
                    "SwitchingOver",
                    format!("Switching primary from {} to {}", primary, target),
                ));
            } else {
                return outcome;
            }
        } else if params.planned_restart {
            return outcome;
        } else if !observed.statuses.keys().any(|name| *name != primary) {
            tracing::info!(primary = %primary, "Primary lost and no other instance reports status, waiting for it");
            return outcome;
        } else {
            if topo.failing_since.is_none() {
                topo.failing_since = Some(now.clone());
            }
            let delay = Duration::seconds(cluster.spec.failover_delay.max(0));
            if failing_for(topo.failing_since.as_deref(), params.now) < delay {
                return outcome;
            }

            tracing::warn!(primary = %primary, "Primary lost, starting failover");
            topo.set_target(PENDING_FAILOVER_MARKER, &now);
            outcome
                .operations
                .extend(relabel(observed, &primary, InstanceRole::Replica));
            outcome.operations.push(Operation::warning(
                "FailingOver",
                format!("Primary {} is not available, failing over", primary),
            ));
            outcome.failover_started = true;
        }
    }

    outcome.in_flight = true;
    let current = topo.current_primary.clone();
    let failing_over = topo.failing_since.is_some() || status.phase == Some(ClusterPhase::FailingOver);

    // An elected replica that died before promoting is replaced by a new election
    if failing_over
        && topo.target_primary != PENDING_FAILOVER_MARKER
        && !observed.is_primary(&topo.target_primary)
        && target_lost(observed, &topo.target_primary)
    {
        tracing::warn!(target = %topo.target_primary, "Target primary isn't healthy, switching target");
        outcome.operations.push(Operation::warning(
            "FailoverTargetLost",
            format!("{} was lost before promotion, electing again", topo.target_primary),
        ));
        topo.set_target(PENDING_FAILOVER_MARKER, &now);
    }

    if topo.target_primary == PENDING_FAILOVER_MARKER {
        outcome.phase = Some((
            ClusterPhase::FailingOver,
            format!("Failing over from {}", current),
        ));

        let receivers_down = observed
            .statuses
            .iter()
            .filter(|(name, _)| **name != current)
            .all(|(_, s)| !s.is_wal_receiver_active);
        if !receivers_down {
            return outcome;
        }

        let allowed = cluster
            .ha_slots_enabled()
            .then_some(status.ha_slot_instances.as_slice());
        let mut candidates = candidates(observed, plan, &current, allowed);
        candidates.retain(|c| !params.fenced.contains(&c.name));
        match pick_winner(&candidates, params.max_lag_bytes) {
            Some(winner) => {
                tracing::info!(winner = %winner.name, lsn = %winner.replay_lsn, "Elected new primary");
                topo.set_target(&winner.name, &now);
                outcome
                    .operations
                    .extend(relabel(observed, &winner.name, InstanceRole::Primary));
                outcome.operations.push(Operation::normal(
                    "FailoverTarget",
                    format!("Promoting {} after losing {}", winner.name, current),
                ));
            }
            None => {
                outcome.phase = Some((
                    ClusterPhase::FailingOver,
                    format!("No promotable replica to replace {}", current),
                ));
            }
        }
        return outcome;
    }

    let target = topo.target_primary.clone();

    if observed.is_primary(&target) {
        tracing::info!(from = %current, to = %target, "Primary changed");
        topo.complete(&now);
        outcome.in_flight = false;
        outcome
            .operations
            .extend(relabel(observed, &current, InstanceRole::Replica));
        outcome.operations.push(Operation::normal(
            "PrimaryChanged",
            format!("{} is the new primary", target),
        ));
        return outcome;
    }

    if failing_over {
        outcome.phase = Some((
            ClusterPhase::FailingOver,
            format!("Waiting for {} to be promoted", target),
        ));
        outcome
            .operations
            .extend(relabel(observed, &target, InstanceRole::Primary));
        return outcome;
    }

    // Switchover; validate the target until the old primary has been demoted
    let demotion_started = observed
        .pod(&current)
        .is_some_and(|p| p.role == Some(InstanceRole::Replica));
    let target_valid = plan.existing.contains(&target)
        && !plan.is_removed(&target)
        && primary_alive(observed, &target)
        && observed.status(&target).is_some();
    if !demotion_started && !target_valid {
        tracing::warn!(target = %target, "Rejecting switchover to unavailable instance");
        topo.target_primary = current.clone();
        topo.target_primary_timestamp = topo.current_primary_timestamp.clone();
        outcome.in_flight = false;
        outcome.operations.push(Operation::warning(
            "InvalidSwitchover",
            format!("{} is not a ready, reachable replica", target),
        ));
        return outcome;
    }

    if demotion_started && target_lost(observed, &target) {
        return replace_switchover_target(observed, plan, params, outcome, &current, &target, &now);
    }

    outcome.phase = Some((
        ClusterPhase::SwitchingOver,
        format!("Switching over from {} to {}", current, target),
    ));
    outcome
        .operations
        .extend(relabel(observed, &current, InstanceRole::Replica));

    let old_demoted = !observed.is_primary(&current);
    let caught_up = observed.status(&target).is_some_and(|s| s.is_caught_up());
    if demotion_started && old_demoted && caught_up {
        outcome
            .operations
            .extend(relabel(observed, &target, InstanceRole::Primary));
    }

    outcome
}

/// The switchover target died after the old primary was demoted
///
/// The most advanced live instance takes over, which is usually the demoted
/// primary itself. Without one the switchover turns into a failover.
fn replace_switchover_target(
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    params: FailoverParams<'_>,
    mut outcome: FailoverOutcome,
    current: &str,
    target: &str,
    now: &str,
) -> FailoverOutcome {
    let mut live = candidates(observed, plan, target, None);
    live.retain(|c| !params.fenced.contains(&c.name));
    let topo = &mut outcome.topology;

    match pick_winner(&live, params.max_lag_bytes) {
        Some(winner) => {
            tracing::warn!(lost = %target, winner = %winner.name, "Switchover target lost, switching target");
            topo.set_target(&winner.name, now);
            outcome
                .operations
                .extend(relabel(observed, &winner.name, InstanceRole::Primary));
            outcome.operations.push(Operation::warning(
                "SwitchoverTargetLost",
                format!("{} was lost during switchover, promoting {}", target, winner.name),
            ));
            if winner.name == current {
                outcome.in_flight = false;
            } else {
                outcome.phase = Some((
                    ClusterPhase::SwitchingOver,
                    format!("Switching over from {} to {}", current, winner.name),
                ));
            }
        }
        None => {
            tracing::warn!(lost = %target, "Switchover target lost and no replica is live, failing over");
            topo.set_target(PENDING_FAILOVER_MARKER, now);
            topo.failing_since = Some(now.to_string());
            outcome.failover_started = true;
            outcome.phase = Some((
                ClusterPhase::FailingOver,
                format!("Failing over from {}", current),
            ));
            outcome.operations.push(Operation::warning(
                "FailingOver",
                format!("Switchover target {} was lost, failing over", target),
            ));
        }
    }
    outcome
}
