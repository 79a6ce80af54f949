//! Finite state machine for the cluster phase
//!
//! Sub-controllers claim the phase that describes the work they have in
//! flight. `desired_phase` picks the claim that wins and the transition table
//! decides whether the cluster may move there from its current phase. Phases
//! only move along listed transitions; guards keep `Healthy` honest.

use std::fmt;

use crate::crd::ClusterPhase;

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// The first instance is running initdb
    InitdbStarted,
    /// A replica is being bootstrapped
    ReplicaBootstrapping,
    /// Some instances are missing or not ready
    InstancesNotReady,
    /// The primary was lost
    PrimaryLost,
    /// The primary role is being handed to a named replica
    SwitchoverStarted,
    /// Pods are being recreated for a template change
    RollingRestart,
    /// Every instance is ready and the topology is stable
    Converged,
    /// Hibernation deleted everything but the primary's claims
    HibernationCompleted,
}

impl ClusterEvent {
    /// Event that leads to `phase`
    pub fn for_phase(phase: ClusterPhase) -> Self {
        match phase {
            ClusterPhase::SettingUpPrimary => ClusterEvent::InitdbStarted,
            ClusterPhase::CreatingReplica => ClusterEvent::ReplicaBootstrapping,
            ClusterPhase::WaitingForInstances => ClusterEvent::InstancesNotReady,
            ClusterPhase::FailingOver => ClusterEvent::PrimaryLost,
            ClusterPhase::SwitchingOver => ClusterEvent::SwitchoverStarted,
            ClusterPhase::UpgradingCluster => ClusterEvent::RollingRestart,
            ClusterPhase::Healthy => ClusterEvent::Converged,
            ClusterPhase::Hibernated => ClusterEvent::HibernationCompleted,
        }
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::InitdbStarted => write!(f, "InitdbStarted"),
            ClusterEvent::ReplicaBootstrapping => write!(f, "ReplicaBootstrapping"),
            ClusterEvent::InstancesNotReady => write!(f, "InstancesNotReady"),
            ClusterEvent::PrimaryLost => write!(f, "PrimaryLost"),
            ClusterEvent::SwitchoverStarted => write!(f, "SwitchoverStarted"),
            ClusterEvent::RollingRestart => write!(f, "RollingRestart"),
            ClusterEvent::Converged => write!(f, "Converged"),
            ClusterEvent::HibernationCompleted => write!(f, "HibernationCompleted"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext {
    pub ready_instances: usize,
    pub desired_instances: usize,
    /// `currentPrimary` is set and equals `targetPrimary`
    pub topology_stable: bool,
}

impl TransitionContext {
    pub fn new(ready_instances: usize, desired_instances: usize, topology_stable: bool) -> Self {
        Self {
            ready_instances,
            desired_instances,
            topology_stable,
        }
    }

    pub fn all_instances_ready(&self) -> bool {
        self.ready_instances >= self.desired_instances
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    /// Source states
    pub from: &'static [ClusterPhase],
    pub to: ClusterPhase,
    pub event: ClusterEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: &'static [ClusterPhase],
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq)]
pub enum TransitionResult {
    Success {
        from: Option<ClusterPhase>,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    },
    /// Already in the target phase
    Unchanged,
    InvalidTransition {
        current: ClusterPhase,
        event: ClusterEvent,
    },
    GuardFailed {
        to: ClusterPhase,
        event: ClusterEvent,
        reason: String,
    },
}

use ClusterPhase::*;

const ALL_ACTIVE: &[ClusterPhase] = &[
    SettingUpPrimary,
    CreatingReplica,
    WaitingForInstances,
    Healthy,
    FailingOver,
    SwitchingOver,
    UpgradingCluster,
];

/// Phase state machine
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                Transition::new(
                    &[WaitingForInstances, FailingOver, Hibernated],
                    SettingUpPrimary,
                    ClusterEvent::InitdbStarted,
                    "Initializing the first instance",
                ),
                Transition::new(
                    &[
                        SettingUpPrimary,
                        WaitingForInstances,
                        Healthy,
                        FailingOver,
                        SwitchingOver,
                        UpgradingCluster,
                        Hibernated,
                    ],
                    CreatingReplica,
                    ClusterEvent::ReplicaBootstrapping,
                    "Bootstrapping a replica",
                ),
                Transition::new(
                    &[
                        SettingUpPrimary,
                        CreatingReplica,
                        Healthy,
                        FailingOver,
                        SwitchingOver,
                        UpgradingCluster,
                        Hibernated,
                    ],
                    WaitingForInstances,
                    ClusterEvent::InstancesNotReady,
                    "Waiting for instances to become ready",
                ),
                Transition::new(
                    &[
                        SettingUpPrimary,
                        CreatingReplica,
                        WaitingForInstances,
                        Healthy,
                        SwitchingOver,
                        UpgradingCluster,
                    ],
                    FailingOver,
                    ClusterEvent::PrimaryLost,
                    "Primary lost, electing a replacement",
                ),
                Transition::new(
                    &[CreatingReplica, WaitingForInstances, Healthy, UpgradingCluster],
                    SwitchingOver,
                    ClusterEvent::SwitchoverStarted,
                    "Handing over the primary role",
                ),
                Transition::new(
                    &[CreatingReplica, WaitingForInstances, Healthy, FailingOver, SwitchingOver],
                    UpgradingCluster,
                    ClusterEvent::RollingRestart,
                    "Restarting instances for a pod template change",
                ),
                Transition::new(
                    ALL_ACTIVE,
                    Healthy,
                    ClusterEvent::Converged,
                    "All instances ready",
                ),
                Transition::new(
                    ALL_ACTIVE,
                    Hibernated,
                    ClusterEvent::HibernationCompleted,
                    "Cluster hibernated",
                ),
            ],
        }
    }

    /// Attempt to move from `current` to the phase `event` leads to
    pub fn transition(
        &self,
        current: Option<ClusterPhase>,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let Some(transition) = self.transitions.iter().find(|t| t.event == event) else {
            return match current {
                Some(current) => TransitionResult::InvalidTransition { current, event },
                None => TransitionResult::Unchanged,
            };
        };

        if current == Some(transition.to) {
            return TransitionResult::Unchanged;
        }
        if let Some(current) = current {
            if !self.can_transition(current, event) {
                return TransitionResult::InvalidTransition { current, event };
            }
        }
        if let Some(reason) = self.check_guard(transition, ctx) {
            return TransitionResult::GuardFailed {
                to: transition.to,
                event,
                reason,
            };
        }
        TransitionResult::Success {
            from: current,
            to: transition.to,
            event,
            description: transition.description,
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: ClusterPhase, event: ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.event == event && t.from.contains(&from))
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: ClusterPhase) -> Vec<ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from.contains(&state))
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            ClusterEvent::Converged if !ctx.all_instances_ready() => Some(format!(
                "Not all instances ready: {}/{}",
                ctx.ready_instances, ctx.desired_instances
            )),
            ClusterEvent::Converged if !ctx.topology_stable => {
                Some("Primary change in progress".to_string())
            }
            _ => None,
        }
    }
}

/// Phases claimed by sub-controllers during one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhaseClaims {
    pub hibernation: Option<(ClusterPhase, String)>,
    pub failover: Option<(ClusterPhase, String)>,
    pub bootstrap: Option<(ClusterPhase, String)>,
    pub rolling_update: Option<(ClusterPhase, String)>,
}

/// Phase the cluster should be in, given the claims
///
/// Hibernation wins, then primary changes, then initdb, then restarts,
/// then replica bootstrap. Without claims the instance counts decide.
pub fn desired_phase(claims: &PhaseClaims, ctx: &TransitionContext) -> (ClusterPhase, String) {
    let setting_up = claims
        .bootstrap
        .as_ref()
        .filter(|(phase, _)| *phase == SettingUpPrimary);

    claims
        .hibernation
        .as_ref()
        .or(claims.failover.as_ref())
        .or(setting_up)
        .or(claims.rolling_update.as_ref())
        .or(claims.bootstrap.as_ref())
        .cloned()
        .unwrap_or_else(|| {
            if ctx.all_instances_ready() && ctx.topology_stable {
                (Healthy, String::new())
            } else {
                (
                    WaitingForInstances,
                    format!(
                        "{} of {} instances ready",
                        ctx.ready_instances, ctx.desired_instances
                    ),
                )
            }
        })
}

/// Resolve the phase for this pass, staying put when the move is not allowed
pub fn resolve_phase(
    machine: &ClusterStateMachine,
    current: Option<ClusterPhase>,
    current_reason: &str,
    claims: &PhaseClaims,
    ctx: &TransitionContext,
) -> (ClusterPhase, String) {
    let (target, reason) = desired_phase(claims, ctx);
    match machine.transition(current, ClusterEvent::for_phase(target), ctx) {
        TransitionResult::Success { from, to, event, description } => {
            tracing::info!(from = ?from, to = %to, event = %event, "{}", description);
            (to, reason)
        }
        TransitionResult::Unchanged => (target, reason),
        TransitionResult::InvalidTransition { current, event } => {
            tracing::debug!(
                phase = %current,
                event = %event,
                valid = ?machine.valid_events(current),
                "Phase transition not allowed"
            );
            (current, current_reason.to_string())
        }
        TransitionResult::GuardFailed { to, reason: why, .. } => {
            tracing::debug!(to = %to, reason = %why, "Phase transition blocked");
            (
                current.unwrap_or(WaitingForInstances),
                current_reason.to_string(),
            )
        }
    }
}
