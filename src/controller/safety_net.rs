//! Safety net
//!
//! Runs last in every pass. A transitional phase can outlive the work it
//! describes, for example when a job was disrupted but its instance came up
//! through another path. Once the observed cluster already matches the
//! desired one the phase is forced back to `Healthy`.

use crate::crd::ClusterPhase;

/// Facts the safety net decides on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SafetyNetInput {
    pub phase: Option<ClusterPhase>,
    pub ready_instances: usize,
    pub desired_instances: usize,
    /// A bootstrap job is running
    pub job_in_flight: bool,
    /// A promotion, switchover or restart is in progress
    pub promotion_in_flight: bool,
    /// `currentPrimary` equals `targetPrimary` and is set
    pub topology_stable: bool,
}

/// Phase to force, if the current one is stuck
pub fn safety_net(input: SafetyNetInput) -> Option<(ClusterPhase, String)> {
    let phase = input.phase?;
    let converged = input.ready_instances == input.desired_instances
        && !input.job_in_flight
        && !input.promotion_in_flight
        && input.topology_stable;

    if phase.is_transitional() && converged {
        tracing::info!(%phase, "Clearing stale transitional phase");
        return Some((ClusterPhase::Healthy, String::new()));
    }
    None
}
