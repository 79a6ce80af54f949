//! Phase state machine and claim resolution

use postgres_topology_operator::controller::safety_net::{SafetyNetInput, safety_net};
use postgres_topology_operator::controller::state_machine::{
    ClusterEvent, ClusterStateMachine, PhaseClaims, TransitionContext, TransitionResult,
    desired_phase, resolve_phase,
};
use postgres_topology_operator::crd::ClusterPhase;

const ALL_PHASES: [ClusterPhase; 8] = [
    ClusterPhase::SettingUpPrimary,
    ClusterPhase::CreatingReplica,
    ClusterPhase::WaitingForInstances,
    ClusterPhase::Healthy,
    ClusterPhase::FailingOver,
    ClusterPhase::SwitchingOver,
    ClusterPhase::UpgradingCluster,
    ClusterPhase::Hibernated,
];

fn claim(phase: ClusterPhase) -> Option<(ClusterPhase, String)> {
    Some((phase, format!("{} claimed", phase)))
}

fn ready() -> TransitionContext {
    TransitionContext::new(3, 3, true)
}

mod transition_tests {
    use super::*;

    #[test]
    fn test_every_phase_has_an_event_leading_to_it() {
        let sm = ClusterStateMachine::new();
        for phase in ALL_PHASES {
            let result = sm.transition(None, ClusterEvent::for_phase(phase), &ready());
            assert!(
                matches!(result, TransitionResult::Success { to, .. } if to == phase),
                "no transition into {phase}: {result:?}"
            );
        }
    }

    #[test]
    fn test_same_phase_is_unchanged() {
        let sm = ClusterStateMachine::new();
        for phase in ALL_PHASES {
            assert_eq!(
                sm.transition(Some(phase), ClusterEvent::for_phase(phase), &ready()),
                TransitionResult::Unchanged
            );
        }
    }

    #[test]
    fn test_hibernated_only_leaves_through_bootstrap() {
        let sm = ClusterStateMachine::new();
        let events = sm.valid_events(ClusterPhase::Hibernated);
        assert!(events.contains(&ClusterEvent::InitdbStarted));
        assert!(events.contains(&ClusterEvent::ReplicaBootstrapping));
        assert!(events.contains(&ClusterEvent::InstancesNotReady));
        assert!(!events.contains(&ClusterEvent::Converged));
        assert!(!events.contains(&ClusterEvent::PrimaryLost));
        assert!(!events.contains(&ClusterEvent::RollingRestart));
    }

    #[test]
    fn test_switchover_needs_an_established_cluster() {
        let sm = ClusterStateMachine::new();
        assert!(sm.can_transition(ClusterPhase::Healthy, ClusterEvent::SwitchoverStarted));
        assert!(!sm.can_transition(ClusterPhase::SettingUpPrimary, ClusterEvent::SwitchoverStarted));
        assert!(!sm.can_transition(ClusterPhase::FailingOver, ClusterEvent::SwitchoverStarted));
    }

    #[test]
    fn test_converged_guard_checks_topology() {
        let sm = ClusterStateMachine::new();
        let result = sm.transition(
            Some(ClusterPhase::SwitchingOver),
            ClusterEvent::Converged,
            &TransitionContext::new(3, 3, false),
        );
        assert!(matches!(
            result,
            TransitionResult::GuardFailed {
                to: ClusterPhase::Healthy,
                ..
            }
        ));
    }

    #[test]
    fn test_any_active_phase_can_hibernate() {
        let sm = ClusterStateMachine::new();
        for phase in ALL_PHASES.into_iter().filter(|p| *p != ClusterPhase::Hibernated) {
            assert!(sm.can_transition(phase, ClusterEvent::HibernationCompleted));
        }
    }
}

mod resolution_tests {
    use super::*;

    #[test]
    fn test_no_claims_follow_instance_counts() {
        let claims = PhaseClaims::default();
        assert_eq!(desired_phase(&claims, &ready()).0, ClusterPhase::Healthy);

        let (phase, reason) = desired_phase(&claims, &TransitionContext::new(1, 3, true));
        assert_eq!(phase, ClusterPhase::WaitingForInstances);
        assert_eq!(reason, "1 of 3 instances ready");

        let unstable = TransitionContext::new(3, 3, false);
        assert_eq!(
            desired_phase(&claims, &unstable).0,
            ClusterPhase::WaitingForInstances
        );
    }

    #[test]
    fn test_claims_are_ranked() {
        let mut claims = PhaseClaims {
            hibernation: claim(ClusterPhase::Hibernated),
            failover: claim(ClusterPhase::FailingOver),
            bootstrap: claim(ClusterPhase::SettingUpPrimary),
            rolling_update: claim(ClusterPhase::UpgradingCluster),
        };
        let ctx = ready();
        assert_eq!(desired_phase(&claims, &ctx).0, ClusterPhase::Hibernated);
        claims.hibernation = None;
        assert_eq!(desired_phase(&claims, &ctx).0, ClusterPhase::FailingOver);
        claims.failover = None;
        assert_eq!(desired_phase(&claims, &ctx).0, ClusterPhase::SettingUpPrimary);
        claims.bootstrap = claim(ClusterPhase::CreatingReplica);
        assert_eq!(desired_phase(&claims, &ctx).0, ClusterPhase::UpgradingCluster);
        claims.rolling_update = None;
        assert_eq!(desired_phase(&claims, &ctx).0, ClusterPhase::CreatingReplica);
    }

    #[test]
    fn test_resolution_moves_along_allowed_edges() {
        let sm = ClusterStateMachine::new();
        let claims = PhaseClaims {
            failover: claim(ClusterPhase::FailingOver),
            ..Default::default()
        };
        let (phase, reason) = resolve_phase(
            &sm,
            Some(ClusterPhase::Healthy),
            "",
            &claims,
            &TransitionContext::new(2, 3, false),
        );
        assert_eq!(phase, ClusterPhase::FailingOver);
        assert_eq!(reason, "FailingOver claimed");
    }

    #[test]
    fn test_resolution_keeps_phase_on_forbidden_edge() {
        let sm = ClusterStateMachine::new();
        let claims = PhaseClaims {
            rolling_update: claim(ClusterPhase::UpgradingCluster),
            ..Default::default()
        };
        let (phase, reason) = resolve_phase(
            &sm,
            Some(ClusterPhase::SettingUpPrimary),
            "initdb running",
            &claims,
            &ready(),
        );
        assert_eq!(phase, ClusterPhase::SettingUpPrimary);
        assert_eq!(reason, "initdb running");
    }

    #[test]
    fn test_new_cluster_starts_in_claimed_phase() {
        let sm = ClusterStateMachine::new();
        let claims = PhaseClaims {
            bootstrap: claim(ClusterPhase::SettingUpPrimary),
            ..Default::default()
        };
        let (phase, _) = resolve_phase(&sm, None, "", &claims, &TransitionContext::new(0, 3, false));
        assert_eq!(phase, ClusterPhase::SettingUpPrimary);
    }
}

mod safety_net_tests {
    use super::*;

    #[test]
    fn test_stuck_replica_phase_is_cleared() {
        let input = SafetyNetInput {
            phase: Some(ClusterPhase::CreatingReplica),
            ready_instances: 2,
            desired_instances: 2,
            job_in_flight: false,
            promotion_in_flight: false,
            topology_stable: true,
        };
        assert_eq!(
            safety_net(input),
            Some((ClusterPhase::Healthy, String::new()))
        );
    }

    #[test]
    fn test_unstable_topology_is_not_healthy() {
        let input = SafetyNetInput {
            phase: Some(ClusterPhase::FailingOver),
            ready_instances: 2,
            desired_instances: 2,
            topology_stable: false,
            ..Default::default()
        };
        assert_eq!(safety_net(input), None);
    }

    #[test]
    fn test_missing_phase_is_left_to_resolution() {
        assert_eq!(safety_net(SafetyNetInput::default()), None);
    }
}
