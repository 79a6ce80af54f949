// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the topology decisions
//!
//! These tests use proptest to generate random topologies and verify that:
//! 1. Primary election is deterministic and independent of input order
//! 2. Scale-down never picks a primary and removes exactly the excess
//! 3. Slot synchronization converges to one slot per bootstrapped replica
//! 4. Phase resolution never panics and only lands on reachable phases

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeSet;

use proptest::prelude::*;

use common::*;
use postgres_topology_operator::controller::failover::{Candidate, pick_winner};
use postgres_topology_operator::controller::instance_set::plan;
use postgres_topology_operator::controller::instance_status::Lsn;
use postgres_topology_operator::controller::operations::Operation;
use postgres_topology_operator::controller::safety_net::{SafetyNetInput, safety_net};
use postgres_topology_operator::controller::slots::{SlotAction, slot_name, sync_slots};
use postgres_topology_operator::controller::state_machine::{
    ClusterEvent, ClusterStateMachine, PhaseClaims, TransitionContext, resolve_phase,
};
use postgres_topology_operator::crd::{ClusterPhase, DEFAULT_HA_SLOT_PREFIX};

// =============================================================================
// Strategy generators
// =============================================================================

/// Candidates with distinct ordinals; LSNs drawn from a small range so ties happen
fn candidate_set() -> impl Strategy<Value = Vec<Candidate>> {
    prop::collection::btree_set(1..=20u32, 1..=8)
        .prop_flat_map(|ordinals| {
            let n = ordinals.len();
            (
                Just(ordinals),
                prop::collection::vec((0..=8u64, 0..=4u64), n),
            )
        })
        .prop_map(|(ordinals, positions)| {
            ordinals
                .into_iter()
                .zip(positions)
                .map(|(ordinal, (replay, ahead))| Candidate {
                    name: format!("pg-{}", ordinal),
                    ordinal,
                    replay_lsn: Lsn(replay * 0x100),
                    received_lsn: Some(Lsn((replay + ahead) * 0x100)),
                })
                .collect()
        })
}

fn cluster_phase() -> impl Strategy<Value = ClusterPhase> {
    prop_oneof![
        Just(ClusterPhase::SettingUpPrimary),
        Just(ClusterPhase::CreatingReplica),
        Just(ClusterPhase::WaitingForInstances),
        Just(ClusterPhase::Healthy),
        Just(ClusterPhase::FailingOver),
        Just(ClusterPhase::SwitchingOver),
        Just(ClusterPhase::UpgradingCluster),
        Just(ClusterPhase::Hibernated),
    ]
}

fn cluster_event() -> impl Strategy<Value = ClusterEvent> {
    prop_oneof![
        Just(ClusterEvent::InitdbStarted),
        Just(ClusterEvent::ReplicaBootstrapping),
        Just(ClusterEvent::InstancesNotReady),
        Just(ClusterEvent::PrimaryLost),
        Just(ClusterEvent::SwitchoverStarted),
        Just(ClusterEvent::RollingRestart),
        Just(ClusterEvent::Converged),
        Just(ClusterEvent::HibernationCompleted),
    ]
}

fn phase_claim() -> impl Strategy<Value = Option<(ClusterPhase, String)>> {
    prop::option::of(cluster_phase().prop_map(|p| (p, format!("{} claimed", p))))
}

fn phase_claims() -> impl Strategy<Value = PhaseClaims> {
    (phase_claim(), phase_claim(), phase_claim(), phase_claim()).prop_map(
        |(hibernation, failover, bootstrap, rolling_update)| PhaseClaims {
            hibernation,
            failover,
            bootstrap,
            rolling_update,
        },
    )
}

/// Instance count, desired count and which ordinal is primary
fn topology() -> impl Strategy<Value = (u32, i32, u32)> {
    (1..=8u32).prop_flat_map(|n| (Just(n), 0..=10i32, 1..=n))
}

// =============================================================================
// Property tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Election does not depend on the order candidates are listed in
    #[test]
    fn prop_election_is_order_independent(
        (candidates, shuffled) in candidate_set().prop_flat_map(|c| {
            (Just(c.clone()), Just(c).prop_shuffle())
        }),
        limit in prop::option::of(0..=0x400u64),
    ) {
        let a = pick_winner(&candidates, limit).map(|c| c.name.clone());
        let b = pick_winner(&shuffled, limit).map(|c| c.name.clone());
        prop_assert_eq!(a, b);
    }

    /// The winner has the highest replay position, ties to the lowest ordinal
    #[test]
    fn prop_winner_is_most_advanced(candidates in candidate_set()) {
        let winner = pick_winner(&candidates, None).expect("non-empty set has a winner");
        for other in &candidates {
            prop_assert!(other.replay_lsn <= winner.replay_lsn);
            if other.replay_lsn == winner.replay_lsn {
                prop_assert!(winner.ordinal <= other.ordinal);
            }
        }
    }

    /// A lag limit only ever removes candidates, and the winner respects it
    #[test]
    fn prop_lag_limit_is_respected(candidates in candidate_set(), limit in 0..=0x400u64) {
        let horizon = candidates
            .iter()
            .map(|c| c.received_lsn.unwrap_or(c.replay_lsn).max(c.replay_lsn))
            .max()
            .unwrap();
        match pick_winner(&candidates, Some(limit)) {
            Some(winner) => prop_assert!(horizon.bytes_after(winner.replay_lsn) <= limit),
            None => prop_assert!(
                candidates.iter().all(|c| horizon.bytes_after(c.replay_lsn) > limit)
            ),
        }
    }

    /// Scale-down removes exactly the excess and never the primary
    #[test]
    fn prop_scale_down_spares_primary((n, desired, primary) in topology()) {
        let primary_name = format!("pg-{}", primary);
        let cluster = PostgresClusterBuilder::new("pg", "default")
            .with_instances(desired)
            .with_primary(&primary_name)
            .build();
        let mut builder = ObservedBuilder::new("pg");
        for ordinal in 1..=n {
            builder = if ordinal == primary {
                builder.primary(ordinal, 0x1000)
            } else {
                builder.replica(ordinal, 0x1000)
            };
        }
        let observed = builder.build();
        let set = plan(&cluster, &observed);

        let existing = n as usize;
        let desired = desired as usize;
        // The primary is never removed, so at most n - 1 instances go
        let expected = existing.saturating_sub(desired).min(existing - 1);
        prop_assert_eq!(set.to_remove.len(), expected);
        prop_assert!(!set.is_removed(&primary_name));
        prop_assert_eq!(set.missing, desired.saturating_sub(existing));
        prop_assert!(set.next_ordinal > n);

        let unique: BTreeSet<&String> = set.to_remove.iter().collect();
        prop_assert_eq!(unique.len(), set.to_remove.len());
    }

    /// One pass of slot operations on the primary yields one slot per replica
    #[test]
    fn prop_primary_slots_converge(
        n in 1..=6u32,
        stale in prop::collection::btree_set(10..=20u32, 0..=3),
        present in prop::collection::btree_set(2..=6u32, 0..=5),
    ) {
        let cluster = PostgresClusterBuilder::new("pg", "default")
            .with_instances(n as i32)
            .with_primary("pg-1")
            .build();
        let mut builder = ObservedBuilder::new("pg").primary(1, 0x1000).no_slots(1);
        for ordinal in 2..=n {
            builder = builder.replica(ordinal, 0x1000);
        }
        let name_of = |ordinal: u32| slot_name(DEFAULT_HA_SLOT_PREFIX, &format!("pg-{}", ordinal));
        for ordinal in present.iter().filter(|o| **o <= n) {
            builder = builder.slot(1, &name_of(*ordinal), true, Some(0x1000));
        }
        for ordinal in &stale {
            builder = builder.slot(1, &name_of(*ordinal), false, None);
        }
        let observed = builder.build();
        let set = plan(&cluster, &observed);
        let result = sync_slots(&cluster, &observed, &set, Some("pg-1"));

        let mut slots: BTreeSet<String> = observed.slots["pg-1"].iter().map(|s| s.name.clone()).collect();
        for op in &result.operations {
            if let Operation::Slot(slot) = op {
                if slot.instance != "pg-1" {
                    continue;
                }
                match slot.action {
                    SlotAction::Create => { slots.insert(slot.slot.clone()); }
                    SlotAction::Drop => { slots.remove(&slot.slot); }
                    SlotAction::Advance(_) => {}
                }
            }
        }

        let expected: BTreeSet<String> = (2..=n).map(name_of).collect();
        prop_assert_eq!(slots, expected);
    }

    /// The state machine never panics on any phase and event
    #[test]
    fn prop_state_machine_no_panic(
        phase in cluster_phase(),
        event in cluster_event(),
        ready in 0..5usize,
        desired in 0..5usize,
        stable in any::<bool>(),
    ) {
        let sm = ClusterStateMachine::new();
        let ctx = TransitionContext::new(ready, desired, stable);
        let _ = sm.transition(Some(phase), event, &ctx);
        let _ = sm.transition(None, event, &ctx);
    }

    /// Resolution either stays put or moves along a listed edge
    #[test]
    fn prop_resolution_follows_edges(
        current in prop::option::of(cluster_phase()),
        claims in phase_claims(),
        ready in 0..5usize,
        stable in any::<bool>(),
    ) {
        let sm = ClusterStateMachine::new();
        let ctx = TransitionContext::new(ready, 3, stable);
        let (phase, _) = resolve_phase(&sm, current, "", &claims, &ctx);
        if let Some(current) = current {
            prop_assert!(
                phase == current || sm.can_transition(current, ClusterEvent::for_phase(phase)),
                "{} -> {} is not a listed transition", current, phase
            );
        }
        if phase == ClusterPhase::Healthy && current != Some(ClusterPhase::Healthy) {
            prop_assert!(ctx.all_instances_ready() && stable);
        }
    }

    /// The safety net only ever turns a transitional phase into Healthy
    #[test]
    fn prop_safety_net_only_heals_transitional(
        phase in cluster_phase(),
        ready in 0..4usize,
        desired in 0..4usize,
        job in any::<bool>(),
        promotion in any::<bool>(),
        stable in any::<bool>(),
    ) {
        let forced = safety_net(SafetyNetInput {
            phase: Some(phase),
            ready_instances: ready,
            desired_instances: desired,
            job_in_flight: job,
            promotion_in_flight: promotion,
            topology_stable: stable,
        });
        if let Some((to, _)) = forced {
            prop_assert_eq!(to, ClusterPhase::Healthy);
            prop_assert!(phase.is_transitional());
            prop_assert!(ready == desired && !job && !promotion && stable);
        }
    }
}
