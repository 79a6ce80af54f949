//! Status shape, conditions and the merge patch written back each pass

use postgres_topology_operator::controller::hibernation::HibernationCondition;
use postgres_topology_operator::controller::status::{
    ConditionBuilder, condition_status, condition_types, merge_patch_for,
};
use postgres_topology_operator::crd::{ClusterPhase, PostgresClusterStatus};
use serde_json::json;

use crate::common::*;

fn status_of(builder: PostgresClusterBuilder) -> PostgresClusterStatus {
    builder.build().status.unwrap_or_default()
}

#[test]
fn test_status_uses_camel_case_fields() {
    let status = status_of(
        PostgresClusterBuilder::new("pg", "default")
            .with_primary("pg-1")
            .with_phase(ClusterPhase::Healthy)
            .with_ha_slot_instances(&["pg-2"])
            .with_latest_generated_node(2),
    );
    let value = serde_json::to_value(&status).unwrap();

    assert_eq!(value["currentPrimary"], "pg-1");
    assert_eq!(value["targetPrimary"], "pg-1");
    assert_eq!(value["phase"], "Healthy");
    assert_eq!(value["latestGeneratedNode"], 2);
    assert_eq!(value["haSlotInstances"], json!(["pg-2"]));
    assert!(value.get("currentPrimaryFailingSinceTimestamp").is_none());
}

#[test]
fn test_patch_carries_only_the_primary_change() {
    let before = status_of(
        PostgresClusterBuilder::new("pg", "default")
            .with_primary("pg-1")
            .with_phase(ClusterPhase::Healthy),
    );
    let mut after = before.clone();
    after.target_primary = "pending".to_string();
    after.phase = Some(ClusterPhase::FailingOver);

    let patch = merge_patch_for(
        &serde_json::to_value(&before).unwrap(),
        &serde_json::to_value(&after).unwrap(),
    );
    assert_eq!(
        patch,
        json!({"targetPrimary": "pending", "phase": "FailingOver"})
    );
}

#[test]
fn test_cleared_failing_since_is_nulled() {
    let before = status_of(
        PostgresClusterBuilder::new("pg", "default")
            .with_primary("pg-1")
            .with_failing_since("2026-01-01T00:00:00+00:00"),
    );
    let mut after = before.clone();
    after.current_primary_failing_since_timestamp = None;

    let patch = merge_patch_for(
        &serde_json::to_value(&before).unwrap(),
        &serde_json::to_value(&after).unwrap(),
    );
    assert_eq!(patch, json!({"currentPrimaryFailingSinceTimestamp": null}));
}

#[test]
fn test_conditions_are_kept_per_type() {
    let conditions = ConditionBuilder::from_existing(vec![], Some(3))
        .ready(true, "AllInstancesReady", "3 of 3 instances ready")
        .progressing(false, "Converged", "")
        .hibernation(None)
        .build();

    assert_eq!(conditions.len(), 2);
    let ready = conditions
        .iter()
        .find(|c| c.type_ == condition_types::READY)
        .unwrap();
    assert_eq!(ready.status, condition_status::TRUE);
    assert_eq!(ready.observed_generation, Some(3));

    let conditions = ConditionBuilder::from_existing(conditions, Some(4))
        .ready(false, "InstancesNotReady", "2 of 3 instances ready")
        .hibernation(Some(&HibernationCondition::Set {
            hibernated: false,
            reason: "Rehydrating",
            message: "Resuming from claims of pg-1".to_string(),
        }))
        .build();
    assert_eq!(conditions.len(), 3);
    let ready = conditions
        .iter()
        .find(|c| c.type_ == condition_types::READY)
        .unwrap();
    assert_eq!(ready.status, condition_status::FALSE);
    assert_eq!(ready.reason, "InstancesNotReady");
    assert!(
        conditions
            .iter()
            .any(|c| c.type_ == condition_types::HIBERNATION && c.reason == "Rehydrating")
    );
}

#[test]
fn test_status_round_trips_through_the_api_shape() {
    let raw = json!({
        "phase": "SwitchingOver",
        "currentPrimary": "pg-1",
        "targetPrimary": "pg-2",
        "readyInstances": 2,
        "instances": 3,
        "excludedSnapshots": ["snap-a"],
    });
    let status: PostgresClusterStatus = serde_json::from_value(raw).unwrap();
    assert_eq!(status.phase, Some(ClusterPhase::SwitchingOver));
    assert_eq!(status.target_primary, "pg-2");
    assert_eq!(status.ready_instances, 2);
    assert_eq!(status.excluded_snapshots, vec!["snap-a"]);
    assert!(status.conditions.is_empty());
}
