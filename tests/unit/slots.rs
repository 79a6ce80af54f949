//! Replication slot synchronization between primary and replicas

use postgres_topology_operator::controller::instance_set::plan;
use postgres_topology_operator::controller::instance_status::Lsn;
use postgres_topology_operator::controller::observed::ObservedCluster;
use postgres_topology_operator::controller::operations::Operation;
use postgres_topology_operator::controller::slots::{
    SlotAction, SlotOperation, SlotPlan, desired_slot_instances, sync_slots,
};
use postgres_topology_operator::crd::PostgresCluster;

use crate::common::*;

fn sync(cluster: &PostgresCluster, observed: &ObservedCluster, primary: Option<&str>) -> SlotPlan {
    let plan = plan(cluster, observed);
    sync_slots(cluster, observed, &plan, primary)
}

fn slot_ops(result: &SlotPlan) -> Vec<(String, String, SlotAction)> {
    result
        .operations
        .iter()
        .filter_map(|op| match op {
            Operation::Slot(SlotOperation {
                instance,
                slot,
                action,
                ..
            }) => Some((instance.clone(), slot.clone(), *action)),
            _ => None,
        })
        .collect()
}

fn op(instance: &str, slot: &str, action: SlotAction) -> (String, String, SlotAction) {
    (instance.to_string(), slot.to_string(), action)
}

#[test]
fn test_primary_gets_one_slot_per_replica() {
    let cluster = create_healthy_cluster("pg", 3, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .replica(3, 500)
        .no_slots(1)
        .no_slots(2)
        .no_slots(3)
        .build();

    let result = sync(&cluster, &observed, Some("pg-1"));
    assert_eq!(
        slot_ops(&result),
        vec![
            op("pg-1", "_pto_pg_2", SlotAction::Create),
            op("pg-1", "_pto_pg_3", SlotAction::Create),
        ]
    );
    // Not confirmed present yet
    assert_eq!(result.ha_slot_instances, Some(vec![]));
}

#[test]
fn test_slot_operations_target_pod_ip() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .no_slots(1)
        .build();

    let result = sync(&cluster, &observed, Some("pg-1"));
    let Some(Operation::Slot(slot)) = result.operations.first() else {
        panic!("expected a slot operation");
    };
    assert_eq!(slot.host, "10.0.0.1");
}

#[test]
fn test_present_slots_are_reported() {
    let cluster = create_healthy_cluster("pg", 3, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .replica(3, 500)
        .slot(1, "_pto_pg_2", true, Some(500))
        .no_slots(2)
        .no_slots(3)
        .build();

    let result = sync(&cluster, &observed, Some("pg-1"));
    assert_eq!(result.ha_slot_instances, Some(vec!["pg-2".to_string()]));
}

#[test]
fn test_stale_inactive_slot_is_dropped_on_primary() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .slot(1, "_pto_pg_2", true, Some(500))
        .slot(1, "_pto_pg_7", false, Some(100))
        .slot(1, "_pto_pg_8", true, Some(100))
        .slot(2, "_pto_pg_7", false, Some(100))
        .build();

    let result = sync(&cluster, &observed, Some("pg-1"));
    assert_eq!(
        slot_ops(&result),
        vec![
            op("pg-1", "_pto_pg_7", SlotAction::Drop),
            op("pg-2", "_pto_pg_7", SlotAction::Drop),
        ]
    );
}

#[test]
fn test_replicas_mirror_siblings_and_skip_their_own() {
    let cluster = create_healthy_cluster("pg", 3, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 900)
        .replica(2, 900)
        .replica(3, 900)
        .slot(1, "_pto_pg_2", true, Some(800))
        .slot(1, "_pto_pg_3", true, Some(700))
        .no_slots(2)
        .slot(3, "_pto_pg_2", false, Some(600))
        .build();

    let result = sync(&cluster, &observed, Some("pg-1"));
    assert_eq!(
        slot_ops(&result),
        vec![
            op("pg-2", "_pto_pg_3", SlotAction::Create),
            op("pg-3", "_pto_pg_2", SlotAction::Advance(Lsn(800))),
        ]
    );
    assert_eq!(
        result.ha_slot_instances,
        Some(vec!["pg-2".to_string(), "pg-3".to_string()])
    );
}

#[test]
fn test_replica_slot_ahead_of_primary_is_left_alone() {
    let cluster = create_healthy_cluster("pg", 3, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 900)
        .replica(2, 900)
        .replica(3, 900)
        .slot(1, "_pto_pg_2", true, Some(800))
        .slot(1, "_pto_pg_3", true, Some(800))
        .slot(2, "_pto_pg_3", false, Some(800))
        .slot(3, "_pto_pg_2", false, Some(850))
        .build();

    assert!(sync(&cluster, &observed, Some("pg-1")).operations.is_empty());
}

#[test]
fn test_unknown_primary_changes_nothing() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .no_slots(2)
        .build();

    // Slots of pg-1 were not readable
    let result = sync(&cluster, &observed, Some("pg-1"));
    assert!(result.operations.is_empty());
    assert_eq!(result.ha_slot_instances, None);

    let result = sync(&cluster, &observed, None);
    assert!(result.operations.is_empty());
    assert_eq!(result.ha_slot_instances, None);
}

#[test]
fn test_disabled_slots_are_cleaned_up() {
    let cluster = PostgresClusterBuilder::new("pg", "default")
        .with_instances(2)
        .with_primary("pg-1")
        .with_ha_slots(false)
        .with_ha_slot_instances(&["pg-2"])
        .build();
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .slot(1, "_pto_pg_2", true, Some(500))
        .slot(2, "_pto_pg_3", false, Some(500))
        .build();

    let result = sync(&cluster, &observed, Some("pg-1"));
    assert_eq!(
        slot_ops(&result),
        vec![op("pg-2", "_pto_pg_3", SlotAction::Drop)]
    );
    assert_eq!(result.ha_slot_instances, Some(vec![]));
}

#[test]
fn test_unbootstrapped_instances_get_no_slot() {
    let cluster = create_healthy_cluster("pg", 4, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .replica(3, 500)
        .initializing_pvc(4, None)
        .build();

    let plan = plan(&cluster, &observed);
    assert_eq!(
        desired_slot_instances(&observed, &plan, "pg-1"),
        vec!["pg-2".to_string(), "pg-3".to_string()]
    );
}

#[test]
fn test_scale_down_victims_get_no_slot() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 500)
        .replica(2, 500)
        .replica(3, 500)
        .build();

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.to_remove, vec!["pg-3".to_string()]);
    assert_eq!(
        desired_slot_instances(&observed, &plan, "pg-1"),
        vec!["pg-2".to_string()]
    );
}
