//! Instance set planning: ordinals, scale-down selection and volume repair

use kube::ResourceExt;
use postgres_topology_operator::controller::bootstrap::JobRole;
use postgres_topology_operator::controller::instance_set::{
    missing_volume_operations, plan, removal_operations,
};
use postgres_topology_operator::controller::observed::JobOutcome;
use postgres_topology_operator::controller::operations::Operation;
use postgres_topology_operator::resources::common::{PvcRole, keys};

use crate::common::*;

#[test]
fn test_empty_cluster_needs_every_instance() {
    let cluster = create_test_cluster("pg", "default", 3);
    let observed = ObservedBuilder::new("pg").build();

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.desired, 3);
    assert!(plan.existing.is_empty());
    assert_eq!(plan.missing, 3);
    assert_eq!(plan.next_ordinal, 1);
    assert!(plan.to_remove.is_empty());
}

#[test]
fn test_ordinals_are_never_reused() {
    let cluster = PostgresClusterBuilder::new("pg", "default")
        .with_instances(3)
        .with_primary("pg-1")
        .with_latest_generated_node(5)
        .build();
    let observed = ObservedBuilder::new("pg").primary(1, 100).build();

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.next_ordinal, 6);
    assert_eq!(plan.missing, 2);
}

#[test]
fn test_ordinal_above_observed_objects() {
    // A claim created after the status write was lost still counts
    let cluster = PostgresClusterBuilder::new("pg", "default")
        .with_instances(3)
        .with_primary("pg-1")
        .with_latest_generated_node(1)
        .build();
    let observed = ObservedBuilder::new("pg")
        .primary(1, 100)
        .initializing_pvc(4, None)
        .build();

    assert_eq!(plan(&cluster, &observed).next_ordinal, 5);
}

#[test]
fn test_scale_down_prefers_instances_without_pod() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 300)
        .replica(2, 300)
        .replica(3, 300)
        .lost_pod(2)
        .build();

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.to_remove, vec!["pg-2".to_string()]);
}

#[test]
fn test_scale_down_removes_highest_non_primary() {
    let cluster = create_healthy_cluster("pg", 1, "pg-3");
    let observed = ObservedBuilder::new("pg")
        .replica(1, 300)
        .replica(2, 300)
        .primary(3, 300)
        .build();

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.to_remove, vec!["pg-2".to_string(), "pg-1".to_string()]);
    assert!(plan.is_removed("pg-1"));
    assert!(!plan.is_removed("pg-3"));
}

#[test]
fn test_scale_down_never_picks_target_primary() {
    let cluster = PostgresClusterBuilder::new("pg", "default")
        .with_instances(2)
        .with_primary("pg-1")
        .with_target_primary("pg-3")
        .build();
    let observed = ObservedBuilder::new("pg")
        .primary(1, 300)
        .replica(2, 300)
        .replica(3, 300)
        .build();

    assert_eq!(plan(&cluster, &observed).to_remove, vec!["pg-2".to_string()]);
}

#[test]
fn test_dangling_claims_are_reattached() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 300)
        .replica(2, 300)
        .lost_pod(2)
        .build();

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.reattach, vec!["pg-2".to_string()]);
    assert_eq!(plan.dangling_pvc, vec!["pg-2".to_string()]);
    assert_eq!(plan.healthy_pvc, vec!["pg-1".to_string()]);
    assert_eq!(plan.existing.len(), 2);
    assert_eq!(plan.missing, 0);
}

#[test]
fn test_initializing_claims_are_not_reattached() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let observed = ObservedBuilder::new("pg")
        .primary(1, 300)
        .initializing_pvc(2, None)
        .build();

    let plan = plan(&cluster, &observed);
    assert!(plan.reattach.is_empty());
    assert_eq!(plan.initializing_pvc, vec!["pg-2".to_string()]);
}

#[test]
fn test_pod_without_data_is_broken() {
    let cluster = create_healthy_cluster("pg", 2, "pg-1");
    let mut observed = ObservedBuilder::new("pg").primary(1, 300).replica(2, 300).build();
    observed.pvcs.retain(|p| p.instance != "pg-2");

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.broken_pods, vec!["pg-2".to_string()]);
    assert!(!plan.existing.contains(&"pg-2".to_string()));
}

#[test]
fn test_missing_wal_volume_is_recreated_ready() {
    let cluster = PostgresClusterBuilder::new("pg", "default")
        .with_instances(1)
        .with_wal_storage("2Gi")
        .with_primary("pg-1")
        .build();
    let observed = ObservedBuilder::new("pg").primary(1, 300).build();

    let plan = plan(&cluster, &observed);
    assert_eq!(plan.missing_volumes, vec![("pg-1".to_string(), PvcRole::Wal)]);

    let ops = missing_volume_operations(&cluster, &plan);
    assert_eq!(ops.len(), 1);
    let Operation::CreatePvc(pvc) = &ops[0] else {
        panic!("expected a claim, got {:?}", ops[0]);
    };
    assert_eq!(pvc.name_any(), "pg-1-wal");
    assert_eq!(
        pvc.annotations().get(keys::PVC_STATUS).map(String::as_str),
        Some("ready")
    );
}

#[test]
fn test_present_volumes_are_not_recreated() {
    let cluster = PostgresClusterBuilder::new("pg", "default")
        .with_instances(1)
        .with_wal_storage("2Gi")
        .with_primary("pg-1")
        .build();
    let observed = ObservedBuilder::new("pg")
        .primary(1, 300)
        .extra_pvc(1, PvcRole::Wal)
        .build();

    assert!(plan(&cluster, &observed).missing_volumes.is_empty());
}

#[test]
fn test_removal_deletes_everything_the_instance_owns() {
    let observed = ObservedBuilder::new("pg")
        .primary(1, 300)
        .replica(2, 300)
        .extra_pvc(2, PvcRole::Wal)
        .job(2, JobRole::Join, JobOutcome::Succeeded, 0)
        .build();

    let ops = removal_operations(&observed, "pg-2");
    assert_eq!(
        ops,
        vec![
            Operation::DeletePod { name: "pg-2".into() },
            Operation::DeleteJob {
                name: "pg-2-join".into()
            },
            Operation::DeletePvc { name: "pg-2".into() },
            Operation::DeletePvc {
                name: "pg-2-wal".into()
            },
        ]
    );
}
