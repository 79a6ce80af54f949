//! Fast integration tests for postgres-topology-operator
//!
//! These tests focus on operator logic: the objects a cluster gets on its
//! first passes and the status written back. They do NOT wait for instances
//! to become ready, which would need a working instance image and storage.
//!
//! Tests verify:
//! - The first instance gets its claim and an initdb job, nothing more
//! - Services, credentials, configuration and RBAC are created and owned
//! - Status records the generated ordinal, the phase and the generation
//! - Hibernation is refused while the cluster is not healthy

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{DeleteParams, PostParams};
use kube::{Api, ResourceExt};
use postgres_topology_operator::controller::hibernation::{HIBERNATION_CONDITION, reasons};
use postgres_topology_operator::crd::{ClusterPhase, PostgresCluster};
use postgres_topology_operator::resources::common::keys;
use postgres_topology_operator::resources::pvc::PVC_STATUS_INITIALIZING;
use std::time::Duration;

use crate::{
    PostgresClusterBuilder, ResourceAssertions, TestEnv, generation_observed,
    has_condition_reason, has_generated_node, is_phase, wait_for_cluster,
};

/// Short timeout - we're testing operator logic, not pod readiness
const FAST_TIMEOUT: Duration = Duration::from_secs(15);

async fn create_cluster(env: &TestEnv, cluster: &PostgresCluster) -> Api<PostgresCluster> {
    let api: Api<PostgresCluster> = Api::namespaced(env.client.clone(), env.ns());
    api.create(&PostParams::default(), cluster)
        .await
        .expect("create cluster");
    api
}

// =============================================================================
// BOOTSTRAP
// =============================================================================

/// Test: the first pass creates the first instance's claim and initdb job
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_first_instance_starts_with_initdb() {
    let mut env = TestEnv::setup("initdb").await.expect("setup");
    let pg = PostgresClusterBuilder::new("pg", env.ns())
        .with_instances(3)
        .with_wal_storage("1Gi")
        .build();
    let api = create_cluster(&env, &pg).await;
    let assertions = ResourceAssertions::new(env.client.clone(), env.ns());

    let job: Job = assertions
        .eventually_exists("pg-1-initdb", FAST_TIMEOUT)
        .await
        .expect("initdb job");
    assertions.owned_by(&job, "pg").expect("job owner");

    for claim in ["pg-1", "pg-1-wal"] {
        let pvc: PersistentVolumeClaim = assertions
            .eventually_exists(claim, FAST_TIMEOUT)
            .await
            .expect("instance claim");
        assertions.owned_by(&pvc, "pg").expect("claim owner");
        assert_eq!(
            pvc.annotations().get(keys::PVC_STATUS).map(String::as_str),
            Some(PVC_STATUS_INITIALIZING),
            "{claim} should be initializing until initdb succeeds"
        );
    }

    let cluster = wait_for_cluster(&api, "pg", has_generated_node(1), FAST_TIMEOUT)
        .await
        .expect("status written");
    let status = cluster.status.unwrap_or_default();
    assert_eq!(status.latest_generated_node, 1);
    assert_eq!(status.phase, Some(ClusterPhase::SettingUpPrimary));

    env.namespace.cleanup().await.expect("cleanup");
}

/// Test: replicas are not created while the first instance is bootstrapping
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_replicas_wait_for_the_primary() {
    let mut env = TestEnv::setup("wait-primary").await.expect("setup");
    let pg = PostgresClusterBuilder::new("pg", env.ns())
        .with_instances(3)
        .build();
    let api = create_cluster(&env, &pg).await;
    let assertions = ResourceAssertions::new(env.client.clone(), env.ns());

    wait_for_cluster(&api, "pg", is_phase(ClusterPhase::SettingUpPrimary), FAST_TIMEOUT)
        .await
        .expect("setting up primary");

    // A few resync periods
    tokio::time::sleep(Duration::from_secs(6)).await;
    assertions
        .resource_deleted::<PersistentVolumeClaim>("pg-2")
        .await
        .expect("no replica claim yet");
    assertions
        .resource_deleted::<Job>("pg-2-join")
        .await
        .expect("no join job yet");

    env.namespace.cleanup().await.expect("cleanup");
}

// =============================================================================
// ANCILLARY RESOURCES
// =============================================================================

/// Test: services, credentials, configuration and RBAC are created and owned
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_ancillary_resources_are_owned() {
    let mut env = TestEnv::setup("ancillary").await.expect("setup");
    let pg = PostgresClusterBuilder::new("pg", env.ns()).build();
    create_cluster(&env, &pg).await;
    let assertions = ResourceAssertions::new(env.client.clone(), env.ns());

    for name in ["pg-rw", "pg-ro", "pg-r"] {
        let svc: Service = assertions
            .eventually_exists(name, FAST_TIMEOUT)
            .await
            .expect("service");
        assertions.owned_by(&svc, "pg").expect("service owner");
    }

    let secret: Secret = assertions
        .eventually_exists("pg-credentials", FAST_TIMEOUT)
        .await
        .expect("credentials");
    assertions.owned_by(&secret, "pg").expect("secret owner");

    let cm: ConfigMap = assertions
        .eventually_exists("pg-config", FAST_TIMEOUT)
        .await
        .expect("config map");
    assertions.owned_by(&cm, "pg").expect("config map owner");

    let sa: ServiceAccount = assertions
        .eventually_exists("pg", FAST_TIMEOUT)
        .await
        .expect("service account");
    assertions.owned_by(&sa, "pg").expect("service account owner");
    let role: Role = assertions
        .eventually_exists("pg", FAST_TIMEOUT)
        .await
        .expect("role");
    assertions.owned_by(&role, "pg").expect("role owner");
    let binding: RoleBinding = assertions
        .eventually_exists("pg", FAST_TIMEOUT)
        .await
        .expect("role binding");
    assertions.owned_by(&binding, "pg").expect("role binding owner");

    env.namespace.cleanup().await.expect("cleanup");
}

// =============================================================================
// STATUS
// =============================================================================

/// Test: status tracks the generation of the spec it was computed from
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_status_observes_generation() {
    let mut env = TestEnv::setup("generation").await.expect("setup");
    let pg = PostgresClusterBuilder::new("pg", env.ns()).build();
    let api = create_cluster(&env, &pg).await;

    wait_for_cluster(&api, "pg", generation_observed(), FAST_TIMEOUT)
        .await
        .expect("generation observed");

    env.namespace.cleanup().await.expect("cleanup");
}

/// Test: hibernation is refused until the cluster has been healthy
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_hibernation_refused_while_not_healthy() {
    let mut env = TestEnv::setup("hibernate").await.expect("setup");
    let pg = PostgresClusterBuilder::new("pg", env.ns())
        .with_hibernation("on")
        .build();
    let api = create_cluster(&env, &pg).await;

    let cluster = wait_for_cluster(
        &api,
        "pg",
        has_condition_reason(HIBERNATION_CONDITION, reasons::NOT_HEALTHY),
        FAST_TIMEOUT,
    )
    .await
    .expect("not healthy condition");
    assert_ne!(
        cluster.status.and_then(|s| s.phase),
        Some(ClusterPhase::Hibernated)
    );

    api.delete("pg", &DeleteParams::default())
        .await
        .expect("delete cluster");
    env.namespace.cleanup().await.expect("cleanup");
}
