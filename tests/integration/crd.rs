//! CRD installation helpers for integration tests

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt};
use postgres_topology_operator::crd::PostgresCluster;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrdError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CRD establishment timeout")]
    EstablishmentTimeout,

    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),
}

/// Install the PostgresCluster CRD generated from the Rust types
pub async fn install_crd(client: Client) -> Result<(), CrdError> {
    let crd: CustomResourceDefinition = PostgresCluster::crd();
    let name = PostgresCluster::crd_name();

    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply("integration-test").force();

    tracing::info!("Installing PostgresCluster CRD...");
    crds.patch(name, &params, &Patch::Apply(&crd)).await?;

    tracing::info!("Waiting for CRD to be established...");
    let establish = await_condition(crds, name, conditions::is_crd_established());

    tokio::time::timeout(Duration::from_secs(30), establish)
        .await
        .map_err(|_| CrdError::EstablishmentTimeout)??;

    tracing::info!("CRD installed and established");

    Ok(())
}
