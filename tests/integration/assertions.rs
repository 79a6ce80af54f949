//! Resource assertion helpers for integration tests.
//!
//! [`ResourceAssertions`] polls for objects the operator is expected to
//! create and checks that they are owned by the cluster.
//!
//! # Usage
//!
//! ```ignore
//! let assertions = ResourceAssertions::new(client.clone(), namespace);
//!
//! let job: Job = assertions.eventually_exists("pg-1-initdb", timeout).await?;
//! assertions.owned_by(&job, "pg")?;
//! assertions.resource_deleted::<Pod>("pg-2").await?;
//! ```

use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssertionError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Resource still exists: {0}")]
    ResourceStillExists(String),

    #[error("Missing owner reference on {resource}, expected owner: {expected_owner}")]
    MissingOwnerReference {
        resource: String,
        expected_owner: String,
    },
}

/// Helper for asserting on Kubernetes resources in a specific namespace.
pub struct ResourceAssertions {
    client: Client,
    namespace: String,
}

impl ResourceAssertions {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Poll until a namespaced resource exists and return it
    pub async fn eventually_exists<T>(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<T, AssertionError>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), &self.namespace);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match api.get(name).await {
                Ok(resource) => return Ok(resource),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(AssertionError::Timeout(name.to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => return Err(AssertionError::KubeError(e)),
            }
        }
    }

    /// Assert that a namespaced resource does NOT exist (returns 404).
    pub async fn resource_deleted<T>(&self, name: &str) -> Result<(), AssertionError>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(name).await {
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Ok(_) => Err(AssertionError::ResourceStillExists(name.to_string())),
            Err(e) => Err(AssertionError::KubeError(e)),
        }
    }

    /// Verify the object is controlled by the named PostgresCluster
    pub fn owned_by<T: Resource>(&self, resource: &T, owner_name: &str) -> Result<(), AssertionError> {
        let has_ref = resource
            .owner_references()
            .iter()
            .any(|r| r.name == owner_name && r.kind == "PostgresCluster" && r.controller == Some(true));

        if !has_ref {
            return Err(AssertionError::MissingOwnerReference {
                resource: resource.name_any(),
                expected_owner: owner_name.to_string(),
            });
        }
        Ok(())
    }
}
