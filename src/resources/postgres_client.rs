//! PostgreSQL client for replication slot management
//!
//! Connects straight to an instance's pod IP with the superuser credentials
//! kept in the cluster's `<cluster>-credentials` Secret. Only the slot
//! primitives the synchronizer needs are exposed.

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_postgres::NoTls;

use crate::controller::instance_status::Lsn;
use crate::resources::secret::{POSTGRES_PASSWORD_KEY, credentials_secret_name};

/// PostgreSQL port inside every instance pod
pub const POSTGRES_PORT: u16 = 5432;

/// Errors that can occur during PostgreSQL operations
#[derive(Error, Debug)]
pub enum PostgresClientError {
    #[error("Connection failed: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Credentials secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret missing required key: {0}")]
    SecretMissingKey(String),

    #[error("Invalid UTF-8 in secret data")]
    InvalidUtf8,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Connection timeout")]
    Timeout,
}

/// Result type for PostgreSQL client operations
pub type PostgresClientResult<T> = Result<T, PostgresClientError>;

/// PostgreSQL connection credentials
#[derive(Debug, Clone)]
pub struct PostgresCredentials {
    pub username: String,
    pub password: String,
    pub database: String,
}

impl PostgresCredentials {
    /// Extract credentials from a cluster credentials Kubernetes Secret
    ///
    /// Expects the secret to contain `POSTGRES_PASSWORD` key.
    /// Uses default username "postgres" and database "postgres".
    pub fn from_cluster_secret(secret: &Secret) -> PostgresClientResult<Self> {
        let data = secret
            .data
            .as_ref()
            .ok_or_else(|| PostgresClientError::SecretMissingKey("no data in secret".into()))?;

        let password_bytes = data
            .get(POSTGRES_PASSWORD_KEY)
            .ok_or_else(|| PostgresClientError::SecretMissingKey(POSTGRES_PASSWORD_KEY.into()))?;

        let password = String::from_utf8(password_bytes.0.clone())
            .map_err(|_| PostgresClientError::InvalidUtf8)?;

        Ok(Self {
            username: "postgres".to_string(),
            password,
            database: "postgres".to_string(),
        })
    }
}

/// Fetch the superuser credentials of a cluster
pub async fn fetch_credentials(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
) -> PostgresClientResult<PostgresCredentials> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret_name = credentials_secret_name(cluster_name);

    let secret = secrets.get(&secret_name).await.map_err(|e| match &e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            PostgresClientError::SecretNotFound(secret_name.clone())
        }
        _ => PostgresClientError::Kube(e),
    })?;

    PostgresCredentials::from_cluster_secret(&secret)
}

/// A physical replication slot as reported by `pg_replication_slots`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub name: String,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
}

/// Direct connection to one instance
pub struct PostgresConnection {
    client: tokio_postgres::Client,
}

impl PostgresConnection {
    /// Connect to the instance listening on `host`
    pub async fn connect(
        host: &str,
        credentials: &PostgresCredentials,
        connect_timeout: Duration,
    ) -> PostgresClientResult<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(POSTGRES_PORT)
            .user(&credentials.username)
            .password(&credentials.password)
            .dbname(&credentials.database)
            .application_name("postgres-topology-operator")
            .connect_timeout(connect_timeout);

        let (client, connection) = timeout(connect_timeout, config.connect(NoTls))
            .await
            .map_err(|_| PostgresClientError::Timeout)??;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::trace!(error = %e, "PostgreSQL connection closed");
            }
        });

        tracing::debug!(host = host, "PostgreSQL connection established");

        Ok(Self { client })
    }

    /// Physical slots whose name starts with `prefix`
    pub async fn list_slots(&self, prefix: &str) -> PostgresClientResult<Vec<SlotInfo>> {
        let rows = self
            .client
            .query(
                "SELECT slot_name, active, restart_lsn::text \
                 FROM pg_catalog.pg_replication_slots \
                 WHERE slot_type = 'physical' AND starts_with(slot_name, $1)",
                &[&prefix],
            )
            .await
            .map_err(|e| PostgresClientError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let restart_lsn: Option<String> = row.get(2);
                Ok(SlotInfo {
                    name: row.get(0),
                    active: row.get(1),
                    restart_lsn: restart_lsn
                        .map(|raw| raw.parse::<Lsn>())
                        .transpose()
                        .map_err(|e| PostgresClientError::Query(e.to_string()))?,
                })
            })
            .collect()
    }

    /// Create a physical slot that reserves WAL immediately
    pub async fn create_slot(&self, name: &str) -> PostgresClientResult<()> {
        self.client
            .execute(
                "SELECT pg_catalog.pg_create_physical_replication_slot($1, true)",
                &[&name],
            )
            .await
            .map_err(|e| PostgresClientError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn drop_slot(&self, name: &str) -> PostgresClientResult<()> {
        self.client
            .execute("SELECT pg_catalog.pg_drop_replication_slot($1)", &[&name])
            .await
            .map_err(|e| PostgresClientError::Query(e.to_string()))?;
        Ok(())
    }

    /// Move a slot's restart position forward
    pub async fn advance_slot(&self, name: &str, lsn: Lsn) -> PostgresClientResult<()> {
        let target = lsn.to_string();
        self.client
            .execute(
                "SELECT pg_catalog.pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&name, &target],
            )
            .await
            .map_err(|e| PostgresClientError::Query(e.to_string()))?;
        Ok(())
    }
}
