//! Status collection from the per-instance agent
//!
//! Every instance pod runs an agent that exposes what the operator needs to
//! decide roles without opening a database connection:
//!
//! - `GET /pg/status`: recovery state, replay and receive positions, WAL
//!   receiver state, pending restart flag and the agent build
//! - `GET /pg/controldata`: raw `pg_controldata` output, captured at hibernation
//!
//! # Requirements
//!
//! The operator must run inside the cluster with network access to pod IPs.
//! An unreachable agent is never fatal: the caller records "no status" for
//! that instance and the next pass tries again.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Result type for agent calls
pub type Result<T> = std::result::Result<T, InstanceStatusError>;

/// Errors that can occur while talking to an instance agent
#[derive(Debug, thiserror::Error)]
pub enum InstanceStatusError {
    /// JSON parsing error (the agent answered with something unexpected)
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// HTTP request error (transient - network issue)
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    /// Connection error (transient - pod may be starting)
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Request timed out")]
    Timeout,
}

/// A write-ahead log position
///
/// Rendered the way PostgreSQL prints it: two hex halves separated by `/`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Bytes between `self` and an earlier position
    pub fn bytes_after(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl FromStr for Lsn {
    type Err = InstanceStatusError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || InstanceStatusError::InvalidLsn(s.to_string());
        let (high, low) = s.trim().split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Wire shape of `GET /pg/status`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(default)]
    is_primary: bool,
    #[serde(default)]
    is_ready: bool,
    #[serde(default)]
    replay_lsn: Option<String>,
    #[serde(default)]
    received_lsn: Option<String>,
    #[serde(default)]
    is_wal_receiver_active: bool,
    #[serde(default)]
    pending_restart: bool,
    #[serde(default)]
    arch: Option<String>,
    #[serde(default)]
    executable_hash: Option<String>,
    #[serde(default)]
    timeline: Option<u32>,
}

/// What one instance reports about itself
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceStatus {
    pub name: String,
    /// Out of recovery and accepting writes
    pub is_primary: bool,
    pub is_ready: bool,
    pub replay_lsn: Option<Lsn>,
    pub received_lsn: Option<Lsn>,
    pub is_wal_receiver_active: bool,
    pub pending_restart: bool,
    pub arch: Option<String>,
    pub executable_hash: Option<String>,
    pub timeline: Option<u32>,
}

impl InstanceStatus {
    /// Parse an agent status document
    pub fn parse(name: &str, body: &[u8]) -> Result<Self> {
        let wire: StatusResponse = serde_json::from_slice(body)?;
        let parse_lsn = |raw: Option<String>| -> Result<Option<Lsn>> {
            match raw.filter(|s| !s.is_empty()) {
                Some(s) => s.parse().map(Some),
                None => Ok(None),
            }
        };

        Ok(Self {
            name: name.to_string(),
            is_primary: wire.is_primary,
            is_ready: wire.is_ready,
            replay_lsn: parse_lsn(wire.replay_lsn)?,
            received_lsn: parse_lsn(wire.received_lsn)?,
            is_wal_receiver_active: wire.is_wal_receiver_active,
            pending_restart: wire.pending_restart,
            arch: wire.arch.filter(|s| !s.is_empty()),
            executable_hash: wire.executable_hash.filter(|s| !s.is_empty()),
            timeline: wire.timeline,
        })
    }

    /// A replica that has replayed everything it received and stopped streaming
    pub fn is_caught_up(&self) -> bool {
        !self.is_wal_receiver_active
            && match (self.replay_lsn, self.received_lsn) {
                (Some(replay), Some(received)) => replay >= received,
                (Some(_), None) => true,
                _ => false,
            }
    }
}

/// HTTP client for the instance agent
#[derive(Clone, Debug)]
pub struct InstanceStatusClient {
    port: u16,
    timeout: Duration,
}

impl InstanceStatusClient {
    #[must_use]
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    /// Fetch the status of the instance running at `pod_ip`
    pub async fn status(&self, name: &str, pod_ip: &str) -> Result<InstanceStatus> {
        let body = self.get(pod_ip, "/pg/status").await?;
        InstanceStatus::parse(name, &body)
    }

    /// Fetch the raw `pg_controldata` output of the instance at `pod_ip`
    pub async fn controldata(&self, pod_ip: &str) -> Result<String> {
        let body = self.get(pod_ip, "/pg/controldata").await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn get(&self, pod_ip: &str, path: &str) -> Result<Bytes> {
        timeout(self.timeout, self.request(pod_ip, path))
            .await
            .map_err(|_| InstanceStatusError::Timeout)?
    }

    async fn request(&self, pod_ip: &str, path: &str) -> Result<Bytes> {
        let addr: SocketAddr = format!("{}:{}", pod_ip, self.port)
            .parse()
            .map_err(|e| InstanceStatusError::ConnectionError(format!("Invalid address: {}", e)))?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| InstanceStatusError::ConnectionError(e.to_string()))?;

        let io = TokioIo::new(stream);

        let (mut sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| InstanceStatusError::HttpError(e.to_string()))?;

        let req = Request::builder()
            .method("GET")
            .uri(path)
            .header("Host", format!("{}:{}", pod_ip, self.port))
            .body(Empty::<Bytes>::new())
            .map_err(|e| InstanceStatusError::HttpError(e.to_string()))?;

        // The connection future must be driven while the request is in flight
        let response = tokio::select! {
            conn_result = conn => {
                if let Err(e) = conn_result {
                    debug!("Connection closed: {}", e);
                }
                return Err(InstanceStatusError::ConnectionError(
                    "Connection closed unexpectedly".to_string(),
                ));
            }
            response = sender.send_request(req) => {
                response.map_err(|e| InstanceStatusError::HttpError(e.to_string()))?
            }
        };

        if !response.status().is_success() {
            return Err(InstanceStatusError::HttpError(format!(
                "HTTP {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| InstanceStatusError::HttpError(e.to_string()))?
            .to_bytes();

        trace!(
            pod_ip = pod_ip,
            path = path,
            response = %String::from_utf8_lossy(&body),
            "Instance agent response"
        );

        Ok(body)
    }
}
