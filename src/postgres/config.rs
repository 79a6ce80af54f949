//! PostgreSQL configuration utilities
//!
//! Renders the user's `postgresqlParams` on top of the settings the topology
//! depends on, and classifies which parameters need a restart to apply.

use std::collections::BTreeMap;

/// Default PostgreSQL configuration parameters
pub const DEFAULT_MAX_CONNECTIONS: i32 = 100;
pub const DEFAULT_SHARED_BUFFERS: &str = "128MB";
pub const DEFAULT_WAL_LEVEL: &str = "replica";
pub const DEFAULT_MAX_WAL_SENDERS: i32 = 10;
pub const DEFAULT_MAX_REPLICATION_SLOTS: i32 = 10;
pub const DEFAULT_WAL_KEEP_SIZE: &str = "1GB";

/// Parameters that only take effect after a postmaster restart
pub const RESTART_REQUIRED_PARAMS: &[&str] = &[
    "archive_mode",
    "hot_standby",
    "huge_pages",
    "max_connections",
    "max_locks_per_transaction",
    "max_prepared_transactions",
    "max_replication_slots",
    "max_wal_senders",
    "max_worker_processes",
    "port",
    "shared_buffers",
    "shared_preload_libraries",
    "track_commit_timestamp",
    "wal_level",
    "wal_log_hints",
];

/// Parameters owned by the operator; user values for these are ignored
pub const FIXED_PARAMS: &[&str] = &["hot_standby", "port", "wal_level", "wal_log_hints"];

/// Whether changing `name` requires restarting the instance
pub fn requires_restart(name: &str) -> bool {
    RESTART_REQUIRED_PARAMS.contains(&name)
}

/// Effective parameter set: operator defaults overlaid with user values
pub fn effective_params(user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::from([
        ("hot_standby".to_string(), "on".to_string()),
        ("port".to_string(), "5432".to_string()),
        ("wal_level".to_string(), DEFAULT_WAL_LEVEL.to_string()),
        ("wal_log_hints".to_string(), "on".to_string()),
        (
            "max_connections".to_string(),
            DEFAULT_MAX_CONNECTIONS.to_string(),
        ),
        (
            "shared_buffers".to_string(),
            DEFAULT_SHARED_BUFFERS.to_string(),
        ),
        (
            "max_wal_senders".to_string(),
            DEFAULT_MAX_WAL_SENDERS.to_string(),
        ),
        (
            "max_replication_slots".to_string(),
            DEFAULT_MAX_REPLICATION_SLOTS.to_string(),
        ),
        ("wal_keep_size".to_string(), DEFAULT_WAL_KEEP_SIZE.to_string()),
    ]);

    for (name, value) in user {
        if FIXED_PARAMS.contains(&name.as_str()) {
            continue;
        }
        params.insert(name.clone(), value.clone());
    }
    params
}

/// The subset of the effective parameters that needs a restart
pub fn restart_params(user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    effective_params(user)
        .into_iter()
        .filter(|(name, _)| requires_restart(name))
        .collect()
}

/// Render parameters as a `postgresql.conf` fragment
pub fn render_conf(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{} = '{}'\n", name, value.replace('\'', "''")))
        .collect()
}
