// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the topology controllers
//!
//! Every sub-controller is a pure function of a cluster object and an observed
//! snapshot, so these tests drive them with fixtures instead of an API server:
//! - Instance set planning and scale-down selection
//! - Bootstrap jobs and snapshot fallback
//! - Failover, switchover and the pending marker
//! - Replication slot synchronization
//! - Hibernation on and off
//! - Rolling updates
//! - Fencing
//! - Phase resolution, safety net and status conditions
//! - Whole passes replayed against a simulated cluster
//! - Resource generators

#[path = "../common/mod.rs"]
mod common;

mod instance_set;
mod slots;
mod state_machine;
mod status;
