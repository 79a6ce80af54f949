//! Status and conditions management for PostgresCluster resources
//!
//! Status is written once per pass as a merge patch carrying the
//! `resourceVersion` the pass started from, so a concurrent writer turns the
//! write into a conflict instead of being overwritten.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::{Map, Value, json};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::hibernation::{HIBERNATION_CONDITION, HibernationCondition};
use crate::crd::{Condition, PostgresCluster, PostgresClusterStatus};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Every instance is ready and the topology is stable
    pub const READY: &str = "Ready";
    /// A primary change, bootstrap or restart is in flight
    pub const PROGRESSING: &str = "Progressing";
    pub use crate::controller::hibernation::HIBERNATION_CONDITION as HIBERNATION;
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            // The transition time only moves when the status flips
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn remove_condition(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    /// Set the Progressing condition
    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    /// Apply a hibernation controller decision
    pub fn hibernation(self, change: Option<&HibernationCondition>) -> Self {
        match change {
            None => self,
            Some(HibernationCondition::Clear) => self.remove_condition(HIBERNATION_CONDITION),
            Some(HibernationCondition::Set {
                hibernated,
                reason,
                message,
            }) => self.set_condition(HIBERNATION_CONDITION, bool_status(*hibernated), reason, message),
        }
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// JSON merge patch turning `old` into `new`
///
/// Keys present in `old` but missing from `new` are set to `null`, which is
/// how a merge patch removes them.
pub fn merge_patch_for(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) if previous == value => {}
                    Some(previous) => {
                        patch.insert(key.clone(), merge_patch_for(previous, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Status manager for PostgresCluster resources
pub struct StatusManager<'a> {
    cluster: &'a PostgresCluster,
    ctx: &'a Context,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    pub fn new(cluster: &'a PostgresCluster, ctx: &'a Context, ns: &'a str) -> Self {
        Self { cluster, ctx, ns }
    }

    /// Write `status` if it differs from what the pass read
    ///
    /// Returns `Error::ConflictError` when the object changed in the meantime.
    pub async fn update(&self, status: &PostgresClusterStatus) -> Result<bool> {
        let old = serde_json::to_value(self.cluster.status.clone().unwrap_or_default())?;
        let new = serde_json::to_value(status)?;
        if old == new {
            return Ok(false);
        }

        let api: Api<PostgresCluster> = Api::namespaced(self.ctx.client.clone(), self.ns);
        let name = self.cluster.name_any();
        let patch = json!({
            "metadata": { "resourceVersion": self.cluster.resource_version() },
            "status": merge_patch_for(&old, &new),
        });

        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::ConflictError(format!(
                "{} changed while it was being reconciled",
                name
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
