//! Replication slot synchronizer
//!
//! The primary keeps one physical slot per replica so that WAL a replica has
//! not replayed yet survives. Replicas keep a copy of the primary's slots
//! (minus their own) advanced to the primary's positions, so whichever of
//! them is promoted already retains WAL for its siblings.

use std::collections::{BTreeMap, BTreeSet};

use crate::controller::instance_set::InstanceSetPlan;
use crate::controller::instance_status::Lsn;
use crate::controller::observed::{ObservedCluster, PvcStatus};
use crate::controller::operations::Operation;
use crate::crd::PostgresCluster;
use crate::resources::postgres_client::SlotInfo;

/// What to do with one slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotAction {
    Create,
    Drop,
    /// Move `restart_lsn` forward to the given position
    Advance(Lsn),
}

/// A slot change on one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotOperation {
    pub instance: String,
    /// Pod IP the change is sent to
    pub host: String,
    pub slot: String,
    pub action: SlotAction,
}

/// Slot name for an instance, restricted to what PostgreSQL accepts
pub fn slot_name(prefix: &str, instance: &str) -> String {
    format!("{}{}", prefix, instance)
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

/// Outcome of one synchronization pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotPlan {
    pub operations: Vec<Operation>,
    /// Replicas whose slot is present on the primary.
    /// `None` when the primary's slots could not be read; the previous list stays.
    pub ha_slot_instances: Option<Vec<String>>,
}

/// Replicas that should have a slot on the primary
pub fn desired_slot_instances(
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    primary: &str,
) -> Vec<String> {
    plan.existing
        .iter()
        .filter(|name| name.as_str() != primary && !plan.is_removed(name))
        .filter(|name| {
            observed
                .data_pvc(name)
                .is_some_and(|pvc| pvc.status == PvcStatus::Ready)
        })
        .cloned()
        .collect()
}

fn slot_op(observed: &ObservedCluster, instance: &str, slot: &str, action: SlotAction) -> Option<Operation> {
    let host = observed.pod(instance)?.ip.clone()?;
    Some(Operation::Slot(SlotOperation {
        instance: instance.to_string(),
        host,
        slot: slot.to_string(),
        action,
    }))
}

/// Converge the slot sets on the primary and on every replica
///
/// `primary` is the instance currently confirmed as primary, if any.
pub fn sync_slots(
    cluster: &PostgresCluster,
    observed: &ObservedCluster,
    plan: &InstanceSetPlan,
    primary: Option<&str>,
) -> SlotPlan {
    let mut result = SlotPlan::default();
    let prefix = cluster.ha_slot_prefix();

    if !cluster.ha_slots_enabled() {
        // Leftovers from when slots were enabled; active ones are dropped on a later pass
        for (instance, slots) in &observed.slots {
            for slot in slots.iter().filter(|s| !s.active) {
                result
                    .operations
                    .extend(slot_op(observed, instance, &slot.name, SlotAction::Drop));
            }
        }
        result.ha_slot_instances = Some(Vec::new());
        return result;
    }

    let Some(primary) = primary else {
        return result;
    };
    let Some(primary_slots) = observed.slots.get(primary) else {
        return result;
    };

    let desired: BTreeMap<String, String> = desired_slot_instances(observed, plan, primary)
        .into_iter()
        .map(|instance| (slot_name(prefix, &instance), instance))
        .collect();
    let present: BTreeMap<&str, &SlotInfo> =
        primary_slots.iter().map(|s| (s.name.as_str(), s)).collect();

    for slot in desired.keys() {
        if !present.contains_key(slot.as_str()) {
            result
                .operations
                .extend(slot_op(observed, primary, slot, SlotAction::Create));
        }
    }
    for slot in primary_slots {
        if !desired.contains_key(&slot.name) && !slot.active {
            result
                .operations
                .extend(slot_op(observed, primary, &slot.name, SlotAction::Drop));
        }
    }

    result.ha_slot_instances = Some(
        desired
            .iter()
            .filter(|(slot, _)| present.contains_key(slot.as_str()))
            .map(|(_, instance)| instance.clone())
            .collect(),
    );

    // Mirror onto replicas, skipping each replica's own slot
    for (replica, replica_slots) in &observed.slots {
        if replica == primary || plan.is_removed(replica) {
            continue;
        }
        let own = slot_name(prefix, replica);
        let mirrored: BTreeSet<&str> = primary_slots
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| *name != own && desired.contains_key(*name))
            .collect();
        let local: BTreeMap<&str, &SlotInfo> =
            replica_slots.iter().map(|s| (s.name.as_str(), s)).collect();

        for name in &mirrored {
            let source = present.get(name).and_then(|s| s.restart_lsn);
            match local.get(name) {
                None => result
                    .operations
                    .extend(slot_op(observed, replica, name, SlotAction::Create)),
                Some(slot) => {
                    if let Some(target) = source {
                        if slot.restart_lsn.is_none_or(|lsn| lsn < target) {
                            result.operations.extend(slot_op(
                                observed,
                                replica,
                                name,
                                SlotAction::Advance(target),
                            ));
                        }
                    }
                }
            }
        }
        for slot in replica_slots {
            if !mirrored.contains(slot.name.as_str()) && !slot.active {
                result
                    .operations
                    .extend(slot_op(observed, replica, &slot.name, SlotAction::Drop));
            }
        }
    }

    result
}
