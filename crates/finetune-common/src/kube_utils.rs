//! Metadata helpers shared by the reconciler and its tests
//!
//! Finalizer bookkeeping, controller ownership checks, standard labels and
//! storage quantity handling. Everything here is pure and works on
//! `ObjectMeta` so it applies to any resource kind.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

use crate::crd::TrainingJob;
use crate::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_FINETUNE, LABEL_NAME};

// =============================================================================
// Finalizers
// =============================================================================

/// True when `finalizer` is present on the object
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Finalizer list with `finalizer` appended, or `None` if already present
pub fn finalizers_with(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if has_finalizer(meta, finalizer) {
        return None;
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with `finalizer` removed, or `None` if it was not present
pub fn finalizers_without(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if !has_finalizer(meta, finalizer) {
        return None;
    }
    Some(
        meta.finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect(),
    )
}

// =============================================================================
// Ownership
// =============================================================================

/// How a dependent object relates to the TrainingJob reconciling it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Controlled by the TrainingJob with the given UID
    Owned,
    /// No controller reference at all; safe to adopt
    Unowned,
    /// Controlled by some other object (UID attached)
    Foreign(String),
}

/// UID of the object's controller, if it has one
pub fn controller_uid(meta: &ObjectMeta) -> Option<&str> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.as_str())
}

/// Classify `meta` against the expected owner UID
pub fn ownership_of(meta: &ObjectMeta, owner_uid: &str) -> Ownership {
    match controller_uid(meta) {
        Some(uid) if uid == owner_uid => Ownership::Owned,
        Some(uid) => Ownership::Foreign(uid.to_string()),
        None => Ownership::Unowned,
    }
}

/// Controller owner reference pointing at `job`.
///
/// Fails when the TrainingJob has not been persisted yet (no UID).
pub fn owner_reference(job: &TrainingJob) -> Result<OwnerReference, Error> {
    job.controller_owner_ref(&()).ok_or_else(|| {
        Error::ownership(
            "TrainingJob",
            job.meta().name.clone().unwrap_or_default(),
            "TrainingJob has no UID, cannot reference it as owner",
        )
    })
}

/// Labels stamped on every resource the operator creates for `job_name`
pub fn standard_labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), job_name.to_string()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_FINETUNE.to_string(),
        ),
    ])
}

// =============================================================================
// Storage quantities
// =============================================================================

/// Storage request for a size given in GiB
pub fn storage_quantity(size_gb: i32) -> Quantity {
    Quantity(format!("{}Gi", size_gb))
}

/// Parse a storage quantity into bytes.
///
/// Understands plain integers plus binary (`Ki`..`Ei`) and decimal
/// (`k`..`E`) suffixes. Fractional or otherwise unusual values return `None`.
pub fn parse_storage_bytes(quantity: &Quantity) -> Option<u128> {
    const SUFFIXES: &[(&str, u128)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];

    let raw = quantity.0.trim();
    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| raw.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((raw, 1));

    digits
        .parse::<u128>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
}
