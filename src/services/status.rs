//! Equipment status state machine

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::{
    error::{AppError, AppResult},
    models::enums::EquipmentStatus,
};

/// Free-text synonyms seen in external input, keyed by their normalized form
static STATUS_SYNONYMS: Lazy<HashMap<&'static str, EquipmentStatus>> = Lazy::new(|| {
    use EquipmentStatus::*;
    HashMap::from([
        ("available", Available),
        ("in-stock", Available),
        ("in-storage", Available),
        ("ready", Available),
        ("returned", Available),
        ("deployed", Deployed),
        ("in-use", Deployed),
        ("allocated", Deployed),
        ("on-job", Deployed),
        ("assigned", Deployed),
        ("maintenance", Maintenance),
        ("repair", Maintenance),
        ("in-repair", Maintenance),
        ("servicing", Maintenance),
        ("red-tagged", RedTagged),
        ("redtagged", RedTagged),
        ("red-tag", RedTagged),
        ("damaged", RedTagged),
        ("failed", RedTagged),
        ("retired", Retired),
        ("decommissioned", Retired),
        ("disposed", Retired),
    ])
});

/// Map free text (`"In Use"`, `"repair"`, `"red_tagged"`...) to a status
pub fn normalize_status(input: &str) -> Option<EquipmentStatus> {
    let key = input
        .trim()
        .to_lowercase()
        .replace(['_', ' '], "-");
    STATUS_SYNONYMS.get(key.as_str()).copied()
}

/// Check a requested transition and return the status to apply.
///
/// Same-status requests are accepted as no-ops except for `deployed`
/// (re-deploying is decided by the allocation engine, which knows the job)
/// and `retired` (terminal).
pub fn validate_transition(
    current: EquipmentStatus,
    requested: EquipmentStatus,
) -> AppResult<EquipmentStatus> {
    use EquipmentStatus::*;

    let allowed = match (current, requested) {
        (Retired, _) => false,
        (Deployed, Deployed) => false,
        (from, to) if from == to => true,
        (Available, _) => true,
        (Deployed, Available | Maintenance | RedTagged | Retired) => true,
        (Maintenance | RedTagged, Available | Retired) => true,
        _ => false,
    };

    if allowed {
        Ok(requested)
    } else {
        Err(AppError::InvalidTransition {
            from: current,
            to: requested,
        })
    }
}

/// Normalize free text, then validate the transition
pub fn validate_requested(current: EquipmentStatus, requested: &str) -> AppResult<EquipmentStatus> {
    let target = normalize_status(requested)
        .ok_or_else(|| AppError::Validation(format!("Unknown equipment status '{}'", requested)))?;
    validate_transition(current, target)
}
