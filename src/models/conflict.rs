//! Allocation conflict detection results

use serde::{Deserialize, Serialize};

use super::enums::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Orphaned job reference. Ordered first: it is fixed before mismatches.
    AllocationConflict,
    StatusMismatch,
    MultipleJobAllocation,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::AllocationConflict => "allocation_conflict",
            ConflictKind::StatusMismatch => "status_mismatch",
            ConflictKind::MultipleJobAllocation => "multiple_job_allocation",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transient scan result; regenerated on each scan, never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationConflict {
    /// Stable within a scan: `<kind>:<equipment id or code>`
    pub id: String,
    pub kind: ConflictKind,
    pub equipment_id: String,
    pub equipment_code: String,
    pub job_ids: Vec<String>,
    pub severity: Severity,
    pub description: String,
}

/// Caller's choice when resolving a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    /// `multiple_job_allocation`: keep this job's record, return the others
    KeepCurrentJob { job_id: String },
    /// `multiple_job_allocation`: return every deployed record of the code
    ReturnAll,
    /// `status_mismatch` / `allocation_conflict`: apply the deterministic fix
    Repair,
}

/// What a resolution changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionOutcome {
    pub conflict_id: String,
    pub updated_equipment: Vec<String>,
    /// Already consistent when re-read; nothing was changed
    pub stale: bool,
}

/// Summary of an `auto_resolve` pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoResolveReport {
    pub resolved: Vec<ResolutionOutcome>,
    /// Conflicts that need a human choice
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}
