//! Shared domain enums

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::AppError;

// ---------------------------------------------------------------------------
// EquipmentStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an individually tracked equipment unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EquipmentStatus {
    Available,
    Deployed,
    Maintenance,
    RedTagged,
    Retired,
}

impl EquipmentStatus {
    pub const ALL: [EquipmentStatus; 5] = [
        EquipmentStatus::Available,
        EquipmentStatus::Deployed,
        EquipmentStatus::Maintenance,
        EquipmentStatus::RedTagged,
        EquipmentStatus::Retired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentStatus::Available => "available",
            EquipmentStatus::Deployed => "deployed",
            EquipmentStatus::Maintenance => "maintenance",
            EquipmentStatus::RedTagged => "red-tagged",
            EquipmentStatus::Retired => "retired",
        }
    }

    /// Statuses counted as downtime for availability figures
    pub fn is_out_of_service(&self) -> bool {
        matches!(self, EquipmentStatus::Maintenance | EquipmentStatus::RedTagged)
    }
}

impl std::fmt::Display for EquipmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strict parse of the canonical names. Synonyms are handled by
/// `services::status::normalize_status`.
impl FromStr for EquipmentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EquipmentStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown equipment status '{}'", s)))
    }
}

// ---------------------------------------------------------------------------
// LocationKind
// ---------------------------------------------------------------------------

/// Whether a unit currently sits in storage or out on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    #[default]
    Storage,
    Job,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationKind::Storage => "storage",
            LocationKind::Job => "job",
        }
    }
}

impl FromStr for LocationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "storage" => Ok(LocationKind::Storage),
            "job" => Ok(LocationKind::Job),
            other => Err(AppError::Validation(format!("Unknown location kind '{}'", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity shared by red tags and detected conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(AppError::Validation(format!("Unknown severity '{}'", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Interrupted => "interrupted",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "interrupted" => Ok(SessionStatus::Interrupted),
            other => Err(AppError::Validation(format!("Unknown session status '{}'", other))),
        }
    }
}
