//! Equipment unit, equipment type and status history models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::enums::{EquipmentStatus, LocationKind, Severity};

/// One physically distinct, individually tracked equipment unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentUnit {
    pub id: String,
    /// External equipment code (e.g. `SS001`). Legacy records may duplicate it.
    pub code: String,
    pub type_id: String,
    /// Home storage location; kept while deployed so a return can restore it
    pub location_id: Option<String>,
    pub location_kind: LocationKind,
    pub status: EquipmentStatus,
    pub job_id: Option<String>,
    pub serial_number: Option<String>,
    pub red_tag_reason: Option<String>,
    pub red_tag_severity: Option<Severity>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EquipmentUnit {
    pub fn is_deployed(&self) -> bool {
        self.status == EquipmentStatus::Deployed
    }
}

/// Create equipment unit request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateEquipment {
    /// Generated from the type's default prefix when absent
    pub code: Option<String>,
    #[validate(length(min = 1, message = "Equipment type is required"))]
    pub type_id: String,
    pub location_id: Option<String>,
    pub serial_number: Option<String>,
    pub notes: Option<String>,
}

/// Partial update of an equipment unit. `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EquipmentPatch {
    pub status: Option<EquipmentStatus>,
    pub job_id: Option<Option<String>>,
    pub location_id: Option<Option<String>>,
    pub location_kind: Option<LocationKind>,
    pub red_tag_reason: Option<Option<String>>,
    pub red_tag_severity: Option<Option<Severity>>,
    pub serial_number: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

impl EquipmentPatch {
    pub fn status(status: EquipmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch that puts every mutable field back to the snapshot's values
    pub fn restore(snapshot: &EquipmentUnit) -> Self {
        Self {
            status: Some(snapshot.status),
            job_id: Some(snapshot.job_id.clone()),
            location_id: Some(snapshot.location_id.clone()),
            location_kind: Some(snapshot.location_kind),
            red_tag_reason: Some(snapshot.red_tag_reason.clone()),
            red_tag_severity: Some(snapshot.red_tag_severity),
            serial_number: Some(snapshot.serial_number.clone()),
            notes: Some(snapshot.notes.clone()),
        }
    }

    pub fn apply_to(&self, unit: &mut EquipmentUnit, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            unit.status = status;
        }
        if let Some(ref job_id) = self.job_id {
            unit.job_id = job_id.clone();
        }
        if let Some(ref location_id) = self.location_id {
            unit.location_id = location_id.clone();
        }
        if let Some(kind) = self.location_kind {
            unit.location_kind = kind;
        }
        if let Some(ref reason) = self.red_tag_reason {
            unit.red_tag_reason = reason.clone();
        }
        if let Some(severity) = self.red_tag_severity {
            unit.red_tag_severity = severity;
        }
        if let Some(ref serial) = self.serial_number {
            unit.serial_number = serial.clone();
        }
        if let Some(ref notes) = self.notes {
            unit.notes = notes.clone();
        }
        unit.updated_at = now;
    }
}

/// Catalog entry referenced by equipment units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentType {
    pub id: String,
    pub name: String,
    pub category: String,
    /// Individually serialized (as opposed to bulk, quantity-only stock)
    pub individually_tracked: bool,
    /// Prefix for generated codes, e.g. `SS` for `SS001`
    pub default_code_prefix: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create equipment type request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateEquipmentType {
    #[validate(length(min = 1, message = "Type name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "Category is required"))]
    pub category: String,
    #[serde(default = "default_true")]
    pub individually_tracked: bool,
    #[validate(length(min = 1, max = 8, message = "Code prefix must be 1-8 characters"))]
    pub default_code_prefix: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Update equipment type request
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateEquipmentType {
    #[validate(length(min = 1, message = "Type name cannot be empty"))]
    pub name: Option<String>,
    pub category: Option<String>,
    pub individually_tracked: Option<bool>,
    pub default_code_prefix: Option<Option<String>>,
}

/// Append-only record of an accepted status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: String,
    pub equipment_id: String,
    pub from: EquipmentStatus,
    pub to: EquipmentStatus,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// New status history entry
#[derive(Debug, Clone)]
pub struct NewStatusChange {
    pub equipment_id: String,
    pub from: EquipmentStatus,
    pub to: EquipmentStatus,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
}
