//! Equipment catalog service: units, types and operator status changes

use regex::Regex;
use serde::Serialize;
use validator::Validate;

use super::{
    allocation::AllocationEngine,
    events::{DomainEvent, EventBus},
    status::{normalize_status, validate_transition},
    transactions::{Operation, OperationStatus, TransactionManager},
};
use crate::{
    error::{AppError, AppResult, ErrorSummary},
    models::{
        enums::EquipmentStatus,
        equipment::{CreateEquipment, CreateEquipmentType, EquipmentType, EquipmentUnit, UpdateEquipmentType},
    },
    repository::{NewEquipment, Repository},
};

const CODE_WIDTH: usize = 3;

/// Next free code for `prefix`: one past the highest numeric suffix in use
pub fn next_code<'a>(prefix: &str, existing: impl IntoIterator<Item = &'a str>) -> AppResult<String> {
    let pattern = Regex::new(&format!(r"^{}(\d+)$", regex::escape(prefix)))
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let highest = existing
        .into_iter()
        .filter_map(|code| pattern.captures(code))
        .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()))
        .max()
        .unwrap_or(0);
    Ok(format!("{}{:0width$}", prefix, highest + 1, width = CODE_WIDTH))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkStatusReport {
    pub status: Option<EquipmentStatus>,
    pub updated: Vec<String>,
    pub failed: Vec<(String, ErrorSummary)>,
}

#[derive(Clone)]
pub struct EquipmentService {
    repository: Repository,
    allocation: AllocationEngine,
    transactions: TransactionManager,
    events: EventBus,
}

impl EquipmentService {
    pub fn new(
        repository: Repository,
        allocation: AllocationEngine,
        transactions: TransactionManager,
        events: EventBus,
    ) -> Self {
        Self {
            repository,
            allocation,
            transactions,
            events,
        }
    }

    // =========================================================================
    // UNITS
    // =========================================================================

    pub async fn list(&self) -> AppResult<Vec<EquipmentUnit>> {
        self.repository.equipment_list().await
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<EquipmentUnit> {
        self.repository.equipment_get(id).await
    }

    /// Create a unit; without an explicit code one is generated from the
    /// type's prefix (`SS` -> `SS001`, `SS002`...).
    pub async fn create(&self, data: &CreateEquipment) -> AppResult<EquipmentUnit> {
        data.validate()?;
        let equipment_type = self.repository.type_get(&data.type_id).await?;

        let code = match data.code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => {
                if !self.repository.equipment_list_by_code(code).await?.is_empty() {
                    return Err(AppError::Conflict(format!("Equipment code {} already exists", code)));
                }
                code.to_string()
            }
            None => {
                let prefix = equipment_type.default_code_prefix.as_deref().ok_or_else(|| {
                    AppError::Validation(format!(
                        "Equipment type {} has no code prefix; a code is required",
                        equipment_type.name
                    ))
                })?;
                let units = self.repository.equipment_list().await?;
                next_code(prefix, units.iter().map(|u| u.code.as_str()))?
            }
        };

        let unit = self
            .repository
            .equipment_create(&NewEquipment {
                code,
                type_id: equipment_type.id,
                location_id: data.location_id.clone(),
                serial_number: data.serial_number.clone(),
                notes: data.notes.clone(),
            })
            .await?;
        tracing::info!("Equipment {} created", unit.code);
        Ok(unit)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let unit = self.repository.equipment_get(id).await?;
        if unit.is_deployed() {
            return Err(AppError::Availability(format!(
                "Equipment {} is deployed; release it before deleting",
                unit.code
            )));
        }
        self.repository.equipment_delete(id).await
    }

    /// Operator status change from free text (`"repair"`, `"In Use"`...).
    ///
    /// Deployment goes through allocation, so a request resolving to
    /// `deployed` is rejected here.
    pub async fn update_status(&self, id: &str, requested: &str) -> AppResult<EquipmentUnit> {
        let target = parse_target(requested)?;
        self.apply_status(id, target).await
    }

    async fn apply_status(&self, id: &str, target: EquipmentStatus) -> AppResult<EquipmentUnit> {
        let unit = self.repository.equipment_get(id).await?;
        validate_transition(unit.status, target)?;
        if unit.status == target {
            return Ok(unit);
        }
        self.allocation
            .force_status(&unit, target, None, &format!("Status set to {}", target))
            .await
    }

    /// Apply one status to many units as a single transaction. Each unit is a
    /// retryable, non-critical step, so one failure does not block the rest.
    pub async fn bulk_update_status(&self, ids: &[String], requested: &str) -> AppResult<BulkStatusReport> {
        let target = parse_target(requested)?;

        let operations = ids
            .iter()
            .map(|id| {
                let service = self.clone();
                let equipment_id = id.clone();
                Operation::new(id.clone(), move || {
                    let service = service.clone();
                    let equipment_id = equipment_id.clone();
                    async move {
                        let unit = service.apply_status(&equipment_id, target).await?;
                        Ok::<_, AppError>(serde_json::Value::String(unit.id))
                    }
                })
                .retryable()
            })
            .collect();

        let result = self.transactions.execute(operations).await;

        let mut report = BulkStatusReport {
            status: Some(target),
            ..Default::default()
        };
        for outcome in result.operations {
            match (outcome.status, outcome.error) {
                (OperationStatus::Succeeded, _) => report.updated.push(outcome.operation_id),
                (_, Some(error)) => report.failed.push((outcome.operation_id, error)),
                (status, None) => {
                    tracing::warn!("Bulk status step {} ended as {:?}", outcome.operation_id, status)
                }
            }
        }

        tracing::info!(
            "Bulk status {}: {} updated, {} failed",
            target,
            report.updated.len(),
            report.failed.len()
        );
        if !report.updated.is_empty() {
            self.events.publish(DomainEvent::BulkEquipmentStatusUpdated {
                equipment_ids: report.updated.clone(),
                status: target,
            });
        }
        Ok(report)
    }

    // =========================================================================
    // TYPES
    // =========================================================================

    pub async fn list_types(&self) -> AppResult<Vec<EquipmentType>> {
        self.repository.type_list().await
    }

    pub async fn get_type(&self, id: &str) -> AppResult<EquipmentType> {
        self.repository.type_get(id).await
    }

    pub async fn create_type(&self, data: &CreateEquipmentType) -> AppResult<EquipmentType> {
        data.validate()?;
        let created = self.repository.type_create(data).await?;
        self.events.publish(DomainEvent::EquipmentTypeCreated {
            type_id: created.id.clone(),
            name: created.name.clone(),
        });
        Ok(created)
    }

    pub async fn update_type(&self, id: &str, data: &UpdateEquipmentType) -> AppResult<EquipmentType> {
        data.validate()?;
        let updated = self.repository.type_update(id, data).await?;
        self.events.publish(DomainEvent::EquipmentTypeUpdated {
            type_id: updated.id.clone(),
            name: updated.name.clone(),
        });
        Ok(updated)
    }

    /// Delete a type no unit references
    pub async fn delete_type(&self, id: &str) -> AppResult<()> {
        let units = self.repository.equipment_list().await?;
        let in_use = units.iter().filter(|u| u.type_id == id).count();
        if in_use > 0 {
            return Err(AppError::Conflict(format!(
                "Equipment type {} is used by {} units",
                id, in_use
            )));
        }
        self.repository.type_delete(id).await?;
        self.events.publish(DomainEvent::EquipmentTypeDeleted {
            type_id: id.to_string(),
        });
        Ok(())
    }
}

fn parse_target(requested: &str) -> AppResult<EquipmentStatus> {
    let target = normalize_status(requested)
        .ok_or_else(|| AppError::Validation(format!("Unknown equipment status '{}'", requested)))?;
    if target == EquipmentStatus::Deployed {
        return Err(AppError::Validation(
            "Equipment is deployed by allocating it to a job".to_string(),
        ));
    }
    Ok(target)
}
