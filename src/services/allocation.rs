//! Allocation engine: moves units onto and off jobs.
//!
//! Every multi-step mutation runs through the transaction manager so a
//! failed repository call never leaves a closed session behind an
//! unchanged unit (or the reverse).

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::{
    events::{DomainEvent, EventBus, ReturnKind},
    status::validate_transition,
    transactions::{Operation, TransactionManager},
    usage::UsageTracker,
};
use crate::{
    error::{AppError, AppResult},
    models::{
        enums::{EquipmentStatus, LocationKind, Severity},
        equipment::{EquipmentPatch, EquipmentUnit, NewStatusChange},
        usage::{RedTagEvent, UsageSession},
    },
    repository::Repository,
};

const OP_INTERRUPT_SESSION: &str = "interrupt-session";
const OP_DEPLOY_UNIT: &str = "deploy-unit";
const OP_OPEN_SESSION: &str = "open-session";
const OP_CLOSE_SESSION: &str = "close-session";
const OP_UPDATE_UNIT: &str = "update-unit";
const OP_RECORD_RED_TAG: &str = "record-red-tag";
const OP_RECORD_HISTORY: &str = "record-history";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AllocateRequest {
    #[validate(length(min = 1, message = "Equipment id is required"))]
    pub equipment_id: String,
    #[validate(length(min = 1, message = "Job id is required"))]
    pub job_id: String,
    /// Diagram node the unit was dropped on
    pub node_ref: Option<String>,
    /// Backdated session start; defaults to now
    pub start_time: Option<DateTime<Utc>>,
}

impl AllocateRequest {
    pub fn new(equipment_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            job_id: job_id.into(),
            node_ref: None,
            start_time: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationResult {
    pub equipment: EquipmentUnit,
    pub session: Option<UsageSession>,
    /// Already deployed to the requested job; nothing changed
    pub already_allocated: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReleaseAction {
    Return {
        /// Falls back to the unit's home location, then the default location
        location_id: Option<String>,
    },
    #[serde(rename = "redtag", alias = "red_tag")]
    RedTag { reason: String, severity: Severity },
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReleaseOptions {
    #[serde(flatten)]
    pub action: ReleaseAction,
    pub end_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl ReleaseOptions {
    pub fn return_to(location_id: Option<String>) -> Self {
        Self::with_action(ReleaseAction::Return { location_id })
    }

    pub fn red_tag(reason: impl Into<String>, severity: Severity) -> Self {
        Self::with_action(ReleaseAction::RedTag {
            reason: reason.into(),
            severity,
        })
    }

    pub fn cancel() -> Self {
        Self::with_action(ReleaseAction::Cancel)
    }

    fn with_action(action: ReleaseAction) -> Self {
        Self {
            action,
            end_time: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseResult {
    pub equipment: EquipmentUnit,
    /// The session closed by this release, if one was active
    pub session: Option<UsageSession>,
    pub red_tag: Option<RedTagEvent>,
    pub cancelled: bool,
}

fn to_output<T: Serialize>(value: &T) -> AppResult<Value> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.to_string()))
}

fn decode<T: DeserializeOwned>(outputs: &IndexMap<String, Value>, operation_id: &str) -> AppResult<T> {
    let value = outputs
        .get(operation_id)
        .cloned()
        .ok_or_else(|| AppError::Internal(format!("missing output of {}", operation_id)))?;
    serde_json::from_value(value).map_err(|e| AppError::Internal(e.to_string()))
}

fn decode_optional<T: DeserializeOwned>(
    outputs: &IndexMap<String, Value>,
    operation_id: &str,
) -> AppResult<Option<T>> {
    match outputs.get(operation_id) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => decode(outputs, operation_id).map(Some),
    }
}

/// Critical unit update whose rollback restores the snapshot
fn unit_update_op(
    id: &'static str,
    repository: &Repository,
    snapshot: &EquipmentUnit,
    patch: EquipmentPatch,
) -> Operation {
    let forward_repo = repository.clone();
    let rollback_repo = repository.clone();
    let equipment_id = snapshot.id.clone();
    let restore = EquipmentPatch::restore(snapshot);
    let restore_id = snapshot.id.clone();

    Operation::new(id, move || {
        let repo = forward_repo.clone();
        let equipment_id = equipment_id.clone();
        let patch = patch.clone();
        async move {
            let unit = repo.equipment_update(&equipment_id, &patch).await?;
            to_output(&unit)
        }
    })
    .with_rollback(move |_| {
        let repo = rollback_repo.clone();
        let equipment_id = restore_id.clone();
        let restore = restore.clone();
        async move {
            repo.equipment_update(&equipment_id, &restore).await?;
            Ok::<_, AppError>(())
        }
    })
    .critical()
}

/// Non-critical, retryable history append
fn history_op(repository: &Repository, change: NewStatusChange) -> Operation {
    let repo = repository.clone();
    Operation::new(OP_RECORD_HISTORY, move || {
        let repo = repo.clone();
        let change = change.clone();
        async move {
            let entry = repo.history_append(&change).await?;
            to_output(&entry)
        }
    })
    .retryable()
}

#[derive(Clone)]
pub struct AllocationEngine {
    repository: Repository,
    usage: UsageTracker,
    transactions: TransactionManager,
    events: EventBus,
}

impl AllocationEngine {
    pub fn new(
        repository: Repository,
        usage: UsageTracker,
        transactions: TransactionManager,
        events: EventBus,
    ) -> Self {
        Self {
            repository,
            usage,
            transactions,
            events,
        }
    }

    /// Deploy a unit to a live job and open its usage session.
    ///
    /// Repeating the call for the job the unit is already on is a no-op.
    pub async fn allocate(&self, request: AllocateRequest) -> AppResult<AllocationResult> {
        request.validate()?;
        let unit = self.repository.equipment_get(&request.equipment_id).await?;
        let job = self.repository.job_get(&request.job_id).await?;
        if !job.is_live() {
            return Err(AppError::NotFound(format!("Job {} has been deleted", job.id)));
        }

        if unit.is_deployed() {
            if unit.job_id.as_deref() != Some(job.id.as_str()) {
                return Err(AppError::Availability(format!(
                    "Equipment {} is deployed to job {}",
                    unit.code,
                    unit.job_id.as_deref().unwrap_or("<none>")
                )));
            }
            tracing::debug!("Equipment {} already deployed to job {}", unit.code, job.id);
            let session = self.repository.session_get_active(&unit.id).await?;
            return Ok(AllocationResult {
                equipment: unit,
                session,
                already_allocated: true,
            });
        }

        validate_transition(unit.status, EquipmentStatus::Deployed)?;

        let mut operations = Vec::new();

        if let Some(stale) = self.repository.session_get_active(&unit.id).await? {
            tracing::warn!(
                "Interrupting stale session {} on undeployed equipment {}",
                stale.id,
                unit.code
            );
            let usage = self.usage.clone();
            let rollback_usage = self.usage.clone();
            let equipment_id = unit.id.clone();
            operations.push(
                Operation::new(OP_INTERRUPT_SESSION, move || {
                    let usage = usage.clone();
                    let equipment_id = equipment_id.clone();
                    async move {
                        let closed = usage
                            .interrupt_session(&equipment_id, Some("Superseded by new allocation".into()))
                            .await?;
                        to_output(&closed)
                    }
                })
                .with_rollback(move |_| {
                    let usage = rollback_usage.clone();
                    let stale = stale.clone();
                    async move { usage.restore_session(&stale).await }
                })
                .critical(),
            );
        }

        operations.push(unit_update_op(
            OP_DEPLOY_UNIT,
            &self.repository,
            &unit,
            EquipmentPatch {
                status: Some(EquipmentStatus::Deployed),
                job_id: Some(Some(job.id.clone())),
                location_kind: Some(LocationKind::Job),
                ..Default::default()
            },
        ));

        let usage = self.usage.clone();
        let rollback_usage = self.usage.clone();
        let equipment_id = unit.id.clone();
        let job_id = job.id.clone();
        let start_time = request.start_time;
        operations.push(
            Operation::new(OP_OPEN_SESSION, move || {
                let usage = usage.clone();
                let equipment_id = equipment_id.clone();
                let job_id = job_id.clone();
                async move {
                    let session = usage.start_session(&equipment_id, &job_id, start_time).await?;
                    to_output(&session)
                }
            })
            .with_rollback(move |output| {
                let usage = rollback_usage.clone();
                async move {
                    let session_id = output
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| AppError::Internal("session output has no id".to_string()))?
                        .to_string();
                    usage.discard_session(&session_id).await
                }
            })
            .critical(),
        );

        operations.push(history_op(
            &self.repository,
            NewStatusChange {
                equipment_id: unit.id.clone(),
                from: unit.status,
                to: EquipmentStatus::Deployed,
                changed_at: Utc::now(),
                reason: Some(format!("Allocated to job {}", job.id)),
            },
        ));

        let outputs = self.transactions.execute(operations).await.into_result()?;
        let equipment: EquipmentUnit = decode(&outputs, OP_DEPLOY_UNIT)?;
        let session: UsageSession = decode(&outputs, OP_OPEN_SESSION)?;

        tracing::info!("Equipment {} allocated to job {}", equipment.code, job.id);
        self.events.publish(DomainEvent::EquipmentAllocated {
            equipment_id: equipment.id.clone(),
            job_id: job.id,
            session_id: Some(session.id.clone()),
            node_ref: request.node_ref,
        });

        Ok(AllocationResult {
            equipment,
            session: Some(session),
            already_allocated: false,
        })
    }

    /// Take a unit off its job: return it to storage, red-tag it, or do
    /// nothing (`Cancel`).
    pub async fn release(&self, equipment_id: &str, options: ReleaseOptions) -> AppResult<ReleaseResult> {
        let unit = self.repository.equipment_get(equipment_id).await?;

        let (target, kind) = match &options.action {
            ReleaseAction::Cancel => {
                return Ok(ReleaseResult {
                    equipment: unit,
                    session: None,
                    red_tag: None,
                    cancelled: true,
                })
            }
            ReleaseAction::Return { .. } => (EquipmentStatus::Available, ReturnKind::Returned),
            ReleaseAction::RedTag { reason, .. } => {
                if reason.trim().is_empty() {
                    return Err(AppError::Validation("Red-tag reason is required".to_string()));
                }
                (EquipmentStatus::RedTagged, ReturnKind::RedTagged)
            }
        };
        validate_transition(unit.status, target)?;

        let now = options.end_time.unwrap_or_else(Utc::now);
        let active = self.repository.session_get_active(&unit.id).await?;
        let job_at_release = unit
            .job_id
            .clone()
            .or_else(|| active.as_ref().map(|s| s.job_id.clone()));

        let mut operations = Vec::new();

        if let Some(snapshot) = active {
            let note = match &options.action {
                ReleaseAction::RedTag { reason, .. } => Some(match &options.notes {
                    Some(notes) => format!("Red-tagged: {}; {}", reason, notes),
                    None => format!("Red-tagged: {}", reason),
                }),
                _ => options.notes.clone(),
            };
            let usage = self.usage.clone();
            let rollback_usage = self.usage.clone();
            let equipment_id = unit.id.clone();
            operations.push(
                Operation::new(OP_CLOSE_SESSION, move || {
                    let usage = usage.clone();
                    let equipment_id = equipment_id.clone();
                    let note = note.clone();
                    async move {
                        let closed = usage.end_session(&equipment_id, Some(now), note).await?;
                        to_output(&closed)
                    }
                })
                .with_rollback(move |_| {
                    let usage = rollback_usage.clone();
                    let snapshot = snapshot.clone();
                    async move { usage.restore_session(&snapshot).await }
                })
                .critical(),
            );
        }

        let mut patch = EquipmentPatch {
            status: Some(target),
            job_id: Some(None),
            location_kind: Some(LocationKind::Storage),
            ..Default::default()
        };
        let mut location_id = unit.location_id.clone();
        match &options.action {
            ReleaseAction::Return { location_id: requested } => {
                location_id = match requested.clone().or_else(|| unit.location_id.clone()) {
                    Some(id) => Some(id),
                    None => self.default_location_id().await?,
                };
                patch.location_id = Some(location_id.clone());
            }
            ReleaseAction::RedTag { reason, severity } => {
                patch.red_tag_reason = Some(Some(reason.clone()));
                patch.red_tag_severity = Some(Some(*severity));
            }
            ReleaseAction::Cancel => {}
        }
        operations.push(unit_update_op(OP_UPDATE_UNIT, &self.repository, &unit, patch));

        let severity = match &options.action {
            ReleaseAction::RedTag { reason, severity } => {
                let usage = self.usage.clone();
                let equipment_id = unit.id.clone();
                let reason = reason.clone();
                let severity = *severity;
                let job_at_failure = job_at_release.clone();
                operations.push(
                    Operation::new(OP_RECORD_RED_TAG, move || {
                        let usage = usage.clone();
                        let equipment_id = equipment_id.clone();
                        let reason = reason.clone();
                        let job_at_failure = job_at_failure.clone();
                        async move {
                            let event = usage
                                .record_red_tag(&equipment_id, job_at_failure, &reason, severity, now)
                                .await?;
                            to_output(&event)
                        }
                    })
                    .critical(),
                );
                Some(severity)
            }
            _ => None,
        };

        if unit.status != target {
            operations.push(history_op(
                &self.repository,
                NewStatusChange {
                    equipment_id: unit.id.clone(),
                    from: unit.status,
                    to: target,
                    changed_at: now,
                    reason: match kind {
                        ReturnKind::Returned => Some("Returned to storage".to_string()),
                        ReturnKind::RedTagged => Some("Red-tagged".to_string()),
                    },
                },
            ));
        }

        let outputs = self.transactions.execute(operations).await.into_result()?;
        let equipment: EquipmentUnit = decode(&outputs, OP_UPDATE_UNIT)?;
        let session: Option<UsageSession> = decode_optional(&outputs, OP_CLOSE_SESSION)?;
        let red_tag: Option<RedTagEvent> = decode_optional(&outputs, OP_RECORD_RED_TAG)?;

        tracing::info!(
            "Equipment {} released ({:?}) from job {}",
            equipment.code,
            kind,
            job_at_release.as_deref().unwrap_or("<none>")
        );
        self.events.publish(DomainEvent::EquipmentReturned {
            equipment_id: equipment.id.clone(),
            job_id: job_at_release,
            kind,
            location_id,
            hours_used: session.as_ref().and_then(|s| s.hours_used),
            severity,
        });

        Ok(ReleaseResult {
            equipment,
            session,
            red_tag,
            cancelled: false,
        })
    }

    /// Set a status without the transition check, keeping job reference and
    /// session bookkeeping consistent. Used by conflict repair.
    pub(crate) async fn force_status(
        &self,
        unit: &EquipmentUnit,
        status: EquipmentStatus,
        job_id: Option<String>,
        reason: &str,
    ) -> AppResult<EquipmentUnit> {
        let mut operations = Vec::new();
        let active = self.repository.session_get_active(&unit.id).await?;

        // Leaving deployed closes the live session before the unit changes
        if status != EquipmentStatus::Deployed {
            if let Some(snapshot) = active.clone() {
                let usage = self.usage.clone();
                let rollback_usage = self.usage.clone();
                let equipment_id = unit.id.clone();
                let note = format!("Closed by repair: {}", reason);
                operations.push(
                    Operation::new(OP_CLOSE_SESSION, move || {
                        let usage = usage.clone();
                        let equipment_id = equipment_id.clone();
                        let note = note.clone();
                        async move {
                            let closed = usage.end_session(&equipment_id, None, Some(note)).await?;
                            to_output(&closed)
                        }
                    })
                    .with_rollback(move |_| {
                        let usage = rollback_usage.clone();
                        let snapshot = snapshot.clone();
                        async move { usage.restore_session(&snapshot).await }
                    })
                    .critical(),
                );
            }
        }

        let location_kind = if status == EquipmentStatus::Deployed {
            LocationKind::Job
        } else {
            LocationKind::Storage
        };
        let mut patch = EquipmentPatch {
            status: Some(status),
            job_id: Some(job_id.clone()),
            location_kind: Some(location_kind),
            ..Default::default()
        };
        if status != EquipmentStatus::RedTagged {
            patch.red_tag_reason = Some(None);
            patch.red_tag_severity = Some(None);
        }
        operations.push(unit_update_op(OP_UPDATE_UNIT, &self.repository, unit, patch));

        if status == EquipmentStatus::Deployed && active.is_none() {
            if let Some(job_id) = job_id.clone() {
                let usage = self.usage.clone();
                let rollback_usage = self.usage.clone();
                let equipment_id = unit.id.clone();
                operations.push(
                    Operation::new(OP_OPEN_SESSION, move || {
                        let usage = usage.clone();
                        let equipment_id = equipment_id.clone();
                        let job_id = job_id.clone();
                        async move {
                            let session = usage.start_session(&equipment_id, &job_id, None).await?;
                            to_output(&session)
                        }
                    })
                    .with_rollback(move |output| {
                        let usage = rollback_usage.clone();
                        async move {
                            match output.get("id").and_then(Value::as_str) {
                                Some(id) => usage.discard_session(id).await,
                                None => Ok(()),
                            }
                        }
                    })
                    .critical(),
                );
            }
        }

        if unit.status != status {
            operations.push(history_op(
                &self.repository,
                NewStatusChange {
                    equipment_id: unit.id.clone(),
                    from: unit.status,
                    to: status,
                    changed_at: Utc::now(),
                    reason: Some(reason.to_string()),
                },
            ));
        }

        let outputs = self.transactions.execute(operations).await.into_result()?;
        let updated: EquipmentUnit = decode(&outputs, OP_UPDATE_UNIT)?;

        if unit.status != status {
            self.events.publish(DomainEvent::EquipmentStatusChange {
                equipment_id: updated.id.clone(),
                from: unit.status,
                to: status,
            });
        }
        Ok(updated)
    }

    async fn default_location_id(&self) -> AppResult<Option<String>> {
        let locations = self.repository.location_list().await?;
        Ok(locations
            .iter()
            .find(|l| l.is_default)
            .or_else(|| locations.first())
            .map(|l| l.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::SessionStatus;
    use crate::repository::MockEquipmentRepository;
    use crate::services::transactions::TransactionOptions;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn deployed_unit() -> EquipmentUnit {
        EquipmentUnit {
            id: "eq-1".into(),
            code: "SS001".into(),
            type_id: "type-ss".into(),
            location_id: Some("yard".into()),
            location_kind: LocationKind::Job,
            status: EquipmentStatus::Deployed,
            job_id: Some("job-a".into()),
            serial_number: None,
            red_tag_reason: None,
            red_tag_severity: None,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn active_session() -> UsageSession {
        UsageSession {
            id: "sess-1".into(),
            equipment_id: "eq-1".into(),
            job_id: "job-a".into(),
            job_name: Some("North field".into()),
            start_time: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
            end_time: None,
            hours_used: None,
            status: SessionStatus::Active,
            notes: None,
        }
    }

    fn engine(repo: MockEquipmentRepository) -> (AllocationEngine, EventBus) {
        let repository: Repository = Arc::new(repo);
        let events = EventBus::new();
        let engine = AllocationEngine::new(
            repository.clone(),
            UsageTracker::new(repository),
            TransactionManager::new(TransactionOptions::default()),
            events.clone(),
        );
        (engine, events)
    }

    #[tokio::test]
    async fn failed_unit_update_reopens_the_closed_session() {
        let mut repo = MockEquipmentRepository::new();
        repo.expect_equipment_get()
            .returning(|_| Ok(deployed_unit()));
        repo.expect_session_get_active()
            .returning(|_| Ok(Some(active_session())));

        let writes = Arc::new(Mutex::new(Vec::new()));
        let log = writes.clone();
        repo.expect_session_update()
            .times(2)
            .returning(move |session| {
                log.lock().unwrap().push(session.clone());
                Ok(session.clone())
            });
        repo.expect_equipment_update()
            .times(1)
            .returning(|_, _| Err(AppError::Persistence("connection reset".into())));
        repo.expect_history_append().never();

        let (engine, events) = engine(repo);
        let mut sub = events.subscribe(crate::services::events::EventFilter::All);

        let err = engine
            .release("eq-1", ReleaseOptions::return_to(None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));

        let writes = writes.lock().unwrap();
        assert_eq!(writes[0].status, SessionStatus::Completed);
        assert_eq!(writes[1], active_session());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn missing_unit_fails_without_side_effects() {
        let mut repo = MockEquipmentRepository::new();
        repo.expect_equipment_get()
            .returning(|id| Err(AppError::NotFound(format!("Equipment {} not found", id))));
        repo.expect_session_get_active().never();
        repo.expect_session_update().never();
        repo.expect_equipment_update().never();

        let (engine, _events) = engine(repo);
        let err = engine
            .release("ghost", ReleaseOptions::red_tag("cracked housing", Severity::High))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_is_a_no_op() {
        let mut repo = MockEquipmentRepository::new();
        repo.expect_equipment_get().returning(|_| Ok(deployed_unit()));
        repo.expect_equipment_update().never();

        let (engine, _events) = engine(repo);
        let result = engine.release("eq-1", ReleaseOptions::cancel()).await.unwrap();
        assert!(result.cancelled);
        assert!(result.equipment.is_deployed());
    }

    #[test]
    fn release_options_parse_from_json() {
        let options: ReleaseOptions = serde_json::from_value(serde_json::json!({
            "action": "redtag",
            "reason": "leaking seal",
            "severity": "critical"
        }))
        .unwrap();
        assert_eq!(
            options.action,
            ReleaseAction::RedTag {
                reason: "leaking seal".into(),
                severity: Severity::Critical
            }
        );
    }
}
