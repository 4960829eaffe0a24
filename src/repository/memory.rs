//! In-process repository.
//!
//! Backs the test suite and serves as the local tier of `CachedRepository`.

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EquipmentRepository, NewEquipment};
use crate::{
    error::{AppError, AppResult},
    models::{
        enums::{EquipmentStatus, LocationKind, SessionStatus},
        equipment::{
            CreateEquipmentType, EquipmentPatch, EquipmentType, EquipmentUnit, NewStatusChange,
            StatusChange, UpdateEquipmentType,
        },
        job::{Job, StorageLocation},
        usage::{NewRedTagEvent, NewUsageSession, RedTagEvent, UsageSession},
    },
};

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Default, Clone)]
pub(crate) struct MemoryState {
    pub equipment: IndexMap<String, EquipmentUnit>,
    pub types: IndexMap<String, EquipmentType>,
    pub locations: IndexMap<String, StorageLocation>,
    pub jobs: IndexMap<String, Job>,
    pub sessions: IndexMap<String, UsageSession>,
    pub red_tags: IndexMap<String, RedTagEvent>,
    pub history: IndexMap<String, StatusChange>,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // SEEDING (records owned by other collaborators)
    // =========================================================================

    pub async fn insert_unit(&self, unit: EquipmentUnit) {
        self.state.write().await.equipment.insert(unit.id.clone(), unit);
    }

    pub async fn insert_type(&self, equipment_type: EquipmentType) {
        self.state
            .write()
            .await
            .types
            .insert(equipment_type.id.clone(), equipment_type);
    }

    pub async fn insert_location(&self, location: StorageLocation) {
        self.state
            .write()
            .await
            .locations
            .insert(location.id.clone(), location);
    }

    pub async fn insert_job(&self, job: Job) {
        self.state.write().await.jobs.insert(job.id.clone(), job);
    }

    pub async fn insert_session(&self, session: UsageSession) {
        self.state
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    pub async fn insert_red_tag(&self, event: RedTagEvent) {
        self.state.write().await.red_tags.insert(event.id.clone(), event);
    }

    pub async fn insert_history(&self, change: StatusChange) {
        self.state.write().await.history.insert(change.id.clone(), change);
    }

    /// Soft-delete a job
    pub async fn delete_job(&self, id: &str) {
        if let Some(job) = self.state.write().await.jobs.get_mut(id) {
            job.deleted_at = Some(Utc::now());
        }
    }

    pub(crate) async fn replace_state(&self, state: MemoryState) {
        *self.state.write().await = state;
    }
}

#[async_trait]
impl EquipmentRepository for MemoryRepository {
    // =========================================================================
    // EQUIPMENT
    // =========================================================================

    async fn equipment_list(&self) -> AppResult<Vec<EquipmentUnit>> {
        let state = self.state.read().await;
        let mut units: Vec<_> = state.equipment.values().cloned().collect();
        units.sort_by(|a, b| a.code.cmp(&b.code).then_with(|| a.id.cmp(&b.id)));
        Ok(units)
    }

    async fn equipment_get(&self, id: &str) -> AppResult<EquipmentUnit> {
        self.state
            .read()
            .await
            .equipment
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Equipment {} not found", id)))
    }

    async fn equipment_list_by_code(&self, code: &str) -> AppResult<Vec<EquipmentUnit>> {
        Ok(self
            .state
            .read()
            .await
            .equipment
            .values()
            .filter(|u| u.code == code)
            .cloned()
            .collect())
    }

    async fn equipment_create(&self, data: &NewEquipment) -> AppResult<EquipmentUnit> {
        let now = Utc::now();
        let unit = EquipmentUnit {
            id: new_id(),
            code: data.code.clone(),
            type_id: data.type_id.clone(),
            location_id: data.location_id.clone(),
            location_kind: LocationKind::Storage,
            status: EquipmentStatus::Available,
            job_id: None,
            serial_number: data.serial_number.clone(),
            red_tag_reason: None,
            red_tag_severity: None,
            notes: data.notes.clone(),
            created_at: now,
            updated_at: now,
        };
        self.state
            .write()
            .await
            .equipment
            .insert(unit.id.clone(), unit.clone());
        Ok(unit)
    }

    async fn equipment_update(&self, id: &str, patch: &EquipmentPatch) -> AppResult<EquipmentUnit> {
        let mut state = self.state.write().await;
        let unit = state
            .equipment
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Equipment {} not found", id)))?;
        patch.apply_to(unit, Utc::now());
        Ok(unit.clone())
    }

    async fn equipment_delete(&self, id: &str) -> AppResult<()> {
        self.state
            .write()
            .await
            .equipment
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Equipment {} not found", id)))
    }

    // =========================================================================
    // EQUIPMENT TYPES
    // =========================================================================

    async fn type_list(&self) -> AppResult<Vec<EquipmentType>> {
        let mut types: Vec<_> = self.state.read().await.types.values().cloned().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }

    async fn type_get(&self, id: &str) -> AppResult<EquipmentType> {
        self.state
            .read()
            .await
            .types
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", id)))
    }

    async fn type_create(&self, data: &CreateEquipmentType) -> AppResult<EquipmentType> {
        let now = Utc::now();
        let equipment_type = EquipmentType {
            id: new_id(),
            name: data.name.clone(),
            category: data.category.clone(),
            individually_tracked: data.individually_tracked,
            default_code_prefix: data.default_code_prefix.clone(),
            created_at: now,
            updated_at: now,
        };
        self.state
            .write()
            .await
            .types
            .insert(equipment_type.id.clone(), equipment_type.clone());
        Ok(equipment_type)
    }

    async fn type_update(&self, id: &str, data: &UpdateEquipmentType) -> AppResult<EquipmentType> {
        let mut state = self.state.write().await;
        let equipment_type = state
            .types
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", id)))?;
        if let Some(ref name) = data.name {
            equipment_type.name = name.clone();
        }
        if let Some(ref category) = data.category {
            equipment_type.category = category.clone();
        }
        if let Some(tracked) = data.individually_tracked {
            equipment_type.individually_tracked = tracked;
        }
        if let Some(ref prefix) = data.default_code_prefix {
            equipment_type.default_code_prefix = prefix.clone();
        }
        equipment_type.updated_at = Utc::now();
        Ok(equipment_type.clone())
    }

    async fn type_delete(&self, id: &str) -> AppResult<()> {
        self.state
            .write()
            .await
            .types
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", id)))
    }

    // =========================================================================
    // LOCATIONS & JOBS
    // =========================================================================

    async fn location_list(&self) -> AppResult<Vec<StorageLocation>> {
        Ok(self.state.read().await.locations.values().cloned().collect())
    }

    async fn location_get(&self, id: &str) -> AppResult<StorageLocation> {
        self.state
            .read()
            .await
            .locations
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Storage location {} not found", id)))
    }

    async fn job_list(&self) -> AppResult<Vec<Job>> {
        Ok(self.state.read().await.jobs.values().cloned().collect())
    }

    async fn job_get(&self, id: &str) -> AppResult<Job> {
        self.state
            .read()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))
    }

    // =========================================================================
    // USAGE SESSIONS
    // =========================================================================

    async fn session_create(&self, data: &NewUsageSession) -> AppResult<UsageSession> {
        let session = UsageSession {
            id: new_id(),
            equipment_id: data.equipment_id.clone(),
            job_id: data.job_id.clone(),
            job_name: data.job_name.clone(),
            start_time: data.start_time,
            end_time: None,
            hours_used: None,
            status: SessionStatus::Active,
            notes: data.notes.clone(),
        };
        self.state
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn session_get_active(&self, equipment_id: &str) -> AppResult<Option<UsageSession>> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.equipment_id == equipment_id && s.is_active())
            .cloned())
    }

    async fn session_list(&self, equipment_id: &str) -> AppResult<Vec<UsageSession>> {
        let mut sessions: Vec<_> = self
            .state
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.equipment_id == equipment_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_time);
        Ok(sessions)
    }

    async fn session_update(&self, session: &UsageSession) -> AppResult<UsageSession> {
        let mut state = self.state.write().await;
        let stored = state
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| AppError::NotFound(format!("Usage session {} not found", session.id)))?;
        *stored = session.clone();
        Ok(stored.clone())
    }

    async fn session_delete(&self, id: &str) -> AppResult<()> {
        self.state
            .write()
            .await
            .sessions
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Usage session {} not found", id)))
    }

    // =========================================================================
    // RED TAGS & HISTORY
    // =========================================================================

    async fn red_tag_create(&self, data: &NewRedTagEvent) -> AppResult<RedTagEvent> {
        let event = RedTagEvent {
            id: new_id(),
            equipment_id: data.equipment_id.clone(),
            reason: data.reason.clone(),
            severity: data.severity,
            hours_at_failure: data.hours_at_failure,
            job_at_failure: data.job_at_failure.clone(),
            resolution: None,
            created_at: data.created_at,
        };
        self.state
            .write()
            .await
            .red_tags
            .insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn red_tag_list(&self, equipment_id: &str) -> AppResult<Vec<RedTagEvent>> {
        Ok(self
            .state
            .read()
            .await
            .red_tags
            .values()
            .filter(|e| e.equipment_id == equipment_id)
            .cloned()
            .collect())
    }

    async fn history_append(&self, data: &NewStatusChange) -> AppResult<StatusChange> {
        let change = StatusChange {
            id: new_id(),
            equipment_id: data.equipment_id.clone(),
            from: data.from,
            to: data.to,
            changed_at: data.changed_at,
            reason: data.reason.clone(),
        };
        self.state
            .write()
            .await
            .history
            .insert(change.id.clone(), change.clone());
        Ok(change)
    }

    async fn history_list(&self, equipment_id: &str) -> AppResult<Vec<StatusChange>> {
        let mut changes: Vec<_> = self
            .state
            .read()
            .await
            .history
            .values()
            .filter(|c| c.equipment_id == equipment_id)
            .cloned()
            .collect();
        changes.sort_by_key(|c| c.changed_at);
        Ok(changes)
    }
}
