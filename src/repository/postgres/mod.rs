//! Postgres-backed repository.
//!
//! Table layout and migrations are owned by the schema collaborator; this
//! module only issues runtime queries against it.

pub mod equipment;
pub mod jobs;
pub mod usage;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use super::{EquipmentRepository, NewEquipment};
use crate::{
    error::AppResult,
    models::{
        equipment::{
            CreateEquipmentType, EquipmentPatch, EquipmentType, EquipmentUnit, NewStatusChange,
            StatusChange, UpdateEquipmentType,
        },
        job::{Job, StorageLocation},
        usage::{NewRedTagEvent, NewUsageSession, RedTagEvent, UsageSession},
    },
};

/// Repository holding the connection pool and one handle per table group
#[derive(Clone)]
pub struct PgRepository {
    pub pool: Pool<Postgres>,
    pub equipment: equipment::EquipmentTable,
    pub jobs: jobs::JobsTable,
    pub usage: usage::UsageTable,
}

impl PgRepository {
    /// Create a new repository with the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            equipment: equipment::EquipmentTable::new(pool.clone()),
            jobs: jobs::JobsTable::new(pool.clone()),
            usage: usage::UsageTable::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl EquipmentRepository for PgRepository {
    async fn equipment_list(&self) -> AppResult<Vec<EquipmentUnit>> {
        self.equipment.list().await
    }

    async fn equipment_get(&self, id: &str) -> AppResult<EquipmentUnit> {
        self.equipment.get_by_id(id).await
    }

    async fn equipment_list_by_code(&self, code: &str) -> AppResult<Vec<EquipmentUnit>> {
        self.equipment.list_by_code(code).await
    }

    async fn equipment_create(&self, data: &NewEquipment) -> AppResult<EquipmentUnit> {
        self.equipment.create(data).await
    }

    async fn equipment_update(&self, id: &str, patch: &EquipmentPatch) -> AppResult<EquipmentUnit> {
        self.equipment.update(id, patch).await
    }

    async fn equipment_delete(&self, id: &str) -> AppResult<()> {
        self.equipment.delete(id).await
    }

    async fn type_list(&self) -> AppResult<Vec<EquipmentType>> {
        self.equipment.type_list().await
    }

    async fn type_get(&self, id: &str) -> AppResult<EquipmentType> {
        self.equipment.type_get(id).await
    }

    async fn type_create(&self, data: &CreateEquipmentType) -> AppResult<EquipmentType> {
        self.equipment.type_create(data).await
    }

    async fn type_update(&self, id: &str, data: &UpdateEquipmentType) -> AppResult<EquipmentType> {
        self.equipment.type_update(id, data).await
    }

    async fn type_delete(&self, id: &str) -> AppResult<()> {
        self.equipment.type_delete(id).await
    }

    async fn location_list(&self) -> AppResult<Vec<StorageLocation>> {
        self.jobs.location_list().await
    }

    async fn location_get(&self, id: &str) -> AppResult<StorageLocation> {
        self.jobs.location_get(id).await
    }

    async fn job_list(&self) -> AppResult<Vec<Job>> {
        self.jobs.list().await
    }

    async fn job_get(&self, id: &str) -> AppResult<Job> {
        self.jobs.get_by_id(id).await
    }

    async fn session_create(&self, data: &NewUsageSession) -> AppResult<UsageSession> {
        self.usage.session_create(data).await
    }

    async fn session_get_active(&self, equipment_id: &str) -> AppResult<Option<UsageSession>> {
        self.usage.session_get_active(equipment_id).await
    }

    async fn session_list(&self, equipment_id: &str) -> AppResult<Vec<UsageSession>> {
        self.usage.session_list(equipment_id).await
    }

    async fn session_update(&self, session: &UsageSession) -> AppResult<UsageSession> {
        self.usage.session_update(session).await
    }

    async fn session_delete(&self, id: &str) -> AppResult<()> {
        self.usage.session_delete(id).await
    }

    async fn red_tag_create(&self, data: &NewRedTagEvent) -> AppResult<RedTagEvent> {
        self.usage.red_tag_create(data).await
    }

    async fn red_tag_list(&self, equipment_id: &str) -> AppResult<Vec<RedTagEvent>> {
        self.usage.red_tag_list(equipment_id).await
    }

    async fn history_append(&self, data: &NewStatusChange) -> AppResult<StatusChange> {
        self.equipment.history_append(data).await
    }

    async fn history_list(&self, equipment_id: &str) -> AppResult<Vec<StatusChange>> {
        self.equipment.history_list(equipment_id).await
    }
}
