//! Repository layer: the persistence collaborator behind the engine.
//!
//! Every component receives the repository as an injected
//! `Arc<dyn EquipmentRepository>`, so the engine runs unchanged against
//! Postgres, the in-memory store, or the two-tier cache.

pub mod cached;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;

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

pub use cached::{run_cache_reconciler, CachedRepository};
pub use memory::MemoryRepository;
pub use postgres::PgRepository;

/// Shared handle to whichever repository implementation is in use
pub type Repository = Arc<dyn EquipmentRepository>;

/// Fields for a new equipment unit; the code is already resolved
#[derive(Debug, Clone)]
pub struct NewEquipment {
    pub code: String,
    pub type_id: String,
    pub location_id: Option<String>,
    pub serial_number: Option<String>,
    pub notes: Option<String>,
}

/// CRUD over equipment, catalog, containers and usage history, addressed by
/// opaque string ids. Lookups by id return `AppError::NotFound` when absent.
/// No cross-call transactions are offered.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EquipmentRepository: Send + Sync {
    // Equipment units
    async fn equipment_list(&self) -> AppResult<Vec<EquipmentUnit>>;
    async fn equipment_get(&self, id: &str) -> AppResult<EquipmentUnit>;
    async fn equipment_list_by_code(&self, code: &str) -> AppResult<Vec<EquipmentUnit>>;
    async fn equipment_create(&self, data: &NewEquipment) -> AppResult<EquipmentUnit>;
    async fn equipment_update(&self, id: &str, patch: &EquipmentPatch) -> AppResult<EquipmentUnit>;
    async fn equipment_delete(&self, id: &str) -> AppResult<()>;

    // Equipment types
    async fn type_list(&self) -> AppResult<Vec<EquipmentType>>;
    async fn type_get(&self, id: &str) -> AppResult<EquipmentType>;
    async fn type_create(&self, data: &CreateEquipmentType) -> AppResult<EquipmentType>;
    async fn type_update(&self, id: &str, data: &UpdateEquipmentType) -> AppResult<EquipmentType>;
    async fn type_delete(&self, id: &str) -> AppResult<()>;

    // Storage locations and jobs (read-only to the engine)
    async fn location_list(&self) -> AppResult<Vec<StorageLocation>>;
    async fn location_get(&self, id: &str) -> AppResult<StorageLocation>;
    async fn job_list(&self) -> AppResult<Vec<Job>>;
    async fn job_get(&self, id: &str) -> AppResult<Job>;

    // Usage sessions
    async fn session_create(&self, data: &NewUsageSession) -> AppResult<UsageSession>;
    async fn session_get_active(&self, equipment_id: &str) -> AppResult<Option<UsageSession>>;
    async fn session_list(&self, equipment_id: &str) -> AppResult<Vec<UsageSession>>;
    async fn session_update(&self, session: &UsageSession) -> AppResult<UsageSession>;
    async fn session_delete(&self, id: &str) -> AppResult<()>;

    // Red tags (append-only)
    async fn red_tag_create(&self, data: &NewRedTagEvent) -> AppResult<RedTagEvent>;
    async fn red_tag_list(&self, equipment_id: &str) -> AppResult<Vec<RedTagEvent>>;

    // Status history (append-only)
    async fn history_append(&self, data: &NewStatusChange) -> AppResult<StatusChange>;
    async fn history_list(&self, equipment_id: &str) -> AppResult<Vec<StatusChange>>;
}
