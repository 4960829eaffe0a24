//! Two-tier repository: a local in-memory mirror in front of a remote store.
//!
//! Reads hit the mirror. Writes go through to the remote tier and are
//! mirrored only once the remote accepted them. `run_cache_reconciler`
//! refreshes the mirror on a timer; it consumes the repository and the
//! engine never depends on it.
//!
//! Writes hold the gate shared and a refresh holds it exclusively, so a
//! snapshot taken from the remote tier never replaces a write that landed
//! while it was being read.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::memory::{MemoryRepository, MemoryState};
use super::{EquipmentRepository, NewEquipment, Repository};
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

pub struct CachedRepository {
    local: MemoryRepository,
    remote: Repository,
    warmed: AtomicBool,
    gate: RwLock<()>,
}

impl CachedRepository {
    pub fn new(remote: Repository) -> Self {
        Self {
            local: MemoryRepository::new(),
            remote,
            warmed: AtomicBool::new(false),
            gate: RwLock::new(()),
        }
    }

    /// Rebuild the whole mirror from the remote tier
    pub async fn refresh(&self) -> AppResult<()> {
        let _guard = self.gate.write().await;
        let mut state = MemoryState::default();

        for unit in self.remote.equipment_list().await? {
            for session in self.remote.session_list(&unit.id).await? {
                state.sessions.insert(session.id.clone(), session);
            }
            for event in self.remote.red_tag_list(&unit.id).await? {
                state.red_tags.insert(event.id.clone(), event);
            }
            for change in self.remote.history_list(&unit.id).await? {
                state.history.insert(change.id.clone(), change);
            }
            state.equipment.insert(unit.id.clone(), unit);
        }
        for equipment_type in self.remote.type_list().await? {
            state.types.insert(equipment_type.id.clone(), equipment_type);
        }
        for location in self.remote.location_list().await? {
            state.locations.insert(location.id.clone(), location);
        }
        for job in self.remote.job_list().await? {
            state.jobs.insert(job.id.clone(), job);
        }

        tracing::debug!(
            "Cache refreshed: {} units, {} jobs, {} sessions",
            state.equipment.len(),
            state.jobs.len(),
            state.sessions.len()
        );
        self.local.replace_state(state).await;
        self.warmed.store(true, Ordering::Release);
        Ok(())
    }

    async fn mirror(&self) -> AppResult<&MemoryRepository> {
        if !self.warmed.load(Ordering::Acquire) {
            self.refresh().await?;
        }
        Ok(&self.local)
    }
}

/// Background task that keeps the local mirror in step with the remote tier
pub async fn run_cache_reconciler(cache: Arc<CachedRepository>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = cache.refresh().await {
            tracing::warn!("Cache refresh failed, serving stale mirror: {}", e);
        }
    }
}

#[async_trait]
impl EquipmentRepository for CachedRepository {
    async fn equipment_list(&self) -> AppResult<Vec<EquipmentUnit>> {
        self.mirror().await?.equipment_list().await
    }

    async fn equipment_get(&self, id: &str) -> AppResult<EquipmentUnit> {
        self.mirror().await?.equipment_get(id).await
    }

    async fn equipment_list_by_code(&self, code: &str) -> AppResult<Vec<EquipmentUnit>> {
        self.mirror().await?.equipment_list_by_code(code).await
    }

    async fn equipment_create(&self, data: &NewEquipment) -> AppResult<EquipmentUnit> {
        let _guard = self.gate.read().await;
        let unit = self.remote.equipment_create(data).await?;
        self.local.insert_unit(unit.clone()).await;
        Ok(unit)
    }

    async fn equipment_update(&self, id: &str, patch: &EquipmentPatch) -> AppResult<EquipmentUnit> {
        let _guard = self.gate.read().await;
        let unit = self.remote.equipment_update(id, patch).await?;
        self.local.insert_unit(unit.clone()).await;
        Ok(unit)
    }

    async fn equipment_delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.gate.read().await;
        self.remote.equipment_delete(id).await?;
        let _ = self.local.equipment_delete(id).await;
        Ok(())
    }

    async fn type_list(&self) -> AppResult<Vec<EquipmentType>> {
        self.mirror().await?.type_list().await
    }

    async fn type_get(&self, id: &str) -> AppResult<EquipmentType> {
        self.mirror().await?.type_get(id).await
    }

    async fn type_create(&self, data: &CreateEquipmentType) -> AppResult<EquipmentType> {
        let _guard = self.gate.read().await;
        let equipment_type = self.remote.type_create(data).await?;
        self.local.insert_type(equipment_type.clone()).await;
        Ok(equipment_type)
    }

    async fn type_update(&self, id: &str, data: &UpdateEquipmentType) -> AppResult<EquipmentType> {
        let _guard = self.gate.read().await;
        let equipment_type = self.remote.type_update(id, data).await?;
        self.local.insert_type(equipment_type.clone()).await;
        Ok(equipment_type)
    }

    async fn type_delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.gate.read().await;
        self.remote.type_delete(id).await?;
        let _ = self.local.type_delete(id).await;
        Ok(())
    }

    async fn location_list(&self) -> AppResult<Vec<StorageLocation>> {
        self.mirror().await?.location_list().await
    }

    async fn location_get(&self, id: &str) -> AppResult<StorageLocation> {
        self.mirror().await?.location_get(id).await
    }

    async fn job_list(&self) -> AppResult<Vec<Job>> {
        self.mirror().await?.job_list().await
    }

    async fn job_get(&self, id: &str) -> AppResult<Job> {
        self.mirror().await?.job_get(id).await
    }

    async fn session_create(&self, data: &NewUsageSession) -> AppResult<UsageSession> {
        let _guard = self.gate.read().await;
        let session = self.remote.session_create(data).await?;
        self.local.insert_session(session.clone()).await;
        Ok(session)
    }

    async fn session_get_active(&self, equipment_id: &str) -> AppResult<Option<UsageSession>> {
        self.mirror().await?.session_get_active(equipment_id).await
    }

    async fn session_list(&self, equipment_id: &str) -> AppResult<Vec<UsageSession>> {
        self.mirror().await?.session_list(equipment_id).await
    }

    async fn session_update(&self, session: &UsageSession) -> AppResult<UsageSession> {
        let _guard = self.gate.read().await;
        let stored = self.remote.session_update(session).await?;
        self.local.insert_session(stored.clone()).await;
        Ok(stored)
    }

    async fn session_delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.gate.read().await;
        self.remote.session_delete(id).await?;
        let _ = self.local.session_delete(id).await;
        Ok(())
    }

    async fn red_tag_create(&self, data: &NewRedTagEvent) -> AppResult<RedTagEvent> {
        let _guard = self.gate.read().await;
        let event = self.remote.red_tag_create(data).await?;
        self.local.insert_red_tag(event.clone()).await;
        Ok(event)
    }

    async fn red_tag_list(&self, equipment_id: &str) -> AppResult<Vec<RedTagEvent>> {
        self.mirror().await?.red_tag_list(equipment_id).await
    }

    async fn history_append(&self, data: &NewStatusChange) -> AppResult<StatusChange> {
        let _guard = self.gate.read().await;
        let change = self.remote.history_append(data).await?;
        self.local.insert_history(change.clone()).await;
        Ok(change)
    }

    async fn history_list(&self, equipment_id: &str) -> AppResult<Vec<StatusChange>> {
        self.mirror().await?.history_list(equipment_id).await
    }
}
