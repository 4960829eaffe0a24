//! Engine services

pub mod allocation;
pub mod conflicts;
pub mod equipment;
pub mod events;
pub mod status;
pub mod transactions;
pub mod usage;

use crate::{config::EngineConfig, error::AppResult, repository::Repository};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub events: events::EventBus,
    pub transactions: transactions::TransactionManager,
    pub queue: transactions::TransactionQueue,
    pub usage: usage::UsageTracker,
    pub allocation: allocation::AllocationEngine,
    pub conflicts: conflicts::ConflictScanner,
    pub equipment: equipment::EquipmentService,
}

impl Services {
    /// Create all services with the given repository. Spawns the transaction
    /// queue worker, so this must run inside a Tokio runtime.
    pub async fn new(repository: Repository, engine: &EngineConfig) -> AppResult<Self> {
        let events = events::EventBus::new();
        let transactions =
            transactions::TransactionManager::new(transactions::TransactionOptions::from_config(engine));
        let queue = transactions::TransactionQueue::spawn(
            transactions.clone(),
            engine.queue_batch_size,
            engine.queue_flush_interval(),
        );
        let usage = usage::UsageTracker::new(repository.clone());
        let allocation = allocation::AllocationEngine::new(
            repository.clone(),
            usage.clone(),
            transactions.clone(),
            events.clone(),
        );
        let conflicts =
            conflicts::ConflictScanner::new(repository.clone(), allocation.clone(), events.clone());
        let equipment = equipment::EquipmentService::new(
            repository,
            allocation.clone(),
            transactions.clone(),
            events.clone(),
        );

        Ok(Self {
            events,
            transactions,
            queue,
            usage,
            allocation,
            conflicts,
            equipment,
        })
    }
}
