//! Shared fixtures: an in-memory yard with two jobs and a few units

use chrono::Utc;
use std::sync::Arc;

use rigtrack::{
    config::EngineConfig,
    models::{
        enums::{EquipmentStatus, LocationKind},
        equipment::{EquipmentType, EquipmentUnit},
        job::{Job, StorageLocation},
    },
    repository::MemoryRepository,
    services::Services,
};

pub const YARD: &str = "loc-yard";
pub const JOB_A: &str = "job-a";
pub const JOB_B: &str = "job-b";
pub const SPLITTER: &str = "type-ss";

pub fn unit(id: &str, code: &str, status: EquipmentStatus, job: Option<&str>) -> EquipmentUnit {
    EquipmentUnit {
        id: id.into(),
        code: code.into(),
        type_id: SPLITTER.into(),
        location_id: Some(YARD.into()),
        location_kind: if job.is_some() {
            LocationKind::Job
        } else {
            LocationKind::Storage
        },
        status,
        job_id: job.map(String::from),
        serial_number: None,
        red_tag_reason: None,
        red_tag_severity: None,
        notes: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn job(id: &str, name: &str) -> Job {
    Job {
        id: id.into(),
        name: name.into(),
        client: Some("Permian Operators".into()),
        location: None,
        diagram: None,
        created_at: Utc::now(),
        deleted_at: None,
    }
}

pub struct Yard {
    pub repo: Arc<MemoryRepository>,
    pub services: Services,
}

/// Fast engine settings so failing paths do not sleep for seconds
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        operation_timeout_ms: 2_000,
        retries: 1,
        backoff_base_ms: 1,
        queue_batch_size: 10,
        queue_flush_interval_ms: 10,
        scan_interval_secs: 3_600,
        auto_resolve: false,
    }
}

pub async fn yard() -> Yard {
    let repo = Arc::new(MemoryRepository::new());
    repo.insert_location(StorageLocation {
        id: YARD.into(),
        name: "Main yard".into(),
        address: None,
        is_default: true,
    })
    .await;
    repo.insert_type(EquipmentType {
        id: SPLITTER.into(),
        name: "Shale shaker".into(),
        category: "solids-control".into(),
        individually_tracked: true,
        default_code_prefix: Some("SS".into()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    })
    .await;
    repo.insert_job(job(JOB_A, "North pad")).await;
    repo.insert_job(job(JOB_B, "South pad")).await;

    let services = Services::new(repo.clone(), &engine_config())
        .await
        .expect("services");
    Yard { repo, services }
}
