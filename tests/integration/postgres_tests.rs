//! Postgres repository tests
//!
//! Need a database with the Rigtrack schema at `DATABASE_URL`.

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

use rigtrack::{
    models::{enums::EquipmentStatus, equipment::CreateEquipmentType},
    repository::{EquipmentRepository, NewEquipment, PgRepository, Repository},
    services::allocation::{AllocateRequest, ReleaseOptions},
    AppError,
};

use crate::common::engine_config;

async fn connect() -> Repository {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("Failed to connect to database");
    Arc::new(PgRepository::new(pool))
}

#[tokio::test]
#[ignore] // Run with: cargo test -- --ignored
async fn test_equipment_lifecycle() {
    let repo = connect().await;
    let suffix = uuid::Uuid::new_v4().simple().to_string();

    let equipment_type = repo
        .type_create(&CreateEquipmentType {
            name: format!("Test type {}", suffix),
            category: "test".into(),
            individually_tracked: true,
            default_code_prefix: Some("TT".into()),
        })
        .await
        .expect("type create");

    let unit = repo
        .equipment_create(&NewEquipment {
            code: format!("TT{}", &suffix[..8]),
            type_id: equipment_type.id.clone(),
            location_id: None,
            serial_number: None,
            notes: Some("integration".into()),
        })
        .await
        .expect("equipment create");
    assert_eq!(unit.status, EquipmentStatus::Available);

    let fetched = repo.equipment_get(&unit.id).await.expect("equipment get");
    assert_eq!(fetched.code, unit.code);

    repo.equipment_delete(&unit.id).await.expect("equipment delete");
    assert!(matches!(
        repo.equipment_get(&unit.id).await,
        Err(AppError::NotFound(_))
    ));
    repo.type_delete(&equipment_type.id).await.expect("type delete");
}

#[tokio::test]
#[ignore]
async fn test_allocation_round_trip() {
    let repo = connect().await;
    let jobs = repo.job_list().await.expect("job list");
    let Some(job) = jobs.into_iter().find(|j| j.is_live()) else {
        return;
    };
    let units = repo.equipment_list().await.expect("equipment list");
    let Some(unit) = units
        .into_iter()
        .find(|u| u.status == EquipmentStatus::Available && u.job_id.is_none())
    else {
        return;
    };

    let services = rigtrack::services::Services::new(repo.clone(), &engine_config())
        .await
        .expect("services");
    let allocated = services
        .allocation
        .allocate(AllocateRequest::new(unit.id.clone(), job.id.clone()))
        .await
        .expect("allocate");
    assert_eq!(allocated.equipment.status, EquipmentStatus::Deployed);

    let released = services
        .allocation
        .release(&unit.id, ReleaseOptions::return_to(unit.location_id.clone()))
        .await
        .expect("release");
    assert_eq!(released.equipment.status, EquipmentStatus::Available);
    assert!(released.session.and_then(|s| s.hours_used).unwrap_or(0.0) >= 0.0);
}
