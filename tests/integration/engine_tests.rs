//! Allocation, usage and catalog flows against the in-memory repository

use chrono::{Duration, Utc};
use tokio_test::{assert_err, assert_ok};

use rigtrack::{
    models::{
        enums::{EquipmentStatus, SessionStatus, Severity},
        equipment::{CreateEquipment, CreateEquipmentType},
    },
    repository::EquipmentRepository,
    services::{
        allocation::{AllocateRequest, ReleaseOptions},
        events::{DomainEvent, EventFilter, EventKind, ReturnKind},
    },
    AppError,
};

use crate::common::{unit, yard, JOB_A, JOB_B, SPLITTER, YARD};

/// `deployed` iff the job reference resolves to a live job
async fn assert_deployment_invariant(repo: &dyn EquipmentRepository) {
    let jobs = repo.job_list().await.unwrap();
    for unit in repo.equipment_list().await.unwrap() {
        let live_job = unit
            .job_id
            .as_deref()
            .map(|id| jobs.iter().any(|j| j.id == id && j.is_live()))
            .unwrap_or(false);
        assert_eq!(unit.is_deployed(), live_job, "unit {} breaks invariant", unit.code);
    }
}

#[tokio::test]
async fn allocate_then_return_round_trip() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;
    let mut events = yard.services.events.subscribe(EventFilter::Kinds(vec![
        EventKind::EquipmentAllocated,
        EventKind::EquipmentReturned,
    ]));

    let allocated = yard
        .services
        .allocation
        .allocate(AllocateRequest::new("eq-1", JOB_A))
        .await
        .unwrap();
    assert!(!allocated.already_allocated);
    assert_eq!(allocated.equipment.status, EquipmentStatus::Deployed);
    assert_eq!(allocated.equipment.job_id.as_deref(), Some(JOB_A));
    let session = allocated.session.unwrap();
    assert_eq!(session.job_name.as_deref(), Some("North pad"));
    assert_deployment_invariant(yard.repo.as_ref()).await;

    let released = yard
        .services
        .allocation
        .release("eq-1", ReleaseOptions::return_to(None))
        .await
        .unwrap();
    assert_eq!(released.equipment.status, EquipmentStatus::Available);
    assert_eq!(released.equipment.job_id, None);
    assert_eq!(released.equipment.location_id.as_deref(), Some(YARD));
    let closed = released.session.unwrap();
    assert_eq!(closed.id, session.id);
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(closed.hours_used.unwrap() >= 0.0);
    assert_deployment_invariant(yard.repo.as_ref()).await;

    assert!(matches!(
        events.recv().await,
        Some(DomainEvent::EquipmentAllocated { ref job_id, .. }) if job_id == JOB_A
    ));
    assert!(matches!(
        events.recv().await,
        Some(DomainEvent::EquipmentReturned { kind: ReturnKind::Returned, .. })
    ));

    let history = yard.repo.history_list("eq-1").await.unwrap();
    let path: Vec<_> = history.iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(
        path,
        vec![
            (EquipmentStatus::Available, EquipmentStatus::Deployed),
            (EquipmentStatus::Deployed, EquipmentStatus::Available),
        ]
    );
}

#[tokio::test]
async fn allocating_twice_to_the_same_job_is_idempotent() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;

    let first = assert_ok!(
        yard.services
            .allocation
            .allocate(AllocateRequest::new("eq-1", JOB_A))
            .await
    );
    let second = assert_ok!(
        yard.services
            .allocation
            .allocate(AllocateRequest::new("eq-1", JOB_A))
            .await
    );

    assert!(second.already_allocated);
    assert_eq!(second.session.unwrap().id, first.session.unwrap().id);
    assert_eq!(yard.repo.session_list("eq-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn allocation_is_refused_for_unavailable_units_and_dead_jobs() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Maintenance, None))
        .await;
    yard.repo
        .insert_unit(unit("eq-2", "SS002", EquipmentStatus::Deployed, Some(JOB_B)))
        .await;
    yard.repo
        .insert_unit(unit("eq-3", "SS003", EquipmentStatus::Available, None))
        .await;
    yard.repo.delete_job(JOB_B).await;

    let allocation = &yard.services.allocation;
    assert!(matches!(
        allocation.allocate(AllocateRequest::new("eq-1", JOB_A)).await,
        Err(AppError::InvalidTransition {
            from: EquipmentStatus::Maintenance,
            to: EquipmentStatus::Deployed
        })
    ));
    assert!(matches!(
        allocation.allocate(AllocateRequest::new("eq-2", JOB_A)).await,
        Err(AppError::Availability(_))
    ));
    assert!(matches!(
        allocation.allocate(AllocateRequest::new("eq-3", JOB_B)).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        allocation.allocate(AllocateRequest::new("missing", JOB_A)).await,
        Err(AppError::NotFound(_))
    ));
    let err = assert_err!(allocation.allocate(AllocateRequest::new("", JOB_A)).await);
    assert!(matches!(err, AppError::Validation(_)));
    assert!(yard.repo.session_list("eq-3").await.unwrap().is_empty());
}

#[tokio::test]
async fn backdated_allocation_counts_live_hours() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;

    let mut request = AllocateRequest::new("eq-1", JOB_A);
    request.start_time = Some(Utc::now() - Duration::hours(5));
    yard.services.allocation.allocate(request).await.unwrap();

    let total = yard.services.usage.total_hours("eq-1").await.unwrap();
    assert!((total - 5.0).abs() < 0.11, "total was {}", total);

    let stats = yard.services.usage.stats("eq-1").await.unwrap();
    assert!(stats.active_session);
    assert_eq!(stats.total_sessions, 1);
    assert!(stats.utilization_rate > 99.0);
}

#[tokio::test]
async fn red_tag_release_records_failure() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;
    let mut request = AllocateRequest::new("eq-1", JOB_A);
    request.start_time = Some(Utc::now() - Duration::hours(4));
    yard.services.allocation.allocate(request).await.unwrap();

    let released = yard
        .services
        .allocation
        .release("eq-1", ReleaseOptions::red_tag("cracked screen frame", Severity::High))
        .await
        .unwrap();

    assert_eq!(released.equipment.status, EquipmentStatus::RedTagged);
    assert_eq!(released.equipment.job_id, None);
    assert_eq!(released.equipment.red_tag_severity, Some(Severity::High));
    let tag = released.red_tag.unwrap();
    assert_eq!(tag.job_at_failure.as_deref(), Some(JOB_A));
    assert!((tag.hours_at_failure - 4.0).abs() < 0.11);
    assert!(released
        .session
        .unwrap()
        .notes
        .unwrap()
        .contains("cracked screen frame"));

    // Red-tagged units must go back to available before redeploying
    assert!(matches!(
        yard.services.allocation.allocate(AllocateRequest::new("eq-1", JOB_A)).await,
        Err(AppError::InvalidTransition { .. })
    ));
    assert_eq!(yard.services.usage.stats("eq-1").await.unwrap().red_tag_count, 1);

    // Clearing the tag drops the failure details from the unit
    let repaired = yard
        .services
        .equipment
        .update_status("eq-1", "available")
        .await
        .unwrap();
    assert_eq!(repaired.status, EquipmentStatus::Available);
    assert_eq!(repaired.red_tag_reason, None);
    assert_eq!(repaired.red_tag_severity, None);
    assert_eq!(yard.services.usage.stats("eq-1").await.unwrap().red_tag_count, 1);
}

#[tokio::test]
async fn stale_session_is_interrupted_before_allocation() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;
    yard.services
        .usage
        .start_session("eq-1", JOB_B, Some(Utc::now() - Duration::hours(1)))
        .await
        .unwrap();

    yard.services
        .allocation
        .allocate(AllocateRequest::new("eq-1", JOB_A))
        .await
        .unwrap();

    let sessions = yard.repo.session_list("eq-1").await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].status, SessionStatus::Interrupted);
    assert_eq!(sessions[1].status, SessionStatus::Active);
    assert_eq!(sessions[1].job_id, JOB_A);
}

#[tokio::test]
async fn operator_status_change_closes_session() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;
    yard.services
        .allocation
        .allocate(AllocateRequest::new("eq-1", JOB_A))
        .await
        .unwrap();
    let mut changes = yard
        .services
        .events
        .subscribe(EventFilter::kind(EventKind::EquipmentStatusChange));

    let updated = yard
        .services
        .equipment
        .update_status("eq-1", "repair")
        .await
        .unwrap();

    assert_eq!(updated.status, EquipmentStatus::Maintenance);
    assert_eq!(updated.job_id, None);
    assert!(yard.repo.session_get_active("eq-1").await.unwrap().is_none());
    assert_eq!(
        changes.recv().await,
        Some(DomainEvent::EquipmentStatusChange {
            equipment_id: "eq-1".into(),
            from: EquipmentStatus::Deployed,
            to: EquipmentStatus::Maintenance,
        })
    );
    assert_deployment_invariant(yard.repo.as_ref()).await;

    assert!(matches!(
        yard.services.equipment.update_status("eq-1", "in use").await,
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn bulk_status_update_reports_partial_success() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;
    yard.repo
        .insert_unit(unit("eq-2", "SS002", EquipmentStatus::Retired, None))
        .await;
    yard.repo
        .insert_unit(unit("eq-3", "SS003", EquipmentStatus::Available, None))
        .await;
    let mut bulk = yard
        .services
        .events
        .subscribe(EventFilter::kind(EventKind::BulkEquipmentStatusUpdated));

    let ids: Vec<String> = ["eq-1", "eq-2", "eq-3"].iter().map(|s| s.to_string()).collect();
    let report = yard
        .services
        .equipment
        .bulk_update_status(&ids, "maintenance")
        .await
        .unwrap();

    assert_eq!(report.updated, vec!["eq-1".to_string(), "eq-3".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "eq-2");
    assert_eq!(
        yard.repo.equipment_get("eq-2").await.unwrap().status,
        EquipmentStatus::Retired
    );
    assert_eq!(
        bulk.recv().await,
        Some(DomainEvent::BulkEquipmentStatusUpdated {
            equipment_ids: vec!["eq-1".into(), "eq-3".into()],
            status: EquipmentStatus::Maintenance,
        })
    );
}

#[tokio::test]
async fn catalog_generates_codes_and_guards_types() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS004", EquipmentStatus::Available, None))
        .await;
    let equipment = &yard.services.equipment;

    let created = equipment
        .create(&CreateEquipment {
            code: None,
            type_id: SPLITTER.into(),
            location_id: Some(YARD.into()),
            serial_number: Some("SN-881".into()),
            notes: None,
        })
        .await
        .unwrap();
    assert_eq!(created.code, "SS005");
    assert_eq!(created.status, EquipmentStatus::Available);

    let duplicate = equipment
        .create(&CreateEquipment {
            code: Some("SS005".into()),
            type_id: SPLITTER.into(),
            location_id: None,
            serial_number: None,
            notes: None,
        })
        .await;
    assert!(matches!(duplicate, Err(AppError::Conflict(_))));

    assert!(matches!(
        equipment.delete_type(SPLITTER).await,
        Err(AppError::Conflict(_))
    ));

    let mut types = yard
        .services
        .events
        .subscribe(EventFilter::Kinds(vec![
            EventKind::EquipmentTypeCreated,
            EventKind::EquipmentTypeDeleted,
        ]));
    let pump = equipment
        .create_type(&CreateEquipmentType {
            name: "Centrifugal pump".into(),
            category: "pumps".into(),
            individually_tracked: true,
            default_code_prefix: Some("CP".into()),
        })
        .await
        .unwrap();
    equipment.delete_type(&pump.id).await.unwrap();

    assert_eq!(types.recv().await.unwrap().kind(), EventKind::EquipmentTypeCreated);
    assert_eq!(
        types.recv().await,
        Some(DomainEvent::EquipmentTypeDeleted { type_id: pump.id })
    );
}

#[tokio::test]
async fn queued_operations_resolve_through_the_worker() {
    use rigtrack::services::transactions::{Operation, OperationStatus};

    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Available, None))
        .await;

    let repo = yard.repo.clone();
    let handle = yard
        .services
        .queue
        .queue_operation(Operation::new("touch-notes", move || {
            let repo = repo.clone();
            async move {
                let patch = rigtrack::models::equipment::EquipmentPatch {
                    notes: Some(Some("checked at yard".into())),
                    ..Default::default()
                };
                let unit = repo.equipment_update("eq-1", &patch).await?;
                Ok::<_, AppError>(serde_json::json!(unit.id))
            }
        }))
        .await
        .unwrap();

    let outcome = handle.outcome().await.unwrap();
    assert_eq!(outcome.status, OperationStatus::Succeeded);
    assert_eq!(
        yard.repo.equipment_get("eq-1").await.unwrap().notes.as_deref(),
        Some("checked at yard")
    );
}
