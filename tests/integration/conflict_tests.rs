//! Conflict scanning and repair against the in-memory repository

use chrono::{Duration, Utc};
use serde_json::json;
use std::time::Duration as StdDuration;

use rigtrack::{
    models::{
        conflict::{ConflictKind, Resolution},
        enums::{EquipmentStatus, SessionStatus, Severity},
        usage::UsageSession,
    },
    repository::EquipmentRepository,
    services::{
        allocation::AllocateRequest,
        conflicts::run_conflict_monitor,
        events::{DomainEvent, EventFilter, EventKind},
    },
    AppError,
};

use crate::common::{job, unit, yard, JOB_A, JOB_B};

fn active_session(id: &str, equipment_id: &str, job_id: &str) -> UsageSession {
    UsageSession {
        id: id.into(),
        equipment_id: equipment_id.into(),
        job_id: job_id.into(),
        job_name: None,
        start_time: Utc::now() - Duration::hours(3),
        end_time: None,
        hours_used: None,
        status: SessionStatus::Active,
        notes: None,
    }
}

#[tokio::test]
async fn shared_code_on_two_jobs_is_detected_and_resolved() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Deployed, Some(JOB_A)))
        .await;
    yard.repo
        .insert_unit(unit("eq-1-legacy", "SS001", EquipmentStatus::Deployed, Some(JOB_B)))
        .await;
    yard.repo.insert_session(active_session("s-a", "eq-1", JOB_A)).await;
    yard.repo
        .insert_session(active_session("s-b", "eq-1-legacy", JOB_B))
        .await;

    let scanner = &yard.services.conflicts;
    let conflicts = scanner.scan().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::MultipleJobAllocation);
    assert_eq!(conflict.severity, Severity::High);
    assert_eq!(conflict.job_ids, vec![JOB_A.to_string(), JOB_B.to_string()]);

    // Repair alone cannot pick a winner
    assert!(matches!(
        scanner.resolve(conflict, Resolution::Repair).await,
        Err(AppError::Validation(_))
    ));

    let outcome = scanner
        .resolve(
            conflict,
            Resolution::KeepCurrentJob {
                job_id: JOB_A.into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.updated_equipment, vec!["eq-1-legacy".to_string()]);
    assert!(!outcome.stale);

    let records = yard.repo.equipment_list_by_code("SS001").await.unwrap();
    let deployed: Vec<_> = records.iter().filter(|u| u.is_deployed()).collect();
    assert_eq!(deployed.len(), 1);
    assert_eq!(deployed[0].job_id.as_deref(), Some(JOB_A));

    let legacy_sessions = yard.repo.session_list("eq-1-legacy").await.unwrap();
    assert_eq!(legacy_sessions[0].status, SessionStatus::Completed);

    let after = scanner.scan().await.unwrap();
    assert!(after.iter().all(|c| c.equipment_code != "SS001"));

    // Resolving the same conflict again finds nothing to do
    let again = scanner
        .resolve(
            conflict,
            Resolution::KeepCurrentJob {
                job_id: JOB_A.into(),
            },
        )
        .await
        .unwrap();
    assert!(again.stale);
}

#[tokio::test]
async fn return_all_releases_every_record() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Deployed, Some(JOB_A)))
        .await;
    yard.repo
        .insert_unit(unit("eq-2", "SS001", EquipmentStatus::Deployed, Some(JOB_B)))
        .await;

    let conflicts = yard.services.conflicts.scan().await.unwrap();
    let outcome = yard
        .services
        .conflicts
        .resolve(&conflicts[0], Resolution::ReturnAll)
        .await
        .unwrap();

    assert_eq!(outcome.updated_equipment.len(), 2);
    for unit in yard.repo.equipment_list_by_code("SS001").await.unwrap() {
        assert_eq!(unit.status, EquipmentStatus::Available);
        assert_eq!(unit.job_id, None);
    }
}

#[tokio::test]
async fn auto_resolve_repairs_deterministic_conflicts_only() {
    let yard = yard().await;
    // orphaned job reference
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Deployed, Some("job-gone")))
        .await;
    // orphan deployed
    yard.repo
        .insert_unit(unit("eq-2", "SS002", EquipmentStatus::Deployed, None))
        .await;
    // job reference without deployment
    yard.repo
        .insert_unit(unit("eq-3", "SS003", EquipmentStatus::Available, Some(JOB_A)))
        .await;
    // needs a human
    yard.repo
        .insert_unit(unit("eq-4", "SS004", EquipmentStatus::Deployed, Some(JOB_A)))
        .await;
    yard.repo
        .insert_unit(unit("eq-5", "SS004", EquipmentStatus::Deployed, Some(JOB_B)))
        .await;

    let report = yard.services.conflicts.auto_resolve().await.unwrap();

    assert_eq!(report.skipped, vec!["multiple_job_allocation:SS004".to_string()]);
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.resolved.len(), 3);

    let eq1 = yard.repo.equipment_get("eq-1").await.unwrap();
    assert_eq!((eq1.status, eq1.job_id), (EquipmentStatus::Available, None));
    let eq2 = yard.repo.equipment_get("eq-2").await.unwrap();
    assert_eq!((eq2.status, eq2.job_id), (EquipmentStatus::Available, None));
    let eq3 = yard.repo.equipment_get("eq-3").await.unwrap();
    assert_eq!(eq3.status, EquipmentStatus::Deployed);
    assert_eq!(eq3.job_id.as_deref(), Some(JOB_A));
    assert!(yard.repo.session_get_active("eq-3").await.unwrap().is_some());

    let remaining = yard.services.conflicts.scan().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind, ConflictKind::MultipleJobAllocation);
}

#[tokio::test]
async fn overlapping_conflicts_on_one_unit_resolve_in_order() {
    let yard = yard().await;
    yard.repo.insert_job(job("job-closed", "Closed pad")).await;
    yard.repo.delete_job("job-closed").await;
    yard.repo
        .insert_unit(unit("eq-7", "SS007", EquipmentStatus::Available, Some("job-closed")))
        .await;

    let ids: Vec<_> = yard
        .services
        .conflicts
        .scan()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(
        ids,
        vec![
            "allocation_conflict:eq-7".to_string(),
            "status_mismatch:eq-7".to_string()
        ]
    );

    let report = yard.services.conflicts.auto_resolve().await.unwrap();
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.resolved.len(), 2);

    let first = &report.resolved[0];
    assert_eq!(first.conflict_id, "allocation_conflict:eq-7");
    assert!(!first.stale);
    assert_eq!(first.updated_equipment, vec!["eq-7".to_string()]);
    // The first repair already fixed the status mismatch
    let second = &report.resolved[1];
    assert_eq!(second.conflict_id, "status_mismatch:eq-7");
    assert!(second.stale);
    assert!(second.updated_equipment.is_empty());

    let eq7 = yard.repo.equipment_get("eq-7").await.unwrap();
    assert_eq!((eq7.status, eq7.job_id), (EquipmentStatus::Available, None));
    assert!(yard.services.conflicts.scan().await.unwrap().is_empty());
}

#[tokio::test]
async fn retired_units_only_lose_their_job_reference() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Retired, Some(JOB_A)))
        .await;

    let report = yard.services.conflicts.auto_resolve().await.unwrap();
    assert_eq!(report.resolved.len(), 1);

    let eq1 = yard.repo.equipment_get("eq-1").await.unwrap();
    assert_eq!(eq1.status, EquipmentStatus::Retired);
    assert_eq!(eq1.job_id, None);
}

#[tokio::test]
async fn job_scoped_scan_includes_diagram_codes() {
    let yard = yard().await;
    let mut pad = job("job-c", "East pad");
    pad.diagram = Some(json!({
        "nodes": [{ "id": "n1", "data": { "equipmentCode": "SS009" } }],
        "edges": []
    }));
    yard.repo.insert_job(pad).await;
    yard.repo
        .insert_unit(unit("eq-9", "SS009", EquipmentStatus::Deployed, None))
        .await;
    yard.repo
        .insert_unit(unit("eq-3", "SS003", EquipmentStatus::Available, Some(JOB_A)))
        .await;

    let scoped = yard.services.conflicts.scan_for_job("job-c").await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].equipment_code, "SS009");

    let scoped_a = yard.services.conflicts.scan_for_job(JOB_A).await.unwrap();
    assert_eq!(scoped_a.len(), 1);
    assert_eq!(scoped_a[0].equipment_code, "SS003");
}

#[tokio::test]
async fn monitor_reports_conflicts_after_allocation() {
    let yard = yard().await;
    yard.repo
        .insert_unit(unit("eq-1", "SS001", EquipmentStatus::Deployed, Some(JOB_B)))
        .await;
    yard.repo
        .insert_unit(unit("eq-2", "SS001", EquipmentStatus::Available, None))
        .await;

    let mut detected = yard
        .services
        .events
        .subscribe(EventFilter::kind(EventKind::ConflictsDetected));
    let monitor = tokio::spawn(run_conflict_monitor(
        yard.services.conflicts.clone(),
        StdDuration::from_secs(3_600),
        false,
    ));
    // Let the first tick pass on a clean yard
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    yard.services
        .allocation
        .allocate(AllocateRequest::new("eq-2", JOB_A))
        .await
        .unwrap();

    let event = tokio::time::timeout(StdDuration::from_secs(2), detected.recv())
        .await
        .expect("no conflict report")
        .unwrap();
    monitor.abort();

    match event {
        DomainEvent::ConflictsDetected { count, conflict_ids } => {
            assert_eq!(count, 1);
            assert_eq!(conflict_ids, vec!["multiple_job_allocation:SS001".to_string()]);
        }
        other => panic!("unexpected event {:?}", other),
    }
}
