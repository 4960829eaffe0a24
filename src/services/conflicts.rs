//! Conflict scanner and resolver.
//!
//! Detection is a pure function over a snapshot of units and jobs. Repairs
//! re-read the unit first; the repository may have moved on since the scan.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use super::{
    allocation::{AllocationEngine, ReleaseOptions},
    events::{DomainEvent, EventBus, EventFilter, EventKind},
};
use crate::{
    error::{AppError, AppResult},
    models::{
        conflict::{AllocationConflict, AutoResolveReport, ConflictKind, Resolution, ResolutionOutcome},
        enums::{EquipmentStatus, Severity},
        equipment::EquipmentUnit,
        job::Job,
    },
    repository::Repository,
};

fn conflict_id(kind: ConflictKind, key: &str) -> String {
    format!("{}:{}", kind, key)
}

/// Find every anomaly in a snapshot. Output is ordered by kind, then
/// equipment code, then id.
pub fn detect_conflicts(units: &[EquipmentUnit], jobs: &[Job]) -> Vec<AllocationConflict> {
    let live_jobs: HashSet<&str> = jobs
        .iter()
        .filter(|job| job.is_live())
        .map(|job| job.id.as_str())
        .collect();

    let mut conflicts = Vec::new();

    let mut by_code: BTreeMap<&str, Vec<&EquipmentUnit>> = BTreeMap::new();
    for unit in units {
        by_code.entry(unit.code.as_str()).or_default().push(unit);
    }
    for (code, records) in &by_code {
        let deployed_jobs: BTreeSet<&str> = records
            .iter()
            .filter(|unit| unit.is_deployed())
            .filter_map(|unit| unit.job_id.as_deref())
            .collect();
        if deployed_jobs.len() > 1 {
            let kind = ConflictKind::MultipleJobAllocation;
            let first = records
                .iter()
                .find(|unit| unit.is_deployed())
                .unwrap_or(&records[0]);
            let job_ids: Vec<String> = deployed_jobs.iter().map(|j| j.to_string()).collect();
            conflicts.push(AllocationConflict {
                id: conflict_id(kind, code),
                kind,
                equipment_id: first.id.clone(),
                equipment_code: code.to_string(),
                description: format!(
                    "Equipment {} is deployed to {} jobs: {}",
                    code,
                    job_ids.len(),
                    job_ids.join(", ")
                ),
                job_ids,
                severity: Severity::High,
            });
        }
    }

    for unit in units {
        match (&unit.job_id, unit.status) {
            (Some(job_id), status) if status != EquipmentStatus::Deployed => {
                let kind = ConflictKind::StatusMismatch;
                conflicts.push(AllocationConflict {
                    id: conflict_id(kind, &unit.id),
                    kind,
                    equipment_id: unit.id.clone(),
                    equipment_code: unit.code.clone(),
                    job_ids: vec![job_id.clone()],
                    severity: Severity::Medium,
                    description: format!(
                        "Equipment {} references job {} but is {}",
                        unit.code, job_id, status
                    ),
                });
            }
            (None, EquipmentStatus::Deployed) => {
                let kind = ConflictKind::StatusMismatch;
                conflicts.push(AllocationConflict {
                    id: conflict_id(kind, &unit.id),
                    kind,
                    equipment_id: unit.id.clone(),
                    equipment_code: unit.code.clone(),
                    job_ids: Vec::new(),
                    severity: Severity::Medium,
                    description: format!("Equipment {} is deployed without a job (orphan deployed)", unit.code),
                });
            }
            _ => {}
        }

        if let Some(job_id) = &unit.job_id {
            if !live_jobs.contains(job_id.as_str()) {
                let kind = ConflictKind::AllocationConflict;
                conflicts.push(AllocationConflict {
                    id: conflict_id(kind, &unit.id),
                    kind,
                    equipment_id: unit.id.clone(),
                    equipment_code: unit.code.clone(),
                    job_ids: vec![job_id.clone()],
                    severity: Severity::High,
                    description: format!(
                        "Equipment {} references missing or deleted job {} (orphaned job reference)",
                        unit.code, job_id
                    ),
                });
            }
        }
    }

    conflicts.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.equipment_code.cmp(&b.equipment_code))
            .then_with(|| a.id.cmp(&b.id))
    });
    conflicts
}

/// Keep the conflicts touching `job`: listed job ids, or equipment codes
/// drawn on the job's diagram.
pub fn filter_for_job(conflicts: Vec<AllocationConflict>, job: &Job) -> Vec<AllocationConflict> {
    let diagram_codes = job.diagram_equipment_codes();
    conflicts
        .into_iter()
        .filter(|c| c.job_ids.iter().any(|j| *j == job.id) || diagram_codes.contains(&c.equipment_code))
        .collect()
}

#[derive(Clone)]
pub struct ConflictScanner {
    repository: Repository,
    allocation: AllocationEngine,
    events: EventBus,
}

impl ConflictScanner {
    pub fn new(repository: Repository, allocation: AllocationEngine, events: EventBus) -> Self {
        Self {
            repository,
            allocation,
            events,
        }
    }

    pub async fn scan(&self) -> AppResult<Vec<AllocationConflict>> {
        let units = self.repository.equipment_list().await?;
        let jobs = self.repository.job_list().await?;
        let conflicts = detect_conflicts(&units, &jobs);
        tracing::debug!("Scanned {} units: {} conflicts", units.len(), conflicts.len());
        Ok(conflicts)
    }

    /// Scan restricted to one job
    pub async fn scan_for_job(&self, job_id: &str) -> AppResult<Vec<AllocationConflict>> {
        let job = self.repository.job_get(job_id).await?;
        Ok(filter_for_job(self.scan().await?, &job))
    }

    pub async fn resolve(
        &self,
        conflict: &AllocationConflict,
        resolution: Resolution,
    ) -> AppResult<ResolutionOutcome> {
        let outcome = match (conflict.kind, resolution) {
            (ConflictKind::MultipleJobAllocation, Resolution::KeepCurrentJob { job_id }) => {
                self.return_duplicates(conflict, Some(&job_id)).await?
            }
            (ConflictKind::MultipleJobAllocation, Resolution::ReturnAll) => {
                self.return_duplicates(conflict, None).await?
            }
            (ConflictKind::MultipleJobAllocation, Resolution::Repair) => {
                return Err(AppError::Validation(format!(
                    "Conflict {} needs keep_current_job or return_all",
                    conflict.id
                )))
            }
            (kind, Resolution::Repair) => self.repair(conflict, kind).await?,
            (kind, other) => {
                return Err(AppError::Validation(format!(
                    "Resolution {:?} does not apply to {}",
                    other, kind
                )))
            }
        };

        if outcome.stale {
            tracing::info!("Conflict {} already resolved", conflict.id);
        } else {
            tracing::info!(
                "Conflict {} resolved, {} units updated",
                conflict.id,
                outcome.updated_equipment.len()
            );
        }
        Ok(outcome)
    }

    /// Release deployed records of the conflict's code, except the kept job's
    async fn return_duplicates(
        &self,
        conflict: &AllocationConflict,
        keep_job: Option<&str>,
    ) -> AppResult<ResolutionOutcome> {
        let records = self
            .repository
            .equipment_list_by_code(&conflict.equipment_code)
            .await?;
        let deployed: Vec<&EquipmentUnit> = records.iter().filter(|u| u.is_deployed()).collect();
        let jobs: BTreeSet<&str> = deployed.iter().filter_map(|u| u.job_id.as_deref()).collect();

        let mut outcome = ResolutionOutcome {
            conflict_id: conflict.id.clone(),
            ..Default::default()
        };
        if jobs.len() < 2 && keep_job.is_some() {
            outcome.stale = true;
            return Ok(outcome);
        }
        if let Some(keep) = keep_job {
            if !jobs.contains(keep) {
                return Err(AppError::Validation(format!(
                    "Equipment {} is not deployed to job {}",
                    conflict.equipment_code, keep
                )));
            }
        }

        for unit in deployed {
            if keep_job.is_some() && unit.job_id.as_deref() == keep_job {
                continue;
            }
            let released = self
                .allocation
                .release(&unit.id, ReleaseOptions::return_to(None))
                .await?;
            outcome.updated_equipment.push(released.equipment.id);
        }
        outcome.stale = outcome.updated_equipment.is_empty();
        Ok(outcome)
    }

    /// Deterministic fix for `status_mismatch` and `allocation_conflict`
    async fn repair(&self, conflict: &AllocationConflict, kind: ConflictKind) -> AppResult<ResolutionOutcome> {
        let unit = self.repository.equipment_get(&conflict.equipment_id).await?;
        let job_is_live = match unit.job_id.as_deref() {
            Some(job_id) => match self.repository.job_get(job_id).await {
                Ok(job) => job.is_live(),
                Err(AppError::NotFound(_)) => false,
                Err(e) => return Err(e),
            },
            None => false,
        };

        // Retired units never leave retired; only the reference is dropped
        let release_status = if unit.status == EquipmentStatus::Retired {
            EquipmentStatus::Retired
        } else {
            EquipmentStatus::Available
        };

        let fix = match kind {
            ConflictKind::AllocationConflict if unit.job_id.is_some() && !job_is_live => {
                Some((release_status, None, "Orphaned job reference cleared"))
            }
            ConflictKind::StatusMismatch => match (&unit.job_id, unit.status) {
                (Some(_), EquipmentStatus::Retired) => {
                    Some((EquipmentStatus::Retired, None, "Job reference cleared on retired unit"))
                }
                (Some(job_id), status) if status != EquipmentStatus::Deployed => {
                    if job_is_live {
                        Some((EquipmentStatus::Deployed, Some(job_id.clone()), "Status aligned with job assignment"))
                    } else {
                        Some((release_status, None, "Orphaned job reference cleared"))
                    }
                }
                (None, EquipmentStatus::Deployed) => {
                    Some((EquipmentStatus::Available, None, "Orphan deployed unit returned to available"))
                }
                _ => None,
            },
            _ => None,
        };

        let mut outcome = ResolutionOutcome {
            conflict_id: conflict.id.clone(),
            ..Default::default()
        };
        match fix {
            Some((status, job_id, reason)) => {
                let updated = self.allocation.force_status(&unit, status, job_id, reason).await?;
                outcome.updated_equipment.push(updated.id);
            }
            None => outcome.stale = true,
        }
        Ok(outcome)
    }

    /// Apply every deterministic repair. `multiple_job_allocation` is always
    /// left for a human.
    pub async fn auto_resolve(&self) -> AppResult<AutoResolveReport> {
        let conflicts = self.scan().await?;
        let mut report = AutoResolveReport::default();

        for conflict in &conflicts {
            if conflict.kind == ConflictKind::MultipleJobAllocation {
                report.skipped.push(conflict.id.clone());
                continue;
            }
            match self.resolve(conflict, Resolution::Repair).await {
                Ok(outcome) => report.resolved.push(outcome),
                Err(e) => {
                    tracing::warn!("Auto-resolve of {} failed: {}", conflict.id, e);
                    report.failed.push((conflict.id.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            "Auto-resolve: {} resolved, {} skipped, {} failed",
            report.resolved.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn scan_and_report(&self, auto_resolve: bool) {
        let conflicts = match self.scan().await {
            Ok(conflicts) => conflicts,
            Err(e) => {
                tracing::warn!("Conflict scan failed: {}", e);
                return;
            }
        };
        if conflicts.is_empty() {
            return;
        }

        tracing::warn!("{} allocation conflicts detected", conflicts.len());
        self.events.publish(DomainEvent::ConflictsDetected {
            count: conflicts.len(),
            conflict_ids: conflicts.iter().map(|c| c.id.clone()).collect(),
        });

        if auto_resolve {
            if let Err(e) = self.auto_resolve().await {
                tracing::warn!("Auto-resolve failed: {}", e);
            }
        }
    }
}

/// Background task: scans on every tick and after each allocation or
/// return. Advisory only; never blocks the calls that trigger it.
pub async fn run_conflict_monitor(scanner: ConflictScanner, interval: Duration, auto_resolve: bool) {
    let mut ticker = tokio::time::interval(interval);
    let mut triggers = scanner.events.subscribe(EventFilter::Kinds(vec![
        EventKind::EquipmentAllocated,
        EventKind::EquipmentReturned,
    ]));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            event = triggers.recv() => {
                if event.is_none() {
                    tracing::info!("Event bus closed, stopping conflict monitor");
                    return;
                }
            }
        }
        scanner.scan_and_report(auto_resolve).await;
    }
}
