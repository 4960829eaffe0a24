//! Usage sessions, hours and utilization statistics.
//!
//! The tracker never touches equipment status; callers pair `red_tag` with
//! the status update themselves.

use chrono::{DateTime, Duration, Utc};

use crate::{
    error::{AppError, AppResult},
    models::{
        enums::{EquipmentStatus, SessionStatus, Severity},
        equipment::StatusChange,
        usage::{NewRedTagEvent, NewUsageSession, PeakUsage, RedTagEvent, UsageSession, UsageStats},
    },
    repository::Repository,
};

const HOURS_PER_DAY: f64 = 24.0;

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn as_hours(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 3_600_000.0
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Elapsed hours between two instants, rounded to one decimal, never negative
pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    round1(as_hours(end - start)).max(0.0)
}

/// Hours a session counts for at `now`: stored hours once closed, live
/// elapsed hours while active.
pub fn session_hours(session: &UsageSession, now: DateTime<Utc>) -> f64 {
    match session.status {
        SessionStatus::Active => hours_between(session.start_time, now),
        _ => session.hours_used.unwrap_or(0.0),
    }
}

fn append_note(existing: Option<String>, note: Option<String>) -> Option<String> {
    match (existing, note) {
        (Some(a), Some(b)) if !a.is_empty() => Some(format!("{}; {}", a, b)),
        (_, Some(b)) => Some(b),
        (a, None) => a,
    }
}

/// Close a session at `end` with the given terminal status
pub fn close_session(
    mut session: UsageSession,
    end: DateTime<Utc>,
    status: SessionStatus,
    notes: Option<String>,
) -> UsageSession {
    session.hours_used = Some(hours_between(session.start_time, end));
    session.end_time = Some(end);
    session.status = status;
    session.notes = append_note(session.notes.take(), notes);
    session
}

/// Interrupted sessions are kept for the record but never counted
fn counts_toward_usage(session: &UsageSession) -> bool {
    matches!(session.status, SessionStatus::Completed | SessionStatus::Active)
}

/// Sum of completed hours plus live hours of the active session
pub fn total_hours(sessions: &[UsageSession], now: DateTime<Utc>) -> f64 {
    let total: f64 = sessions
        .iter()
        .filter(|s| counts_toward_usage(s))
        .map(|s| session_hours(s, now))
        .sum();
    round1(total)
}

/// Hours spent in `maintenance`/`red-tagged` between `window_start` and `now`
fn out_of_service_hours(
    history: &[StatusChange],
    current: EquipmentStatus,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    if history.is_empty() {
        return if current.is_out_of_service() {
            as_hours(now - window_start)
        } else {
            0.0
        };
    }

    let mut down = 0.0;
    let mut cursor = window_start;
    let mut status = history[0].from;
    for change in history {
        let changed_at = change.changed_at.max(window_start);
        if status.is_out_of_service() && changed_at > cursor {
            down += as_hours(changed_at - cursor);
        }
        cursor = changed_at.max(cursor);
        status = change.to;
    }
    if status.is_out_of_service() && now > cursor {
        down += as_hours(now - cursor);
    }
    down
}

/// Utilization figures from a unit's sessions and status history
pub fn compute_stats(
    equipment_id: &str,
    sessions: &[UsageSession],
    history: &[StatusChange],
    current: EquipmentStatus,
    red_tag_count: usize,
    now: DateTime<Utc>,
) -> UsageStats {
    let total = total_hours(sessions, now);
    let first_use = sessions.iter().map(|s| s.start_time).min();

    let (utilization_rate, daily_average_hours) = match first_use {
        Some(first) => {
            let elapsed = as_hours(now - first);
            let utilization = if elapsed > 0.0 { total / elapsed * 100.0 } else { 0.0 };
            let days = (elapsed / HOURS_PER_DAY).max(1.0);
            (clamp_percent(utilization), total / days)
        }
        None => (0.0, 0.0),
    };

    let peak_usage = sessions
        .iter()
        .filter(|s| counts_toward_usage(s))
        .map(|s| (s, session_hours(s, now)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(s, hours)| PeakUsage {
            session_id: s.id.clone(),
            job_id: s.job_id.clone(),
            start_time: s.start_time,
            end_time: s.end_time,
            hours,
        });

    let window_start = first_use
        .into_iter()
        .chain(history.first().map(|c| c.changed_at))
        .min();
    let availability_rate = match window_start {
        Some(start) if now > start => {
            let elapsed = as_hours(now - start);
            let down = out_of_service_hours(history, current, start, now);
            clamp_percent((1.0 - down / elapsed) * 100.0)
        }
        _ => {
            if current.is_out_of_service() {
                0.0
            } else {
                100.0
            }
        }
    };

    UsageStats {
        equipment_id: equipment_id.to_string(),
        total_hours: total,
        total_sessions: sessions.len(),
        active_session: sessions.iter().any(|s| s.is_active()),
        first_use,
        utilization_rate: round1(utilization_rate),
        daily_average_hours: round1(daily_average_hours),
        weekly_average_hours: round1(daily_average_hours * 7.0),
        monthly_average_hours: round1(daily_average_hours * 30.0),
        peak_usage,
        availability_rate: round1(availability_rate),
        red_tag_count,
    }
}

#[derive(Clone)]
pub struct UsageTracker {
    repository: Repository,
}

impl UsageTracker {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    /// Open an active session. A second active session for the same unit is
    /// rejected.
    pub async fn start_session(
        &self,
        equipment_id: &str,
        job_id: &str,
        start_time: Option<DateTime<Utc>>,
    ) -> AppResult<UsageSession> {
        if let Some(active) = self.repository.session_get_active(equipment_id).await? {
            return Err(AppError::Conflict(format!(
                "Equipment {} already has active usage session {} on job {}",
                equipment_id, active.id, active.job_id
            )));
        }

        let job = self.repository.job_get(job_id).await?;
        let session = self
            .repository
            .session_create(&NewUsageSession {
                equipment_id: equipment_id.to_string(),
                job_id: job_id.to_string(),
                job_name: Some(job.name),
                start_time: start_time.unwrap_or_else(Utc::now),
                notes: None,
            })
            .await?;

        tracing::info!(
            "Usage session {} started for equipment {} on job {}",
            session.id,
            equipment_id,
            job_id
        );
        Ok(session)
    }

    /// Complete the active session. Returns `None` when there is none.
    pub async fn end_session(
        &self,
        equipment_id: &str,
        end_time: Option<DateTime<Utc>>,
        notes: Option<String>,
    ) -> AppResult<Option<UsageSession>> {
        self.close_active(equipment_id, end_time, SessionStatus::Completed, notes)
            .await
    }

    /// Close a stale active session as `interrupted`
    pub async fn interrupt_session(
        &self,
        equipment_id: &str,
        notes: Option<String>,
    ) -> AppResult<Option<UsageSession>> {
        self.close_active(equipment_id, None, SessionStatus::Interrupted, notes)
            .await
    }

    async fn close_active(
        &self,
        equipment_id: &str,
        end_time: Option<DateTime<Utc>>,
        status: SessionStatus,
        notes: Option<String>,
    ) -> AppResult<Option<UsageSession>> {
        let active = match self.repository.session_get_active(equipment_id).await? {
            Some(session) => session,
            None => return Ok(None),
        };

        let closed = close_session(active, end_time.unwrap_or_else(Utc::now), status, notes);
        let stored = self.repository.session_update(&closed).await?;
        tracing::info!(
            "Usage session {} for equipment {} closed as {}: {:.1} h",
            stored.id,
            equipment_id,
            stored.status.as_str(),
            stored.hours_used.unwrap_or(0.0)
        );
        Ok(Some(stored))
    }

    /// Put a session back exactly as it was (used by compensating actions)
    pub async fn restore_session(&self, snapshot: &UsageSession) -> AppResult<()> {
        self.repository.session_update(snapshot).await?;
        Ok(())
    }

    /// Remove a session created by a transaction that is being rolled back
    pub async fn discard_session(&self, session_id: &str) -> AppResult<()> {
        self.repository.session_delete(session_id).await
    }

    pub async fn sessions(&self, equipment_id: &str) -> AppResult<Vec<UsageSession>> {
        self.repository.session_list(equipment_id).await
    }

    pub async fn total_hours(&self, equipment_id: &str) -> AppResult<f64> {
        self.total_hours_at(equipment_id, Utc::now()).await
    }

    pub async fn total_hours_at(&self, equipment_id: &str, now: DateTime<Utc>) -> AppResult<f64> {
        let sessions = self.repository.session_list(equipment_id).await?;
        Ok(total_hours(&sessions, now))
    }

    pub async fn stats(&self, equipment_id: &str) -> AppResult<UsageStats> {
        self.stats_at(equipment_id, Utc::now()).await
    }

    pub async fn stats_at(&self, equipment_id: &str, now: DateTime<Utc>) -> AppResult<UsageStats> {
        let unit = self.repository.equipment_get(equipment_id).await?;
        let sessions = self.repository.session_list(equipment_id).await?;
        let history = self.repository.history_list(equipment_id).await?;
        let red_tags = self.repository.red_tag_list(equipment_id).await?;
        Ok(compute_stats(
            equipment_id,
            &sessions,
            &history,
            unit.status,
            red_tags.len(),
            now,
        ))
    }

    /// Close any active session with a red-tag note and append a red-tag
    /// event carrying the hours accumulated so far.
    pub async fn red_tag(
        &self,
        equipment_id: &str,
        reason: &str,
        severity: Severity,
    ) -> AppResult<RedTagEvent> {
        let now = Utc::now();
        let closed = self
            .end_session(equipment_id, Some(now), Some(format!("Red-tagged: {}", reason)))
            .await?;
        self.record_red_tag(
            equipment_id,
            closed.map(|s| s.job_id),
            reason,
            severity,
            now,
        )
        .await
    }

    /// Append a red-tag event without touching sessions
    pub async fn record_red_tag(
        &self,
        equipment_id: &str,
        job_at_failure: Option<String>,
        reason: &str,
        severity: Severity,
        at: DateTime<Utc>,
    ) -> AppResult<RedTagEvent> {
        let hours_at_failure = self.total_hours_at(equipment_id, at).await?;
        let event = self
            .repository
            .red_tag_create(&NewRedTagEvent {
                equipment_id: equipment_id.to_string(),
                reason: reason.to_string(),
                severity,
                hours_at_failure,
                job_at_failure,
                created_at: at,
            })
            .await?;
        tracing::warn!(
            "Equipment {} red-tagged ({}) at {:.1} h: {}",
            equipment_id,
            severity,
            hours_at_failure,
            reason
        );
        Ok(event)
    }
}
