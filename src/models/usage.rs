//! Usage session, red-tag and utilization models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{SessionStatus, Severity};

/// One deployment interval of a unit on a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSession {
    pub id: String,
    pub equipment_id: String,
    pub job_id: String,
    pub job_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set when the session is closed, rounded to one decimal
    pub hours_used: Option<f64>,
    pub status: SessionStatus,
    pub notes: Option<String>,
}

impl UsageSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone)]
pub struct NewUsageSession {
    pub equipment_id: String,
    pub job_id: String,
    pub job_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Immutable failure/maintenance flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedTagEvent {
    pub id: String,
    pub equipment_id: String,
    pub reason: String,
    pub severity: Severity,
    pub hours_at_failure: f64,
    pub job_at_failure: Option<String>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRedTagEvent {
    pub equipment_id: String,
    pub reason: String,
    pub severity: Severity,
    pub hours_at_failure: f64,
    pub job_at_failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session with the most hours
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakUsage {
    pub session_id: String,
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub hours: f64,
}

/// Derived utilization figures for one unit. Rates are percentages in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub equipment_id: String,
    pub total_hours: f64,
    pub total_sessions: usize,
    pub active_session: bool,
    pub first_use: Option<DateTime<Utc>>,
    pub utilization_rate: f64,
    pub daily_average_hours: f64,
    pub weekly_average_hours: f64,
    pub monthly_average_hours: f64,
    pub peak_usage: Option<PeakUsage>,
    pub availability_rate: f64,
    pub red_tag_count: usize,
}
