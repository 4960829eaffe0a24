//! Usage sessions and red-tag events

use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        enums::{SessionStatus, Severity},
        usage::{NewRedTagEvent, NewUsageSession, RedTagEvent, UsageSession},
    },
};

fn session_from_row(row: &PgRow) -> AppResult<UsageSession> {
    let status: String = row.try_get("status")?;
    Ok(UsageSession {
        id: row.try_get("id")?,
        equipment_id: row.try_get("equipment_id")?,
        job_id: row.try_get("job_id")?,
        job_name: row.try_get("job_name")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        hours_used: row.try_get("hours_used")?,
        status: status.parse::<SessionStatus>()?,
        notes: row.try_get("notes")?,
    })
}

fn red_tag_from_row(row: &PgRow) -> AppResult<RedTagEvent> {
    let severity: String = row.try_get("severity")?;
    Ok(RedTagEvent {
        id: row.try_get("id")?,
        equipment_id: row.try_get("equipment_id")?,
        reason: row.try_get("reason")?,
        severity: severity.parse::<Severity>()?,
        hours_at_failure: row.try_get("hours_at_failure")?,
        job_at_failure: row.try_get("job_at_failure")?,
        resolution: row.try_get("resolution")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct UsageTable {
    pool: Pool<Postgres>,
}

impl UsageTable {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn session_create(&self, data: &NewUsageSession) -> AppResult<UsageSession> {
        let row = sqlx::query(
            r#"
            INSERT INTO usage_sessions (id, equipment_id, job_id, job_name, start_time, status, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&data.equipment_id)
        .bind(&data.job_id)
        .bind(&data.job_name)
        .bind(data.start_time)
        .bind(SessionStatus::Active.as_str())
        .bind(&data.notes)
        .fetch_one(&self.pool)
        .await?;
        session_from_row(&row)
    }

    /// The active session for a unit. Several active rows would break the
    /// one-active-session invariant; the newest wins.
    pub async fn session_get_active(&self, equipment_id: &str) -> AppResult<Option<UsageSession>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM usage_sessions
            WHERE equipment_id = $1 AND status = 'active'
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .bind(equipment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn session_list(&self, equipment_id: &str) -> AppResult<Vec<UsageSession>> {
        let rows = sqlx::query("SELECT * FROM usage_sessions WHERE equipment_id = $1 ORDER BY start_time")
            .bind(equipment_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn session_update(&self, session: &UsageSession) -> AppResult<UsageSession> {
        let row = sqlx::query(
            r#"
            UPDATE usage_sessions
            SET end_time = $2, hours_used = $3, status = $4, notes = $5, start_time = $6
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(&session.id)
        .bind(session.end_time)
        .bind(session.hours_used)
        .bind(session.status.as_str())
        .bind(&session.notes)
        .bind(session.start_time)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Usage session {} not found", session.id)))?;
        session_from_row(&row)
    }

    pub async fn session_delete(&self, id: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM usage_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Usage session {} not found", id)));
        }
        Ok(())
    }

    pub async fn red_tag_create(&self, data: &NewRedTagEvent) -> AppResult<RedTagEvent> {
        let row = sqlx::query(
            r#"
            INSERT INTO red_tag_events (id, equipment_id, reason, severity, hours_at_failure,
                                        job_at_failure, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&data.equipment_id)
        .bind(&data.reason)
        .bind(data.severity.as_str())
        .bind(data.hours_at_failure)
        .bind(&data.job_at_failure)
        .bind(data.created_at)
        .fetch_one(&self.pool)
        .await?;
        red_tag_from_row(&row)
    }

    pub async fn red_tag_list(&self, equipment_id: &str) -> AppResult<Vec<RedTagEvent>> {
        let rows = sqlx::query("SELECT * FROM red_tag_events WHERE equipment_id = $1 ORDER BY created_at")
            .bind(equipment_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(red_tag_from_row).collect()
    }
}
