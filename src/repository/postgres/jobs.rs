//! Jobs and storage locations (owned by other collaborators, read here)

use sqlx::{postgres::PgRow, Pool, Postgres, Row};

use crate::{
    error::{AppError, AppResult},
    models::job::{Job, StorageLocation},
};

fn job_from_row(row: &PgRow) -> AppResult<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        client: row.try_get("client")?,
        location: row.try_get("location")?,
        diagram: row.try_get("diagram")?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn location_from_row(row: &PgRow) -> AppResult<StorageLocation> {
    Ok(StorageLocation {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        is_default: row.try_get("is_default")?,
    })
}

#[derive(Clone)]
pub struct JobsTable {
    pool: Pool<Postgres>,
}

impl JobsTable {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// All jobs, soft-deleted ones included
    pub async fn list(&self) -> AppResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, name, client, location, diagram, created_at, deleted_at FROM jobs ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<Job> {
        let row = sqlx::query(
            "SELECT id, name, client, location, diagram, created_at, deleted_at FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
        job_from_row(&row)
    }

    pub async fn location_list(&self) -> AppResult<Vec<StorageLocation>> {
        let rows = sqlx::query("SELECT id, name, address, is_default FROM storage_locations ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(location_from_row).collect()
    }

    pub async fn location_get(&self, id: &str) -> AppResult<StorageLocation> {
        let row = sqlx::query("SELECT id, name, address, is_default FROM storage_locations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Storage location {} not found", id)))?;
        location_from_row(&row)
    }
}
