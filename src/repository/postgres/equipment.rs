//! Equipment units, equipment types and status history tables

use chrono::Utc;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        enums::{EquipmentStatus, LocationKind, Severity},
        equipment::{
            CreateEquipmentType, EquipmentPatch, EquipmentType, EquipmentUnit, NewStatusChange,
            StatusChange, UpdateEquipmentType,
        },
    },
    repository::NewEquipment,
};

const UNIT_COLUMNS: &str = "id, code, type_id, location_id, location_kind, status, job_id, \
     serial_number, red_tag_reason, red_tag_severity, notes, created_at, updated_at";

fn parse_column<T: std::str::FromStr<Err = AppError>>(row: &PgRow, column: &str) -> AppResult<T> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: AppError| AppError::Persistence(format!("Bad value in column {}: {}", column, e)))
}

fn unit_from_row(row: &PgRow) -> AppResult<EquipmentUnit> {
    let severity: Option<String> = row.try_get("red_tag_severity")?;
    Ok(EquipmentUnit {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        type_id: row.try_get("type_id")?,
        location_id: row.try_get("location_id")?,
        location_kind: parse_column::<LocationKind>(row, "location_kind")?,
        status: parse_column::<EquipmentStatus>(row, "status")?,
        job_id: row.try_get("job_id")?,
        serial_number: row.try_get("serial_number")?,
        red_tag_reason: row.try_get("red_tag_reason")?,
        red_tag_severity: severity.as_deref().map(str::parse::<Severity>).transpose()?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn type_from_row(row: &PgRow) -> AppResult<EquipmentType> {
    Ok(EquipmentType {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        individually_tracked: row.try_get("individually_tracked")?,
        default_code_prefix: row.try_get("default_code_prefix")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn change_from_row(row: &PgRow) -> AppResult<StatusChange> {
    Ok(StatusChange {
        id: row.try_get("id")?,
        equipment_id: row.try_get("equipment_id")?,
        from: parse_column::<EquipmentStatus>(row, "from_status")?,
        to: parse_column::<EquipmentStatus>(row, "to_status")?,
        changed_at: row.try_get("changed_at")?,
        reason: row.try_get("reason")?,
    })
}

/// Text column assignments for a patch, in bind order
fn patch_assignments(patch: &EquipmentPatch) -> Vec<(&'static str, Option<String>)> {
    let mut sets = Vec::new();

    macro_rules! add_field {
        ($field:expr, $name:expr, $map:expr) => {
            if let Some(ref val) = $field {
                sets.push(($name, $map(val)));
            }
        };
    }

    add_field!(patch.status, "status", |s: &EquipmentStatus| Some(s.as_str().to_string()));
    add_field!(patch.job_id, "job_id", |v: &Option<String>| v.clone());
    add_field!(patch.location_id, "location_id", |v: &Option<String>| v.clone());
    add_field!(patch.location_kind, "location_kind", |k: &LocationKind| Some(k.as_str().to_string()));
    add_field!(patch.red_tag_reason, "red_tag_reason", |v: &Option<String>| v.clone());
    add_field!(patch.red_tag_severity, "red_tag_severity", |v: &Option<Severity>| {
        v.map(|s| s.as_str().to_string())
    });
    add_field!(patch.serial_number, "serial_number", |v: &Option<String>| v.clone());
    add_field!(patch.notes, "notes", |v: &Option<String>| v.clone());

    sets
}

#[derive(Clone)]
pub struct EquipmentTable {
    pool: Pool<Postgres>,
}

impl EquipmentTable {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    // =========================================================================
    // UNITS
    // =========================================================================

    pub async fn list(&self) -> AppResult<Vec<EquipmentUnit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM equipment ORDER BY code, id",
            UNIT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(unit_from_row).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<EquipmentUnit> {
        let row = sqlx::query(&format!("SELECT {} FROM equipment WHERE id = $1", UNIT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Equipment {} not found", id)))?;
        unit_from_row(&row)
    }

    pub async fn list_by_code(&self, code: &str) -> AppResult<Vec<EquipmentUnit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM equipment WHERE code = $1 ORDER BY id",
            UNIT_COLUMNS
        ))
        .bind(code)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(unit_from_row).collect()
    }

    pub async fn create(&self, data: &NewEquipment) -> AppResult<EquipmentUnit> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO equipment (id, code, type_id, location_id, location_kind, status,
                                   serial_number, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING {}
            "#,
            UNIT_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&data.code)
        .bind(&data.type_id)
        .bind(&data.location_id)
        .bind(LocationKind::Storage.as_str())
        .bind(EquipmentStatus::Available.as_str())
        .bind(&data.serial_number)
        .bind(&data.notes)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        unit_from_row(&row)
    }

    pub async fn update(&self, id: &str, patch: &EquipmentPatch) -> AppResult<EquipmentUnit> {
        let assignments = patch_assignments(patch);
        let mut sets = vec!["updated_at = $1".to_string()];
        for (idx, (column, _)) in assignments.iter().enumerate() {
            sets.push(format!("{} = ${}", column, idx + 2));
        }
        let query = format!(
            "UPDATE equipment SET {} WHERE id = ${} RETURNING {}",
            sets.join(", "),
            assignments.len() + 2,
            UNIT_COLUMNS
        );

        let mut builder = sqlx::query(&query).bind(Utc::now());
        for (_, value) in assignments {
            builder = builder.bind(value);
        }

        let row = builder
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Equipment {} not found", id)))?;
        unit_from_row(&row)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM equipment WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Equipment {} not found", id)));
        }
        Ok(())
    }

    // =========================================================================
    // TYPES
    // =========================================================================

    pub async fn type_list(&self) -> AppResult<Vec<EquipmentType>> {
        let rows = sqlx::query("SELECT * FROM equipment_types ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(type_from_row).collect()
    }

    pub async fn type_get(&self, id: &str) -> AppResult<EquipmentType> {
        let row = sqlx::query("SELECT * FROM equipment_types WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", id)))?;
        type_from_row(&row)
    }

    pub async fn type_create(&self, data: &CreateEquipmentType) -> AppResult<EquipmentType> {
        let row = sqlx::query(
            r#"
            INSERT INTO equipment_types (id, name, category, individually_tracked,
                                         default_code_prefix, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&data.name)
        .bind(&data.category)
        .bind(data.individually_tracked)
        .bind(&data.default_code_prefix)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        type_from_row(&row)
    }

    pub async fn type_update(&self, id: &str, data: &UpdateEquipmentType) -> AppResult<EquipmentType> {
        let row = sqlx::query(
            r#"
            UPDATE equipment_types SET
                name = COALESCE($2, name),
                category = COALESCE($3, category),
                individually_tracked = COALESCE($4, individually_tracked),
                default_code_prefix = CASE WHEN $5 THEN $6 ELSE default_code_prefix END,
                updated_at = $7
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.category)
        .bind(data.individually_tracked)
        .bind(data.default_code_prefix.is_some())
        .bind(data.default_code_prefix.clone().flatten())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", id)))?;
        type_from_row(&row)
    }

    pub async fn type_delete(&self, id: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM equipment_types WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Equipment type {} not found", id)));
        }
        Ok(())
    }

    // =========================================================================
    // STATUS HISTORY
    // =========================================================================

    pub async fn history_append(&self, data: &NewStatusChange) -> AppResult<StatusChange> {
        let row = sqlx::query(
            r#"
            INSERT INTO equipment_status_history (id, equipment_id, from_status, to_status, changed_at, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&data.equipment_id)
        .bind(data.from.as_str())
        .bind(data.to.as_str())
        .bind(data.changed_at)
        .bind(&data.reason)
        .fetch_one(&self.pool)
        .await?;
        change_from_row(&row)
    }

    pub async fn history_list(&self, equipment_id: &str) -> AppResult<Vec<StatusChange>> {
        let rows = sqlx::query(
            "SELECT * FROM equipment_status_history WHERE equipment_id = $1 ORDER BY changed_at",
        )
        .bind(equipment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(change_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_assignments_follow_field_order_and_keep_nulls() {
        let patch = EquipmentPatch {
            status: Some(EquipmentStatus::Available),
            job_id: Some(None),
            location_kind: Some(LocationKind::Storage),
            ..Default::default()
        };
        let sets = patch_assignments(&patch);
        assert_eq!(
            sets,
            vec![
                ("status", Some("available".to_string())),
                ("job_id", None),
                ("location_kind", Some("storage".to_string())),
            ]
        );
    }
}
