//! Per-user augmentation columns and their cell values.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sheetsync_core::{next_position, AugmentationColumn, ColumnDataType, ResourceId, UserId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Augmentation values of one user for one resource: row index → column id → value.
pub type ValueGrid = BTreeMap<u32, BTreeMap<String, String>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("column name is required")]
    EmptyName,
    #[error("unrecognized column data type {0:?}")]
    UnknownDataType(String),
    #[error("a column named {0:?} already exists")]
    DuplicateName(String),
    #[error("unknown column {0}")]
    UnknownColumn(String),
    #[error("{0:?} is not a YYYY-MM-DD date")]
    InvalidDate(String),
}

#[derive(Debug, Error)]
pub enum AugmentationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("augmentation storage failed: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("corrupt augmentation record: {0}")]
    Corrupt(String),
}

/// One cell write against an augmentation column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellEdit {
    pub row_index: u32,
    pub column_id: String,
    pub value: String,
}

#[async_trait]
pub trait AugmentationProvider: Send + Sync {
    /// Columns ordered by position; empty when the user has none.
    async fn list_columns(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<Vec<AugmentationColumn>, AugmentationError>;

    async fn add_column(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        name: &str,
        data_type: &str,
    ) -> Result<AugmentationColumn, AugmentationError>;

    async fn list_values(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<ValueGrid, AugmentationError>;

    /// Overwrites any previous value of the same cell.
    async fn save_value(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        edit: &CellEdit,
    ) -> Result<(), AugmentationError>;
}

pub fn validate_new_column(
    name: &str,
    data_type: &str,
    existing: &[AugmentationColumn],
) -> Result<(String, ColumnDataType), ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let data_type = data_type
        .parse::<ColumnDataType>()
        .map_err(|e| ValidationError::UnknownDataType(e.0))?;
    if existing.iter().any(|c| c.name == name) {
        return Err(ValidationError::DuplicateName(name.to_string()));
    }
    Ok((name.to_string(), data_type))
}

/// An empty value clears a cell and is accepted for every type.
pub fn validate_value(column: &AugmentationColumn, value: &str) -> Result<(), ValidationError> {
    match column.data_type {
        ColumnDataType::Text => Ok(()),
        ColumnDataType::Date if value.is_empty() => Ok(()),
        ColumnDataType::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|_| ())
            .map_err(|_| ValidationError::InvalidDate(value.to_string())),
    }
}

fn find_column<'a>(
    columns: &'a [AugmentationColumn],
    column_id: &str,
) -> Result<&'a AugmentationColumn, ValidationError> {
    columns
        .iter()
        .find(|c| c.id == column_id)
        .ok_or_else(|| ValidationError::UnknownColumn(column_id.to_string()))
}

type OwnerKey = (ResourceId, UserId);

#[derive(Debug, Default)]
struct MemoryState {
    columns: HashMap<OwnerKey, Vec<AugmentationColumn>>,
    values: HashMap<OwnerKey, ValueGrid>,
}

/// Process-local provider used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct InMemoryAugmentationStore {
    state: Mutex<MemoryState>,
}

impl InMemoryAugmentationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AugmentationProvider for InMemoryAugmentationStore {
    async fn list_columns(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<Vec<AugmentationColumn>, AugmentationError> {
        let state = self.state.lock();
        let mut columns = state
            .columns
            .get(&(resource_id.clone(), user_id.clone()))
            .cloned()
            .unwrap_or_default();
        columns.sort_by_key(|c| c.position);
        Ok(columns)
    }

    async fn add_column(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        name: &str,
        data_type: &str,
    ) -> Result<AugmentationColumn, AugmentationError> {
        let mut state = self.state.lock();
        let columns = state
            .columns
            .entry((resource_id.clone(), user_id.clone()))
            .or_default();
        let (name, data_type) = validate_new_column(name, data_type, columns)?;
        let column = AugmentationColumn {
            id: Uuid::new_v4().to_string(),
            name,
            data_type,
            position: next_position(columns.iter()),
            owner_user_id: user_id.clone(),
        };
        columns.push(column.clone());
        debug!(resource_id = %resource_id, user_id = %user_id, position = column.position, "added augmentation column");
        Ok(column)
    }

    async fn list_values(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<ValueGrid, AugmentationError> {
        let state = self.state.lock();
        Ok(state
            .values
            .get(&(resource_id.clone(), user_id.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_value(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        edit: &CellEdit,
    ) -> Result<(), AugmentationError> {
        let key = (resource_id.clone(), user_id.clone());
        let mut state = self.state.lock();
        let columns = state.columns.get(&key).map(Vec::as_slice).unwrap_or_default();
        validate_value(find_column(columns, &edit.column_id)?, &edit.value)?;
        state
            .values
            .entry(key)
            .or_default()
            .entry(edit.row_index)
            .or_default()
            .insert(edit.column_id.clone(), edit.value.clone());
        Ok(())
    }
}

/// Postgres-backed provider.
#[derive(Debug, Clone)]
pub struct PgAugmentationStore {
    pool: PgPool,
}

impl PgAugmentationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, AugmentationError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub async fn migrate(&self) -> Result<(), AugmentationError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AugmentationError::Storage(e.into()))?;
        info!("augmentation migrations applied");
        Ok(())
    }

    async fn columns_for<'e, E>(
        executor: E,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<Vec<AugmentationColumn>, AugmentationError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let rows = sqlx::query(
            r#"
            SELECT id, name, data_type, position, owner_user_id
              FROM augmentation_columns
             WHERE resource_id = $1
               AND owner_user_id = $2
             ORDER BY position ASC
            "#,
        )
        .bind(resource_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(executor)
        .await?;
        rows.iter().map(column_from_row).collect()
    }
}

fn column_from_row(row: &PgRow) -> Result<AugmentationColumn, AugmentationError> {
    let data_type: String = row.try_get("data_type")?;
    let owner: String = row.try_get("owner_user_id")?;
    Ok(AugmentationColumn {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        data_type: data_type
            .parse()
            .map_err(|e: sheetsync_core::UnknownDataType| AugmentationError::Corrupt(e.to_string()))?,
        position: row.try_get("position")?,
        owner_user_id: UserId::new(owner),
    })
}

#[async_trait]
impl AugmentationProvider for PgAugmentationStore {
    async fn list_columns(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<Vec<AugmentationColumn>, AugmentationError> {
        Self::columns_for(&self.pool, resource_id, user_id).await
    }

    async fn add_column(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        name: &str,
        data_type: &str,
    ) -> Result<AugmentationColumn, AugmentationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || '/' || $2))")
            .bind(resource_id.as_str())
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await?;
        let existing = Self::columns_for(&mut *tx, resource_id, user_id).await?;
        let (name, data_type) = validate_new_column(name, data_type, &existing)?;
        let column = AugmentationColumn {
            id: Uuid::new_v4().to_string(),
            name,
            data_type,
            position: next_position(existing.iter()),
            owner_user_id: user_id.clone(),
        };

        sqlx::query(
            r#"
            INSERT INTO augmentation_columns (id, resource_id, owner_user_id, name, data_type, position)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&column.id)
        .bind(resource_id.as_str())
        .bind(user_id.as_str())
        .bind(&column.name)
        .bind(column.data_type.as_str())
        .bind(column.position)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(resource_id = %resource_id, user_id = %user_id, position = column.position, "added augmentation column");
        Ok(column)
    }

    async fn list_values(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<ValueGrid, AugmentationError> {
        let rows = sqlx::query(
            r#"
            SELECT row_index, column_id, value
              FROM augmentation_values
             WHERE resource_id = $1
               AND owner_user_id = $2
            "#,
        )
        .bind(resource_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut grid = ValueGrid::new();
        for row in rows {
            let row_index: i64 = row.try_get("row_index")?;
            let row_index = u32::try_from(row_index)
                .map_err(|_| AugmentationError::Corrupt(format!("row_index {row_index} out of range")))?;
            grid.entry(row_index)
                .or_default()
                .insert(row.try_get("column_id")?, row.try_get("value")?);
        }
        Ok(grid)
    }

    async fn save_value(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        edit: &CellEdit,
    ) -> Result<(), AugmentationError> {
        let columns = self.list_columns(resource_id, user_id).await?;
        validate_value(find_column(&columns, &edit.column_id)?, &edit.value)?;

        sqlx::query(
            r#"
            INSERT INTO augmentation_values (resource_id, owner_user_id, row_index, column_id, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (resource_id, owner_user_id, row_index, column_id)
            DO UPDATE SET value = EXCLUDED.value,
                          updated_at = NOW()
            "#,
        )
        .bind(resource_id.as_str())
        .bind(user_id.as_str())
        .bind(i64::from(edit.row_index))
        .bind(&edit.column_id)
        .bind(&edit.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
