//! Postgres-backed record store.
//!
//! Each logical table is a Postgres table with one row per item:
//!
//! ```sql
//! CREATE TABLE <table_name> (
//!     job_id     TEXT PRIMARY KEY,
//!     attributes JSONB NOT NULL
//! );
//! ```
//!
//! Partial upserts merge the given attributes into the stored JSONB object
//! (`attributes || $2`), so unknown attributes written by newer writers are
//! preserved.
//!
//! ## Error Mapping
//!
//! SQLx errors are surfaced as `StoreError` with the following codes, which
//! [`PostgresStatusTranslator`](crate::translator::PostgresStatusTranslator)
//! interprets:
//!
//! | SQLx Error | `StoreError::code` | Scenario |
//! |------------|--------------------|----------|
//! | Database (unique violation) | `23505` | Item already exists |
//! | Database (other) | SQLSTATE, or `database` | Other database errors |
//! | (no row returned) | `row_not_found` | Item does not exist |
//! | (conditional update matched 0 rows) | `condition_failed` | Compare-and-swap lost |
//! | PoolClosed | `pool_closed` | Connection pool was closed |
//! | Other | `sqlx` | Network errors, decode failures, etc. |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use jobwarden_core::{CreateItem, Item, UpsertItem};

use super::{JobStore, StoreError};

/// Status codes reported by [`PostgresJobStore`] besides raw SQLSTATEs.
pub mod codes {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const ROW_NOT_FOUND: &str = "row_not_found";
    pub const CONDITION_FAILED: &str = "condition_failed";
    pub const INVALID_TABLE: &str = "invalid_table";
    pub const POOL_CLOSED: &str = "pool_closed";
}

/// Postgres-backed keyed item store.
///
/// `PostgresJobStore` is `Send + Sync`; all operations go through the SQLx
/// connection pool. Single-row statements give the per-key atomicity the
/// orchestrator relies on.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the backing table if it does not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_table(&self, table_name: &str) -> Result<(), StoreError> {
        let table = checked_table_name(table_name)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                job_id TEXT PRIMARY KEY,
                attributes JSONB NOT NULL
            )"
        );
        sqlx::query(&sql)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_table", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, request), fields(table = %request.table_name, key = %request.key), err)]
    async fn create_if_absent(&self, request: CreateItem) -> Result<(), StoreError> {
        let table = checked_table_name(&request.table_name)?;
        let sql = format!("INSERT INTO {table} (job_id, attributes) VALUES ($1, $2)");

        sqlx::query(&sql)
            .bind(&request.key)
            .bind(Json(&request.attributes))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_if_absent", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, table_name: &str, key: &str) -> Result<Item, StoreError> {
        let table = checked_table_name(table_name)?;
        let sql = format!("SELECT attributes FROM {table} WHERE job_id = $1");

        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or_else(|| StoreError::new(codes::ROW_NOT_FOUND, format!("no item '{key}'")))?;

        let Json(item) = row
            .try_get::<Json<Item>, _>("attributes")
            .map_err(|e| map_sqlx_error("decode_attributes", e))?;
        Ok(item)
    }

    #[instrument(
        skip(self, request),
        fields(
            table = %request.table_name,
            key = %request.key,
            conditional = request.condition.is_some()
        ),
        err
    )]
    async fn upsert_partial(&self, request: UpsertItem) -> Result<(), StoreError> {
        let table = checked_table_name(&request.table_name)?;

        let Some(condition) = &request.condition else {
            let sql = format!(
                "INSERT INTO {table} (job_id, attributes) VALUES ($1, $2)
                 ON CONFLICT (job_id) DO UPDATE
                 SET attributes = {table}.attributes || EXCLUDED.attributes"
            );
            sqlx::query(&sql)
                .bind(&request.key)
                .bind(Json(&request.attributes))
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("upsert_partial", e))?;
            return Ok(());
        };

        let sql = format!(
            "UPDATE {table} SET attributes = attributes || $2
             WHERE job_id = $1 AND attributes -> $3 = $4"
        );
        let result = sqlx::query(&sql)
            .bind(&request.key)
            .bind(Json(&request.attributes))
            .bind(&condition.attribute)
            .bind(Json(&condition.expected))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_partial_conditional", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::new(
                codes::CONDITION_FAILED,
                format!(
                    "condition on '{}' failed for item '{}'",
                    condition.attribute, request.key
                ),
            ));
        }
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn checked_table_name(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;

    if valid {
        Ok(name)
    } else {
        Err(StoreError::new(
            codes::INVALID_TABLE,
            format!("invalid table name '{name}'"),
        ))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err
                .code()
                .map(|c| c.into_owned())
                .unwrap_or_else(|| "database".to_string());
            StoreError::new(
                code,
                format!("database error in {}: {}", operation, db_err.message()),
            )
        }
        sqlx::Error::PoolClosed => StoreError::new(
            codes::POOL_CLOSED,
            format!("connection pool closed in {}", operation),
        ),
        sqlx::Error::RowNotFound => StoreError::new(
            codes::ROW_NOT_FOUND,
            format!("unexpected row not found in {}", operation),
        ),
        _ => StoreError::new("sqlx", format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(checked_table_name("job_records").is_ok());
        assert!(checked_table_name("_jobs2").is_ok());

        for bad in ["", "2jobs", "jobs; DROP TABLE x", "jobs-records", "jöbs"] {
            let err = checked_table_name(bad).unwrap_err();
            assert_eq!(err.code, codes::INVALID_TABLE);
        }
    }

    #[test]
    fn pool_closed_maps_to_its_own_code() {
        let err = map_sqlx_error("get", sqlx::Error::PoolClosed);
        assert_eq!(err.code, codes::POOL_CLOSED);
        assert!(err.message.contains("get"));
    }
}
