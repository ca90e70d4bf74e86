/// Record store the re-embed job reads from and writes back to.
///
/// The job only needs three operations: make sure the vector extension exists, list every
/// record with non-null content, and overwrite one record's embedding by id. The Postgres
/// implementation uses sqlx with pgvector's `Vector` type for the `embedding` column.
use std::time::Duration;

use pgvector::Vector;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DbConfig;
use crate::error::AppError;

/// A record as seen by the job. The existing embedding is never read, only overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub content: Option<String>,
}

#[allow(async_fn_in_trait)]
pub trait RecordStore {
    /// Idempotent `CREATE EXTENSION IF NOT EXISTS vector`.
    async fn ensure_vector_extension(&self) -> Result<(), AppError>;

    /// Every record whose content is non-null. Empty strings are included.
    async fn fetch_candidates(&self) -> Result<Vec<StoredRecord>, AppError>;

    async fn update_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), AppError>;

    /// Release the underlying connections.
    async fn close(&self);
}

pub struct PgRecordStore {
    pool: PgPool,
    table: String,
}

impl PgRecordStore {
    /// Connect to Postgres. `table` must already be validated as an identifier.
    pub async fn connect(
        db: &DbConfig,
        table: &str,
        max_connections: u32,
    ) -> Result<Self, AppError> {
        let options = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.user)
            .password(&db.password)
            .database(&db.database);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| AppError::Store(format!("connection failed: {e}")))?;

        info!(
            host = %db.host,
            port = db.port,
            database = %db.database,
            table,
            "connected to postgres"
        );
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }
}

impl RecordStore for PgRecordStore {
    async fn ensure_vector_extension(&self) -> Result<(), AppError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(format!("create vector extension failed: {e}")))?;
        Ok(())
    }

    async fn fetch_candidates(&self) -> Result<Vec<StoredRecord>, AppError> {
        let sql = format!(
            "SELECT id, content FROM {} WHERE content IS NOT NULL ORDER BY id",
            self.table
        );
        let rows: Vec<(i64, Option<String>)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Store(format!("fetch records failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(id, content)| StoredRecord { id, content })
            .collect())
    }

    async fn update_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), AppError> {
        let sql = format!("UPDATE {} SET embedding = $1 WHERE id = $2", self.table);
        let result = sqlx::query(&sql)
            .bind(Vector::from(embedding.to_vec()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(format!("update record {id} failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Store(format!("record {id} no longer exists")));
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("disconnected from postgres");
    }
}
