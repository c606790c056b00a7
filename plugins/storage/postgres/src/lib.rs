//! PostgreSQL stream storage.
//!
//! One table, `streams`, created on start if missing. The pool is built
//! lazily so construction never touches the network; `start` is the first
//! round trip.

use std::future::Future;
use std::pin::Pin;

use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};

use encoder_api::{CollaboratorError, Component, StoredStream, StreamStorage};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS streams (
        uid TEXT PRIMARY KEY,
        topic TEXT NOT NULL,
        sealed_recipient_key BYTEA NOT NULL,
        datastore_target TEXT NOT NULL,
        created_at_ms BIGINT NOT NULL
    )
"#;

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Build the pool without connecting. Fails only on a malformed url.
    pub fn new(url: &str, max_connections: u32) -> Result<Self, CollaboratorError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|e| map_sqlx(e).with_context("postgres url"))?;
        Ok(Self { pool })
    }

    async fn ensure_table(&self) -> Result<(), CollaboratorError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(e).with_context("create table streams"))?;
        Ok(())
    }
}

/// Unique violations become `Conflict`; connection-level faults become
/// `Unavailable`; everything else is `Internal`.
fn map_sqlx(err: sqlx::Error) -> CollaboratorError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => CollaboratorError::conflict(db.message().to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => CollaboratorError::unavailable(err.to_string()),
        _ => CollaboratorError::internal(err.to_string()),
    }
}

impl Component for PostgresStorage {
    fn name(&self) -> &str {
        "storage-postgres"
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_table().await?;
            tracing::debug!(table = "streams", "postgres schema ready");
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}

impl StreamStorage for PostgresStorage {
    fn insert(
        &self,
        row: StoredStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO streams (uid, topic, sealed_recipient_key, datastore_target, created_at_ms)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&row.uid)
            .bind(&row.topic)
            .bind(&row.sealed_recipient_key)
            .bind(&row.datastore_target)
            .bind(row.created_at_ms)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(())
        })
    }

    fn delete(
        &self,
        uid: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        let uid = uid.to_string();
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM streams WHERE uid = $1")
                .bind(&uid)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if result.rows_affected() == 0 {
                return Err(CollaboratorError::not_found(format!("uid '{uid}' not stored")));
            }
            Ok(())
        })
    }

    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<StoredStream>, CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT uid, topic, sealed_recipient_key, datastore_target, created_at_ms
                FROM streams
                ORDER BY created_at_ms, uid
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

            rows.into_iter()
                .map(|row| -> Result<StoredStream, CollaboratorError> {
                    Ok(StoredStream {
                        uid: row.try_get("uid").map_err(map_sqlx)?,
                        topic: row.try_get("topic").map_err(map_sqlx)?,
                        sealed_recipient_key: row.try_get("sealed_recipient_key").map_err(map_sqlx)?,
                        datastore_target: row.try_get("datastore_target").map_err(map_sqlx)?,
                        created_at_ms: row.try_get("created_at_ms").map_err(map_sqlx)?,
                    })
                })
                .collect()
        })
    }
}
