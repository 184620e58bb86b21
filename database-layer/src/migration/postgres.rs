//! PostgreSQL [`MigrationTarget`].

use super::{MigrationTarget, MigrationTransaction};
use crate::connection::DatabasePool;
use crate::error::{DatabaseError, DatabaseResult};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Arbitrary key shared by every process migrating the same database.
const MIGRATION_LOCK_KEY: i64 = 0x7265_6261_635f_6d67;

const CREATE_VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS rebac_schema_version (\
     singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton), \
     version BIGINT NOT NULL, \
     applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";

/// Applies migrations to PostgreSQL, keeping the version marker in
/// `rebac_schema_version` and serialising migrators with an advisory lock.
pub struct PgMigrationTarget {
    pool: DatabasePool,
    // advisory locks are session scoped; the session is pinned here while held
    lock_connection: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgMigrationTarget {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            lock_connection: Mutex::new(None),
        }
    }

    async fn ensure_version_table(&self) -> DatabaseResult<()> {
        sqlx::query(CREATE_VERSION_TABLE)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationTarget for PgMigrationTarget {
    async fn lock(&self) -> DatabaseResult<()> {
        let mut held = self.lock_connection.lock().await;
        if held.is_some() {
            return Ok(());
        }
        let mut conn = self.pool.pool().acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        debug!("Acquired migration advisory lock");
        *held = Some(conn);
        drop(held);

        if let Err(e) = self.ensure_version_table().await {
            if let Err(unlock_err) = self.unlock().await {
                warn!("Failed to release migration lock: {}", unlock_err);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn unlock(&self) -> DatabaseResult<()> {
        let Some(mut conn) = self.lock_connection.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
        {
            // closing the session releases the lock server side
            drop(conn.detach());
            return Err(e.into());
        }
        debug!("Released migration advisory lock");
        Ok(())
    }

    async fn current_version(&self) -> DatabaseResult<i64> {
        self.ensure_version_table().await?;
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM rebac_schema_version WHERE singleton")
                .fetch_optional(self.pool.pool())
                .await?;
        Ok(version.unwrap_or(0))
    }

    async fn begin(&self) -> DatabaseResult<Box<dyn MigrationTransaction>> {
        let tx = self.pool.pool().begin().await.map_err(|e| {
            DatabaseError::QueryFailed(format!("Failed to begin transaction: {e}"))
        })?;
        Ok(Box::new(PgMigrationTransaction { tx }))
    }
}

struct PgMigrationTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MigrationTransaction for PgMigrationTransaction {
    async fn execute(&mut self, statement: &str) -> DatabaseResult<()> {
        // plain string: runs unprepared so DDL is accepted
        (&mut *self.tx).execute(statement).await?;
        Ok(())
    }

    async fn set_version(&mut self, version: i64) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO rebac_schema_version (singleton, version, applied_at) \
             VALUES (TRUE, $1, NOW()) \
             ON CONFLICT (singleton) DO UPDATE SET version = EXCLUDED.version, applied_at = NOW()",
        )
        .bind(version)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DatabaseResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DatabaseResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
