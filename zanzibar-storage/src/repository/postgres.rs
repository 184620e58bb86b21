//! PostgreSQL-backed tuple repository
//!
//! Tuples live in the `tuple` table keyed by `(store, object_type,
//! object_id, relation, _user)`; every mutation is mirrored into
//! `changelog` in the same transaction. The schema is owned by
//! [`super::migrations`].

use crate::{
    context::RequestContext,
    error::{StorageError, StorageResult},
    models::*,
    repository::{
        migrations, validate_filter, validate_write, ChangelogReader, TupleReader,
        TupleRepository, TupleStream, TupleWriter,
    },
};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use database_layer::{
    DatabasePool, MigrationReport, MigrationResult, Migrator, PgMigrationTarget, PoolSettings,
};
use futures::{StreamExt, TryStreamExt};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};

use super::memory::{DEFAULT_MAX_TUPLES_PER_WRITE, DEFAULT_MAX_TYPES_PER_AUTHORIZATION_MODEL};

const ORDER_BY_KEY: &str = " ORDER BY object_type, object_id, relation, _user";

const TUPLE_COLUMNS: &str =
    "object_type, object_id, relation, _user, condition_name, condition_context, inserted_at";

/// Construction options for [`PostgresTupleRepository`].
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub pool: PoolSettings,
    pub max_tuples_per_write: usize,
    pub max_types_per_authorization_model: usize,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            max_tuples_per_write: DEFAULT_MAX_TUPLES_PER_WRITE,
            max_types_per_authorization_model: DEFAULT_MAX_TYPES_PER_AUTHORIZATION_MODEL,
        }
    }
}

/// PostgreSQL-backed tuple repository
pub struct PostgresTupleRepository {
    pool: DatabasePool,
    max_tuples_per_write: usize,
    max_types_per_authorization_model: usize,
}

impl PostgresTupleRepository {
    pub fn new(pool: DatabasePool, options: &PostgresOptions) -> Self {
        Self {
            pool,
            max_tuples_per_write: options.max_tuples_per_write,
            max_types_per_authorization_model: options.max_types_per_authorization_model,
        }
    }

    /// Connect to `uri`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Connection`] for a malformed URI or an unreachable server.
    pub async fn from_connection_string(
        uri: &str,
        options: &PostgresOptions,
    ) -> StorageResult<Self> {
        let pool = DatabasePool::connect(uri, &options.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self::new(pool, options))
    }

    /// Bring the schema up to the latest registered version.
    ///
    /// # Errors
    ///
    /// Any registry or migration failure; see [`Migrator::up`].
    pub async fn migrate(&self) -> MigrationResult<MigrationReport> {
        let registry = migrations::registry()?;
        let target = PgMigrationTarget::new(self.pool.clone());
        let report = Migrator::new(&registry).up(&target).await?;
        info!(
            from = report.from_version,
            to = report.to_version,
            "PostgreSQL schema migrated"
        );
        Ok(report)
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Rows are pulled from the server as the stream is polled; dropping
    /// the stream releases its pooled connection.
    fn stream_tuples(
        &self,
        ctx: &RequestContext,
        mut query: QueryBuilder<'static, Postgres>,
    ) -> TupleStream {
        let pool = self.pool.pool().clone();
        let ctx = ctx.clone();
        query.push(ORDER_BY_KEY);
        try_stream! {
            let mut rows = query.build().fetch(&pool);
            while let Some(row) = ctx
                .run(async { Ok::<_, StorageError>(rows.try_next().await?) })
                .await?
            {
                yield tuple_from_row(&row)?;
            }
        }
        .boxed()
    }
}

fn select_tuples(store: &str) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!("SELECT {TUPLE_COLUMNS} FROM tuple WHERE store = "));
    query.push_bind(store.to_string());
    query
}

fn key_from_row(row: &PgRow) -> StorageResult<TupleKey> {
    let object_type: String = row.try_get("object_type")?;
    let object_id: String = row.try_get("object_id")?;
    let relation: String = row.try_get("relation")?;
    let user: String = row.try_get("_user")?;
    let condition_name: Option<String> = row.try_get("condition_name")?;
    let condition_context: Option<Vec<u8>> = row.try_get("condition_context")?;

    let mut key = TupleKey::new(
        &format!("{object_type}{OBJECT_TYPE_SEPARATOR}{object_id}"),
        &relation,
        &user,
    );
    if let Some(name) = condition_name.filter(|name| !name.is_empty()) {
        let mut condition = RelationshipCondition::new(&name);
        if let Some(bytes) = condition_context {
            condition = condition.with_context(serde_json::from_slice(&bytes)?);
        }
        key = key.with_condition(condition);
    }
    Ok(key)
}

fn tuple_from_row(row: &PgRow) -> StorageResult<Tuple> {
    let timestamp: DateTime<Utc> = row.try_get("inserted_at")?;
    Ok(Tuple::new(key_from_row(row)?, timestamp))
}

fn condition_columns(key: &TupleKey) -> StorageResult<(Option<String>, Option<Vec<u8>>)> {
    match &key.condition {
        Some(condition) => {
            let context = condition
                .context
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()?;
            Ok((Some(condition.name.clone()), context))
        }
        None => Ok((None, None)),
    }
}

async fn append_changelog(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    store: &str,
    key: &TupleKey,
    operation: TupleOperation,
    timestamp: DateTime<Utc>,
) -> StorageResult<()> {
    let (object_type, object_id) = key.object_parts();
    let (condition_name, condition_context) = condition_columns(key)?;
    sqlx::query(
        "INSERT INTO changelog (store, object_type, object_id, relation, _user, operation, \
         condition_name, condition_context, inserted_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(store)
    .bind(object_type)
    .bind(object_id)
    .bind(&key.relation)
    .bind(&key.user)
    .bind(operation.as_i32())
    .bind(condition_name)
    .bind(condition_context)
    .bind(timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl TupleReader for PostgresTupleRepository {
    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream> {
        validate_filter(filter)?;

        let mut query = select_tuples(store);
        if let Some((object_type, object_id)) = filter.object_parts() {
            query.push(" AND object_type = ").push_bind(object_type.to_string());
            if !object_id.is_empty() {
                query.push(" AND object_id = ").push_bind(object_id.to_string());
            }
        }
        if let Some(relation) = &filter.relation {
            query.push(" AND relation = ").push_bind(relation.clone());
        }
        if let Some(user) = &filter.user {
            query.push(" AND _user = ").push_bind(user.clone());
        }

        debug!(store, "postgres read");
        Ok(self.stream_tuples(ctx, query))
    }

    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read_user_tuple(
        &self,
        ctx: &RequestContext,
        store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple> {
        let (object_type, object_id) = key.object_parts();
        let mut query = select_tuples(store);
        query.push(" AND object_type = ").push_bind(object_type.to_string());
        query.push(" AND object_id = ").push_bind(object_id.to_string());
        query.push(" AND relation = ").push_bind(key.relation.clone());
        query.push(" AND _user = ").push_bind(key.user.clone());

        let row = ctx
            .run(async {
                Ok::<_, StorageError>(query.build().fetch_optional(self.pool.pool()).await?)
            })
            .await?
            .ok_or(StorageError::NotFound)?;
        tuple_from_row(&row)
    }

    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read_userset_tuples(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream> {
        let (object_type, object_id) = filter
            .object
            .split_once(OBJECT_TYPE_SEPARATOR)
            .unwrap_or((filter.object.as_str(), ""));
        let mut query = select_tuples(store);
        query.push(" AND object_type = ").push_bind(object_type.to_string());
        query.push(" AND object_id = ").push_bind(object_id.to_string());
        query.push(" AND relation = ").push_bind(filter.relation.clone());
        query
            .push(" AND user_type = ")
            .push_bind(UserType::Userset.as_str());

        Ok(self.stream_tuples(ctx, query))
    }
}

#[async_trait]
impl TupleWriter for PostgresTupleRepository {
    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn write(
        &self,
        ctx: &RequestContext,
        store: &str,
        inserts: &[TupleKey],
        deletes: &[TupleKey],
    ) -> StorageResult<()> {
        validate_write(inserts, deletes, self.max_tuples_per_write)?;

        ctx.run(async {
            // dropping the transaction on any early return rolls it back
            let mut tx = self.pool.pool().begin().await?;
            let now = Utc::now();

            for key in deletes {
                let (object_type, object_id) = key.object_parts();
                let removed = sqlx::query(
                    "DELETE FROM tuple WHERE store = $1 AND object_type = $2 AND object_id = $3 \
                     AND relation = $4 AND _user = $5 \
                     RETURNING object_type, object_id, relation, _user, condition_name, condition_context",
                )
                .bind(store)
                .bind(object_type)
                .bind(object_id)
                .bind(&key.relation)
                .bind(&key.user)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(row) = removed else {
                    return Err(StorageError::InvalidWriteInput(format!(
                        "cannot delete a tuple which does not exist: {key}"
                    )));
                };
                append_changelog(&mut tx, store, &key_from_row(&row)?, TupleOperation::Delete, now)
                    .await?;
            }

            for key in inserts {
                let (object_type, object_id) = key.object_parts();
                let (condition_name, condition_context) = condition_columns(key)?;
                let inserted = sqlx::query(
                    "INSERT INTO tuple (store, object_type, object_id, relation, _user, user_type, \
                     condition_name, condition_context, inserted_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT (store, object_type, object_id, relation, _user) DO NOTHING",
                )
                .bind(store)
                .bind(object_type)
                .bind(object_id)
                .bind(&key.relation)
                .bind(&key.user)
                .bind(key.user_type().as_str())
                .bind(condition_name)
                .bind(condition_context)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if inserted.rows_affected() == 0 {
                    return Err(StorageError::InvalidWriteInput(format!(
                        "cannot write a tuple which already exists: {key}"
                    )));
                }
                append_changelog(&mut tx, store, key, TupleOperation::Write, now).await?;
            }

            tx.commit().await?;
            debug!(store, inserts = inserts.len(), deletes = deletes.len(), "postgres write committed");
            Ok::<(), StorageError>(())
        })
        .await
    }
}

#[async_trait]
impl ChangelogReader for PostgresTupleRepository {
    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read_changes(
        &self,
        ctx: &RequestContext,
        store: &str,
        query: &ChangesQuery,
    ) -> StorageResult<ChangesPage> {
        let horizon_secs = query.horizon_offset.num_milliseconds() as f64 / 1000.0;

        let mut sql = QueryBuilder::<Postgres>::new(
            "SELECT id, object_type, object_id, relation, _user, operation, condition_name, \
             condition_context, inserted_at FROM changelog WHERE store = ",
        );
        sql.push_bind(store.to_string());
        sql.push(" AND inserted_at <= NOW() - make_interval(secs => ")
            .push_bind(horizon_secs)
            .push(")");
        if let Some(object_type) = &query.object_type {
            sql.push(" AND object_type = ").push_bind(object_type.clone());
        }
        if let Some(after) = query.after {
            sql.push(" AND id > ").push_bind(after);
        }
        sql.push(" ORDER BY id LIMIT ")
            .push_bind(i64::try_from(query.page_size).unwrap_or(i64::MAX));

        let rows = ctx
            .run(async { Ok::<_, StorageError>(sql.build().fetch_all(self.pool.pool()).await?) })
            .await?;

        let entries = rows
            .iter()
            .map(|row| {
                let raw_operation: i32 = row.try_get("operation")?;
                let operation = TupleOperation::from_i32(raw_operation).ok_or_else(|| {
                    StorageError::Internal(format!("unknown changelog operation {raw_operation}"))
                })?;
                Ok(ChangelogEntry {
                    sequence: row.try_get("id")?,
                    key: key_from_row(row)?,
                    operation,
                    timestamp: row.try_get("inserted_at")?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let continuation = entries.last().map(|entry| entry.sequence);
        Ok(ChangesPage {
            entries,
            continuation,
        })
    }
}

#[async_trait]
impl TupleRepository for PostgresTupleRepository {
    fn max_tuples_per_write(&self) -> usize {
        self.max_tuples_per_write
    }

    fn max_types_per_authorization_model(&self) -> usize {
        self.max_types_per_authorization_model
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
