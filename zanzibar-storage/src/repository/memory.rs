//! In-memory tuple repository for testing and development

use crate::{
    context::RequestContext,
    error::{StorageError, StorageResult},
    models::*,
    repository::{
        tuple_stream, validate_filter, validate_write, ChangelogReader, TupleReader,
        TupleRepository, TupleStream, TupleWriter,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Default limit on inserts plus deletes in one write
pub const DEFAULT_MAX_TUPLES_PER_WRITE: usize = 100;

/// Default limit on type definitions in one authorization model
pub const DEFAULT_MAX_TYPES_PER_AUTHORIZATION_MODEL: usize = 100;

#[derive(Default)]
struct StoreState {
    /// Ordered by identity, which gives reads a stable order
    tuples: BTreeMap<TupleIdentity, Tuple>,
    changelog: Vec<ChangelogEntry>,
    next_sequence: i64,
}

/// In-memory tuple repository.
///
/// Each store is guarded by its own map shard lock, so a write sees and
/// mutates one store atomically.
pub struct InMemoryTupleRepository {
    stores: Arc<DashMap<String, StoreState>>,
    max_tuples_per_write: usize,
    max_types_per_authorization_model: usize,
}

impl InMemoryTupleRepository {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_MAX_TUPLES_PER_WRITE,
            DEFAULT_MAX_TYPES_PER_AUTHORIZATION_MODEL,
        )
    }

    pub fn with_limits(max_tuples_per_write: usize, max_types_per_authorization_model: usize) -> Self {
        Self {
            stores: Arc::new(DashMap::new()),
            max_tuples_per_write,
            max_types_per_authorization_model,
        }
    }

    fn snapshot<F>(&self, store: &str, predicate: F) -> Vec<Tuple>
    where
        F: Fn(&TupleKey) -> bool,
    {
        self.stores
            .get(store)
            .map(|state| {
                state
                    .tuples
                    .values()
                    .filter(|tuple| predicate(&tuple.key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryTupleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TupleReader for InMemoryTupleRepository {
    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        validate_filter(filter)?;

        let tuples = self.snapshot(store, |key| filter.matches(key));
        debug!(store, found = tuples.len(), "memory read");
        Ok(tuple_stream(tuples))
    }

    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read_user_tuple(
        &self,
        ctx: &RequestContext,
        store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        self.stores
            .get(store)
            .and_then(|state| state.tuples.get(&key.identity()).cloned())
            .ok_or(StorageError::NotFound)
    }

    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read_userset_tuples(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        Ok(tuple_stream(self.snapshot(store, |key| filter.matches(key))))
    }
}

#[async_trait]
impl TupleWriter for InMemoryTupleRepository {
    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn write(
        &self,
        ctx: &RequestContext,
        store: &str,
        inserts: &[TupleKey],
        deletes: &[TupleKey],
    ) -> StorageResult<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        validate_write(inserts, deletes, self.max_tuples_per_write)?;

        let mut state = self.stores.entry(store.to_string()).or_default();

        // Validate everything before mutating so a rejected write leaves no trace
        for key in deletes {
            if !state.tuples.contains_key(&key.identity()) {
                return Err(StorageError::InvalidWriteInput(format!(
                    "cannot delete a tuple which does not exist: {key}"
                )));
            }
        }
        for key in inserts {
            if state.tuples.contains_key(&key.identity()) {
                return Err(StorageError::InvalidWriteInput(format!(
                    "cannot write a tuple which already exists: {key}"
                )));
            }
        }

        let now = Utc::now();
        for key in deletes {
            if let Some(removed) = state.tuples.remove(&key.identity()) {
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                state.changelog.push(ChangelogEntry {
                    sequence,
                    key: removed.key,
                    operation: TupleOperation::Delete,
                    timestamp: now,
                });
            }
        }
        for key in inserts {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state
                .tuples
                .insert(key.identity(), Tuple::new(key.clone(), now));
            state.changelog.push(ChangelogEntry {
                sequence,
                key: key.clone(),
                operation: TupleOperation::Write,
                timestamp: now,
            });
        }

        debug!(store, inserts = inserts.len(), deletes = deletes.len(), "memory write applied");
        Ok(())
    }
}

#[async_trait]
impl ChangelogReader for InMemoryTupleRepository {
    #[instrument(level = "debug", skip_all, fields(store = %store))]
    async fn read_changes(
        &self,
        ctx: &RequestContext,
        store: &str,
        query: &ChangesQuery,
    ) -> StorageResult<ChangesPage> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let horizon = Utc::now() - query.horizon_offset;
        let entries: Vec<ChangelogEntry> = self
            .stores
            .get(store)
            .map(|state| {
                state
                    .changelog
                    .iter()
                    .filter(|entry| query.after.map_or(true, |after| entry.sequence > after))
                    .filter(|entry| entry.timestamp <= horizon)
                    .filter(|entry| {
                        query
                            .object_type
                            .as_deref()
                            .map_or(true, |object_type| entry.key.object_parts().0 == object_type)
                    })
                    .take(query.page_size)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let continuation = entries.last().map(|entry| entry.sequence);
        Ok(ChangesPage {
            entries,
            continuation,
        })
    }
}

#[async_trait]
impl TupleRepository for InMemoryTupleRepository {
    fn max_tuples_per_write(&self) -> usize {
        self.max_tuples_per_write
    }

    fn max_types_per_authorization_model(&self) -> usize {
        self.max_types_per_authorization_model
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::collect_tuples;

    const STORE: &str = "01HSTORE";

    fn ctx() -> RequestContext {
        RequestContext::background()
    }

    #[tokio::test]
    async fn test_in_memory_repository() {
        let repo = InMemoryTupleRepository::new();
        let key = TupleKey::new("document:roadmap", "editor", "user:anne");

        repo.write(&ctx(), STORE, &[key.clone()], &[]).await.unwrap();

        let found = repo.read_user_tuple(&ctx(), STORE, &key).await.unwrap();
        assert_eq!(found.key, key);

        let tuples = collect_tuples(
            repo.read(&ctx(), STORE, &TupleFilter::new().user("user:anne"))
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(tuples.len(), 1);

        repo.write(&ctx(), STORE, &[], &[key.clone()]).await.unwrap();
        assert_eq!(
            repo.read_user_tuple(&ctx(), STORE, &key).await,
            Err(StorageError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_write_is_all_or_nothing() {
        let repo = InMemoryTupleRepository::new();
        let existing = TupleKey::new("document:a", "viewer", "user:anne");
        repo.write(&ctx(), STORE, &[existing.clone()], &[]).await.unwrap();

        let fresh = TupleKey::new("document:b", "viewer", "user:bob");
        let result = repo
            .write(&ctx(), STORE, &[fresh.clone(), existing.clone()], &[])
            .await;
        assert!(matches!(result, Err(StorageError::InvalidWriteInput(_))));

        assert_eq!(
            repo.read_user_tuple(&ctx(), STORE, &fresh).await,
            Err(StorageError::NotFound)
        );
        let page = repo
            .read_changes(&ctx(), STORE, &ChangesQuery::default())
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_missing_tuple_is_rejected() {
        let repo = InMemoryTupleRepository::new();
        let missing = TupleKey::new("document:a", "viewer", "user:anne");
        let result = repo.write(&ctx(), STORE, &[], &[missing]).await;
        assert!(matches!(result, Err(StorageError::InvalidWriteInput(_))));
    }

    #[tokio::test]
    async fn test_write_batch_limit() {
        let repo = InMemoryTupleRepository::with_limits(2, 10);
        let keys: Vec<TupleKey> = (0..3)
            .map(|i| TupleKey::new(&format!("document:{i}"), "viewer", "user:anne"))
            .collect();

        let result = repo.write(&ctx(), STORE, &keys, &[]).await;
        assert_eq!(
            result,
            Err(StorageError::ExceededWriteBatchLimit { limit: 2, actual: 3 })
        );
        assert_eq!(repo.max_tuples_per_write(), 2);
        assert_eq!(repo.max_types_per_authorization_model(), 10);
    }

    #[tokio::test]
    async fn test_read_order_is_stable() {
        let repo = InMemoryTupleRepository::new();
        let keys = [
            TupleKey::new("document:c", "viewer", "user:anne"),
            TupleKey::new("document:a", "viewer", "user:anne"),
            TupleKey::new("document:b", "viewer", "user:anne"),
        ];
        repo.write(&ctx(), STORE, &keys, &[]).await.unwrap();

        let filter = TupleFilter::new().object("document:");
        let first = collect_tuples(repo.read(&ctx(), STORE, &filter).await.unwrap())
            .await
            .unwrap();
        let second = collect_tuples(repo.read(&ctx(), STORE, &filter).await.unwrap())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn test_userset_tuples_include_wildcards() {
        let repo = InMemoryTupleRepository::new();
        repo.write(
            &ctx(),
            STORE,
            &[
                TupleKey::new("document:a", "viewer", "user:anne"),
                TupleKey::new("document:a", "viewer", "group:eng#member"),
                TupleKey::new("document:a", "viewer", "user:*"),
                TupleKey::new("document:a", "owner", "group:eng#member"),
            ],
            &[],
        )
        .await
        .unwrap();

        let tuples = collect_tuples(
            repo.read_userset_tuples(&ctx(), STORE, &UsersetFilter::new("document:a", "viewer"))
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        let users: Vec<&str> = tuples.iter().map(|t| t.key.user.as_str()).collect();
        assert_eq!(users, vec!["group:eng#member", "user:*"]);
    }

    #[tokio::test]
    async fn test_stores_are_isolated() {
        let repo = InMemoryTupleRepository::new();
        let key = TupleKey::new("document:a", "viewer", "user:anne");
        repo.write(&ctx(), "store-a", &[key.clone()], &[]).await.unwrap();

        assert_eq!(
            repo.read_user_tuple(&ctx(), "store-b", &key).await,
            Err(StorageError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_changelog_horizon_hides_recent_changes() {
        let repo = InMemoryTupleRepository::new();
        repo.write(
            &ctx(),
            STORE,
            &[TupleKey::new("document:a", "viewer", "user:anne")],
            &[],
        )
        .await
        .unwrap();

        let hidden = repo
            .read_changes(
                &ctx(),
                STORE,
                &ChangesQuery {
                    horizon_offset: chrono::Duration::minutes(5),
                    ..ChangesQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(hidden.entries.is_empty());
        assert_eq!(hidden.continuation, None);

        let visible = repo
            .read_changes(&ctx(), STORE, &ChangesQuery::default())
            .await
            .unwrap();
        assert_eq!(visible.entries.len(), 1);
        assert_eq!(visible.entries[0].operation, TupleOperation::Write);
    }

    #[tokio::test]
    async fn test_canceled_context_is_rejected() {
        let repo = InMemoryTupleRepository::new();
        let (ctx, handle) = RequestContext::background().with_cancel();
        handle.cancel();

        let result = repo
            .read_user_tuple(&ctx, STORE, &TupleKey::new("document:a", "viewer", "user:anne"))
            .await;
        assert_eq!(result, Err(StorageError::Cancelled));
    }

    #[tokio::test]
    async fn test_filter_without_type_or_user_is_rejected() {
        let repo = InMemoryTupleRepository::new();
        let result = repo
            .read(&ctx(), STORE, &TupleFilter::new().relation("viewer"))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidFilter(_))));
    }
}
