//! Caching reader.
//!
//! Read results are materialized into snapshots keyed by a [`Fingerprint`]
//! of `(store, read kind, filter)`. Entries leave the cache only through
//! least-recently-used eviction; writes never invalidate them, so a read
//! may observe data up to one cache lifetime stale. Callers needing strict
//! consistency read through the engine directly.

use crate::{
    context::RequestContext,
    error::{StorageError, StorageResult},
    models::*,
    repository::{
        collect_tuples, tuple_stream, ChangelogReader, TupleReader, TupleRepository, TupleStream,
        TupleWriter,
    },
};
use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Which reader operation produced a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Read,
    ReadUserTuple,
    ReadUsersetTuples,
}

impl ReadKind {
    fn tag(self) -> u8 {
        match self {
            ReadKind::Read => 1,
            ReadKind::ReadUserTuple => 2,
            ReadKind::ReadUsersetTuples => 3,
        }
    }
}

/// Deterministic cache key: SHA-256 over length-prefixed parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// `fields` are the filter's parts in a fixed order; `None` and `Some("")`
    /// hash differently.
    pub fn new(store: &str, kind: ReadKind, fields: &[Option<&str>]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(len_prefix(store));
        hasher.update(store.as_bytes());
        hasher.update([kind.tag()]);
        for field in fields {
            match field {
                Some(value) => {
                    hasher.update([1]);
                    hasher.update(len_prefix(value));
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0]),
            }
        }
        Self(hasher.finalize().into())
    }

    pub fn of_filter(store: &str, filter: &TupleFilter) -> Self {
        Self::new(
            store,
            ReadKind::Read,
            &[
                filter.object.as_deref(),
                filter.relation.as_deref(),
                filter.user.as_deref(),
            ],
        )
    }

    /// Condition fields are not part of a tuple's identity and are ignored.
    pub fn of_key(store: &str, key: &TupleKey) -> Self {
        Self::new(
            store,
            ReadKind::ReadUserTuple,
            &[
                Some(key.object.as_str()),
                Some(key.relation.as_str()),
                Some(key.user.as_str()),
            ],
        )
    }

    pub fn of_userset_filter(store: &str, filter: &UsersetFilter) -> Self {
        Self::new(
            store,
            ReadKind::ReadUsersetTuples,
            &[Some(filter.object.as_str()), Some(filter.relation.as_str())],
        )
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

fn len_prefix(value: &str) -> [u8; 8] {
    (value.len() as u64).to_be_bytes()
}

#[derive(Clone)]
enum Snapshot {
    Tuples(Arc<Vec<Tuple>>),
    Tuple(Tuple),
}

/// Serves repeated reads from a bounded LRU cache.
///
/// Concurrent misses on one fingerprint are coalesced: a single call
/// reaches the wrapped reader and every waiter shares its result. Errors,
/// `NotFound` included, are returned but never cached.
pub struct CachedTupleReader<R> {
    inner: R,
    cache: Cache<Fingerprint, Snapshot>,
    capacity: u64,
}

impl<R> CachedTupleReader<R> {
    pub fn new(inner: R, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            inner,
            cache,
            capacity,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether a snapshot for `fingerprint` is currently cached.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.cache.contains_key(fingerprint)
    }

    async fn snapshot<L, F>(
        &self,
        ctx: &RequestContext,
        fingerprint: Fingerprint,
        load: L,
    ) -> StorageResult<Snapshot>
    where
        L: Fn() -> F + Sync,
        F: Future<Output = StorageResult<Snapshot>> + Send,
    {
        loop {
            let loaded_here = AtomicBool::new(false);
            let result = ctx
                .run(async {
                    let init = async {
                        loaded_here.store(true, Ordering::Relaxed);
                        load().await
                    };
                    self.cache
                        .entry(fingerprint)
                        .or_try_insert_with(init)
                        .await
                        .map_err(unshare)
                })
                .await;

            let entry = match result {
                // another caller's cancellation must not fail this one
                Err(err)
                    if err.is_cancellation()
                        && !loaded_here.load(Ordering::Relaxed)
                        && ctx.err().is_none() =>
                {
                    debug!(fingerprint = %fingerprint.to_hex(), "shared load cancelled, retrying");
                    continue;
                }
                other => other?,
            };

            if entry.is_fresh() {
                // Flushes moka's pending read/write log so LRU order is exact
                // for the next lookup. Runs once per miss, not on hits.
                self.cache.run_pending_tasks().await;
                debug!(fingerprint = %fingerprint.to_hex(), "cache miss");
            } else {
                debug!(fingerprint = %fingerprint.to_hex(), "cache hit");
            }
            return Ok(entry.into_value());
        }
    }
}

fn unshare(err: Arc<StorageError>) -> StorageError {
    Arc::try_unwrap(err).unwrap_or_else(|shared| (*shared).clone())
}

#[async_trait]
impl<R: TupleReader> TupleReader for CachedTupleReader<R> {
    async fn read(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream> {
        let load = || async {
            let stream = self.inner.read(ctx, store, filter).await?;
            Ok::<_, StorageError>(Snapshot::Tuples(Arc::new(collect_tuples(stream).await?)))
        };
        match self.snapshot(ctx, Fingerprint::of_filter(store, filter), load).await? {
            Snapshot::Tuples(tuples) => Ok(tuple_stream(tuples.as_ref().clone())),
            Snapshot::Tuple(_) => Err(mismatched_snapshot()),
        }
    }

    async fn read_user_tuple(
        &self,
        ctx: &RequestContext,
        store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple> {
        let load = || async {
            Ok::<_, StorageError>(Snapshot::Tuple(
                self.inner.read_user_tuple(ctx, store, key).await?,
            ))
        };
        match self.snapshot(ctx, Fingerprint::of_key(store, key), load).await? {
            Snapshot::Tuple(tuple) => Ok(tuple),
            Snapshot::Tuples(_) => Err(mismatched_snapshot()),
        }
    }

    async fn read_userset_tuples(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream> {
        let load = || async {
            let stream = self.inner.read_userset_tuples(ctx, store, filter).await?;
            Ok::<_, StorageError>(Snapshot::Tuples(Arc::new(collect_tuples(stream).await?)))
        };
        match self
            .snapshot(ctx, Fingerprint::of_userset_filter(store, filter), load)
            .await?
        {
            Snapshot::Tuples(tuples) => Ok(tuple_stream(tuples.as_ref().clone())),
            Snapshot::Tuple(_) => Err(mismatched_snapshot()),
        }
    }
}

// The read kind is hashed into every fingerprint, so this is unreachable
// short of a SHA-256 collision.
fn mismatched_snapshot() -> StorageError {
    StorageError::Internal("cached snapshot does not match the read kind".to_string())
}

#[async_trait]
impl<R: TupleWriter> TupleWriter for CachedTupleReader<R> {
    async fn write(
        &self,
        ctx: &RequestContext,
        store: &str,
        inserts: &[TupleKey],
        deletes: &[TupleKey],
    ) -> StorageResult<()> {
        self.inner.write(ctx, store, inserts, deletes).await
    }
}

#[async_trait]
impl<R: ChangelogReader> ChangelogReader for CachedTupleReader<R> {
    async fn read_changes(
        &self,
        ctx: &RequestContext,
        store: &str,
        query: &ChangesQuery,
    ) -> StorageResult<ChangesPage> {
        self.inner.read_changes(ctx, store, query).await
    }
}

#[async_trait]
impl<R: TupleRepository> TupleRepository for CachedTupleReader<R> {
    fn max_tuples_per_write(&self) -> usize {
        self.inner.max_tuples_per_write()
    }

    fn max_types_per_authorization_model(&self) -> usize {
        self.inner.max_types_per_authorization_model()
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryTupleRepository;
    use crate::wrappers::testing::ProbeReader;
    use std::time::Duration;

    const STORE: &str = "01HCACHE";

    fn keys() -> Vec<TupleKey> {
        vec![
            TupleKey::new("doc:1", "viewer", "user:anne"),
            TupleKey::new("doc:1", "viewer", "group:eng#member"),
            TupleKey::new("doc:2", "viewer", "user:bob"),
            TupleKey::new("doc:3", "viewer", "user:*"),
        ]
    }

    async fn read_all<R: TupleReader>(reader: &R, filter: &TupleFilter) -> Vec<Tuple> {
        collect_tuples(
            reader
                .read(&RequestContext::background(), STORE, filter)
                .await
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_fingerprint_separates_kind_store_and_absent_fields() {
        let filter = TupleFilter::new().object("doc:1").relation("viewer");
        let userset = UsersetFilter::new("doc:1", "viewer");

        assert_eq!(
            Fingerprint::of_filter(STORE, &filter),
            Fingerprint::of_filter(STORE, &filter.clone())
        );
        assert_ne!(
            Fingerprint::of_filter(STORE, &filter),
            Fingerprint::of_userset_filter(STORE, &userset)
        );
        assert_ne!(
            Fingerprint::of_filter(STORE, &filter),
            Fingerprint::of_filter("other", &filter)
        );
        assert_ne!(
            Fingerprint::of_filter(STORE, &TupleFilter::new().object("doc:1")),
            Fingerprint::of_filter(STORE, &TupleFilter::new().object("doc:1").relation(""))
        );
        // length prefixes keep field boundaries apart
        assert_ne!(
            Fingerprint::new(STORE, ReadKind::Read, &[Some("ab"), Some("c")]),
            Fingerprint::new(STORE, ReadKind::Read, &[Some("a"), Some("bc")])
        );
    }

    #[tokio::test]
    async fn test_back_to_back_reads_hit_downstream_once() {
        let probe = Arc::new(ProbeReader::new(&keys()));
        let reader = CachedTupleReader::new(Arc::clone(&probe), 10);
        let filter = TupleFilter::new().object("doc:1");

        let first = read_all(&reader, &filter).await;
        let second = read_all(&reader, &filter).await;

        assert_eq!(probe.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_user_tuple_hit_returns_cached_tuple() {
        let probe = Arc::new(ProbeReader::new(&keys()));
        let reader = CachedTupleReader::new(Arc::clone(&probe), 10);
        let key = TupleKey::new("doc:2", "viewer", "user:bob");
        let ctx = RequestContext::background();

        let first = reader.read_user_tuple(&ctx, STORE, &key).await.unwrap();
        let second = reader.read_user_tuple(&ctx, STORE, &key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_lru_entry_is_evicted_first() {
        let probe = Arc::new(ProbeReader::new(&keys()));
        let reader = CachedTupleReader::new(Arc::clone(&probe), 3);
        let filters: Vec<TupleFilter> = (1..=4)
            .map(|i| TupleFilter::new().object(&format!("doc:{i}")))
            .collect();

        for filter in &filters {
            read_all(&reader, filter).await;
        }
        assert_eq!(probe.calls(), 4);
        assert!(!reader.contains(&Fingerprint::of_filter(STORE, &filters[0])));

        for filter in &filters[1..] {
            read_all(&reader, filter).await;
        }
        assert_eq!(probe.calls(), 4);

        read_all(&reader, &filters[0]).await;
        assert_eq!(probe.calls(), 5);
    }

    #[tokio::test]
    async fn test_recently_used_entry_survives_eviction() {
        let probe = Arc::new(ProbeReader::new(&keys()));
        let reader = CachedTupleReader::new(Arc::clone(&probe), 2);
        let a = TupleFilter::new().object("doc:1");
        let b = TupleFilter::new().object("doc:2");
        let c = TupleFilter::new().object("doc:3");

        read_all(&reader, &a).await;
        read_all(&reader, &b).await;
        read_all(&reader, &a).await;
        read_all(&reader, &c).await;
        assert_eq!(probe.calls(), 3);

        read_all(&reader, &a).await;
        read_all(&reader, &c).await;
        assert_eq!(probe.calls(), 3);

        read_all(&reader, &b).await;
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let probe = Arc::new(ProbeReader::new(&keys()));
        let reader = CachedTupleReader::new(Arc::clone(&probe), 10);
        let missing = TupleKey::new("doc:9", "viewer", "user:nobody");
        let ctx = RequestContext::background();

        assert_eq!(
            reader.read_user_tuple(&ctx, STORE, &missing).await,
            Err(StorageError::NotFound)
        );
        assert_eq!(
            reader.read_user_tuple(&ctx, STORE, &missing).await,
            Err(StorageError::NotFound)
        );
        assert_eq!(probe.calls(), 2);

        let failing = CachedTupleReader::new(
            ProbeReader::failing(StorageError::Connection("down".to_string())),
            10,
        );
        let result = failing
            .read(&ctx, STORE, &TupleFilter::new().object("doc:1"))
            .await
            .map(|_| ());
        assert_eq!(result, Err(StorageError::Connection("down".to_string())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_are_coalesced() {
        let probe = Arc::new(ProbeReader::new(&keys()).with_delay(Duration::from_millis(50)));
        let reader = Arc::new(CachedTupleReader::new(Arc::clone(&probe), 10));
        let key = TupleKey::new("doc:1", "viewer", "user:anne");

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let reader = Arc::clone(&reader);
                let key = key.clone();
                tokio::spawn(async move {
                    reader
                        .read_user_tuple(&RequestContext::background(), STORE, &key)
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().key, key);
        }
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiter_reloads_when_shared_load_hit_another_callers_deadline() {
        let probe = Arc::new(
            ProbeReader::new(&keys())
                .with_delay(Duration::from_millis(50))
                .failing_once(StorageError::DeadlineExceeded),
        );
        let reader = Arc::new(CachedTupleReader::new(Arc::clone(&probe), 10));
        let key = TupleKey::new("doc:1", "viewer", "user:anne");

        let first = {
            let reader = Arc::clone(&reader);
            let key = key.clone();
            tokio::spawn(async move {
                reader
                    .read_user_tuple(&RequestContext::background(), STORE, &key)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = reader
            .read_user_tuple(&RequestContext::background(), STORE, &key)
            .await;

        assert_eq!(first.await.unwrap(), Err(StorageError::DeadlineExceeded));
        assert_eq!(second.unwrap().key, key);
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_own_cancellation_error_is_not_retried() {
        let probe = Arc::new(ProbeReader::failing(StorageError::Cancelled));
        let reader = CachedTupleReader::new(Arc::clone(&probe), 10);

        let result = reader
            .read_user_tuple(
                &RequestContext::background(),
                STORE,
                &TupleKey::new("doc:1", "viewer", "user:anne"),
            )
            .await;

        assert_eq!(result, Err(StorageError::Cancelled));
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_writes_pass_through_without_invalidation() {
        let engine = Arc::new(InMemoryTupleRepository::new());
        let reader = CachedTupleReader::new(Arc::clone(&engine), 10);
        let ctx = RequestContext::background();
        let filter = TupleFilter::new().object("doc:1");
        let key = TupleKey::new("doc:1", "viewer", "user:anne");

        assert!(read_all(&reader, &filter).await.is_empty());

        reader
            .write(&ctx, STORE, std::slice::from_ref(&key), &[])
            .await
            .unwrap();

        // accepted staleness: the cached snapshot is still served
        assert!(read_all(&reader, &filter).await.is_empty());
        assert_eq!(read_all(&engine, &filter).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_is_reported() {
        let probe = Arc::new(ProbeReader::new(&keys()));
        let reader = CachedTupleReader::new(Arc::clone(&probe), 10);
        let (ctx, cancel) = RequestContext::background().with_cancel();
        cancel.cancel();

        let result = reader
            .read(&ctx, STORE, &TupleFilter::new().object("doc:1"))
            .await
            .map(|_| ());

        assert_eq!(result, Err(StorageError::Cancelled));
        assert_eq!(probe.calls(), 0);
    }
}
