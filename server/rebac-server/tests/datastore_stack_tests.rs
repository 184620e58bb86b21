use async_trait::async_trait;
use config_engine::ServiceConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use rebac_server::{build_datastore_stack, metrics_registry};
use zanzibar_storage::{
    collect_tuples, ChangelogReader, ChangesPage, ChangesQuery, InMemoryTupleRepository,
    RequestContext, StorageResult, Tuple, TupleFilter, TupleKey, TupleReader, TupleRepository,
    TupleStream, TupleWriter, UsersetFilter, BOUNDED_READ_DELAY_HISTOGRAM,
};

/// Engine wrapper that counts reads and records peak read concurrency.
struct CountingRepository {
    inner: InMemoryTupleRepository,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingRepository {
    fn new(inner: InMemoryTupleRepository) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    async fn observe<T>(&self, read: impl std::future::Future<Output = T>) -> T {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        let result = read.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl TupleReader for CountingRepository {
    async fn read(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream> {
        self.observe(self.inner.read(ctx, store, filter)).await
    }

    async fn read_user_tuple(
        &self,
        ctx: &RequestContext,
        store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple> {
        self.observe(self.inner.read_user_tuple(ctx, store, key)).await
    }

    async fn read_userset_tuples(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream> {
        self.observe(self.inner.read_userset_tuples(ctx, store, filter))
            .await
    }
}

#[async_trait]
impl TupleWriter for CountingRepository {
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
impl ChangelogReader for CountingRepository {
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
impl TupleRepository for CountingRepository {
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

fn config(max_concurrent_reads: usize, max_cache_size: u64) -> ServiceConfig {
    ServiceConfig {
        datastore_max_concurrent_reads: max_concurrent_reads,
        datastore_max_cache_size: max_cache_size,
        ..ServiceConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_reads_reach_engine_once() {
    let engine = Arc::new(CountingRepository::new(InMemoryTupleRepository::new()));
    let metrics = metrics_registry().unwrap();
    let stack = Arc::new(
        build_datastore_stack(
            Arc::clone(&engine) as Arc<dyn TupleRepository>,
            &config(2, 10),
            &metrics,
        )
        .unwrap(),
    );

    let ctx = RequestContext::background();
    let key = TupleKey::new("document:roadmap", "viewer", "user:anne");
    stack.write(&ctx, "store-1", &[key.clone()], &[]).await.unwrap();

    let reads: Vec<_> = (0..5)
        .map(|_| {
            let stack = Arc::clone(&stack);
            let key = key.clone();
            tokio::spawn(async move {
                stack
                    .read_user_tuple(&RequestContext::background(), "store-1", &key)
                    .await
            })
        })
        .collect();

    for read in reads {
        assert_eq!(read.await.unwrap().unwrap().key, key);
    }

    assert_eq!(engine.reads.load(Ordering::SeqCst), 1);
    assert!(engine.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_misses_respect_concurrency_bound() {
    let engine = Arc::new(CountingRepository::new(InMemoryTupleRepository::new()));
    let metrics = metrics_registry().unwrap();
    let stack = Arc::new(
        build_datastore_stack(
            Arc::clone(&engine) as Arc<dyn TupleRepository>,
            &config(2, 10),
            &metrics,
        )
        .unwrap(),
    );

    let reads: Vec<_> = (0..6)
        .map(|i| {
            let stack = Arc::clone(&stack);
            tokio::spawn(async move {
                let filter = TupleFilter::new().object(&format!("document:{i}"));
                let stream = stack
                    .read(&RequestContext::background(), "store-1", &filter)
                    .await?;
                collect_tuples(stream).await
            })
        })
        .collect();

    for read in reads {
        assert!(read.await.unwrap().unwrap().is_empty());
    }

    assert_eq!(engine.reads.load(Ordering::SeqCst), 6);
    assert!(engine.peak.load(Ordering::SeqCst) <= 2);
    assert!(metrics
        .render()
        .contains(&format!("{BOUNDED_READ_DELAY_HISTOGRAM}_count 6")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cache_hit_does_not_wait_on_exhausted_bound() {
    let engine = Arc::new(CountingRepository::new(InMemoryTupleRepository::new()));
    let metrics = metrics_registry().unwrap();
    let stack = Arc::new(
        build_datastore_stack(
            Arc::clone(&engine) as Arc<dyn TupleRepository>,
            &config(1, 10),
            &metrics,
        )
        .unwrap(),
    );

    let ctx = RequestContext::background();
    let cached = TupleFilter::new().object("folder:");
    collect_tuples(stack.read(&ctx, "store-1", &cached).await.unwrap())
        .await
        .unwrap();

    // a slow miss occupies the only unit
    let slow = tokio::spawn({
        let stack = Arc::clone(&stack);
        async move {
            let filter = TupleFilter::new().object("document:");
            stack
                .read(&RequestContext::background(), "store-1", &filter)
                .await
                .map(drop)
        }
    });
    while stack.inner().available_permits() > 0 {
        tokio::task::yield_now().await;
    }

    let hit = tokio::time::timeout(
        Duration::from_millis(10),
        stack.read(&ctx, "store-1", &cached),
    )
    .await;
    assert!(hit.is_ok());

    slow.await.unwrap().unwrap();
    assert_eq!(engine.reads.load(Ordering::SeqCst), 2);
}
