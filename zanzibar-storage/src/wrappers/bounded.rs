//! Concurrency-bounded reader.

use crate::{
    context::RequestContext,
    error::{StorageError, StorageResult},
    models::*,
    repository::{ChangelogReader, TupleReader, TupleRepository, TupleStream, TupleWriter},
};
use async_trait::async_trait;
use metrics::Histogram;
use opentelemetry::{trace::get_active_span, KeyValue};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

/// Histogram observing how long reads waited for a slot, in milliseconds.
pub const BOUNDED_READ_DELAY_HISTOGRAM: &str = "datastore_bounded_read_delay_ms";

/// Bucket upper bounds for [`BOUNDED_READ_DELAY_HISTOGRAM`].
pub const BOUNDED_READ_DELAY_BUCKETS_MS: [f64; 9] =
    [1.0, 3.0, 5.0, 10.0, 25.0, 50.0, 100.0, 1000.0, 5000.0];

/// Attribute set on the caller's active span with the wait in whole milliseconds.
pub const TIME_WAITING_SPAN_ATTRIBUTE: &str = "time_waiting";

/// Limits how many reads run against the wrapped reader at once.
///
/// Each read takes one permit before delegating and gives it back when the
/// call returns, whatever the outcome. Waiting honours the caller's
/// [`RequestContext`]; a caller that gives up never holds a permit. Results
/// and errors from the wrapped reader are returned untouched.
pub struct BoundedConcurrencyTupleReader<R> {
    inner: R,
    limiter: Arc<Semaphore>,
    capacity: usize,
    wait_histogram: Histogram,
}

impl<R> BoundedConcurrencyTupleReader<R> {
    pub fn new(inner: R, concurrency: NonZeroUsize, wait_histogram: Histogram) -> Self {
        Self {
            inner,
            limiter: Arc::new(Semaphore::new(concurrency.get())),
            capacity: concurrency.get(),
            wait_histogram,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held by a read.
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    async fn acquire(&self, ctx: &RequestContext) -> StorageResult<OwnedSemaphorePermit> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let started = Instant::now();
        let permit = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            permit = Arc::clone(&self.limiter).acquire_owned() => permit
                .map_err(|_| StorageError::Internal("read limiter closed".to_string()))?,
        };

        self.observe_wait(started.elapsed());
        Ok(permit)
    }

    fn observe_wait(&self, waited: Duration) {
        self.wait_histogram.record(waited.as_secs_f64() * 1000.0);

        let millis = i64::try_from(waited.as_millis()).unwrap_or(i64::MAX);
        get_active_span(|span| {
            span.set_attribute(KeyValue::new(TIME_WAITING_SPAN_ATTRIBUTE, millis));
        });
        trace!(waited_ms = millis, "acquired read slot");
    }
}

#[async_trait]
impl<R: TupleReader> TupleReader for BoundedConcurrencyTupleReader<R> {
    async fn read(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream> {
        let _permit = self.acquire(ctx).await?;
        self.inner.read(ctx, store, filter).await
    }

    async fn read_user_tuple(
        &self,
        ctx: &RequestContext,
        store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple> {
        let _permit = self.acquire(ctx).await?;
        self.inner.read_user_tuple(ctx, store, key).await
    }

    async fn read_userset_tuples(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream> {
        let _permit = self.acquire(ctx).await?;
        self.inner.read_userset_tuples(ctx, store, filter).await
    }
}

#[async_trait]
impl<R: TupleWriter> TupleWriter for BoundedConcurrencyTupleReader<R> {
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
impl<R: ChangelogReader> ChangelogReader for BoundedConcurrencyTupleReader<R> {
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
impl<R: TupleRepository> TupleRepository for BoundedConcurrencyTupleReader<R> {
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
