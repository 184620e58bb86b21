//! Storage port: the reader/writer contract every physical engine and every
//! decorator implements.

use crate::{
    context::RequestContext,
    error::{StorageError, StorageResult},
    models::*,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;

pub mod memory;
pub mod migrations;
pub mod postgres;

pub use memory::InMemoryTupleRepository;
pub use postgres::{PostgresOptions, PostgresTupleRepository};

/// Lazy, finite, non-restartable sequence of tuples.
///
/// A failure mid-stream is surfaced as an `Err` item on the next pull.
/// Dropping the stream releases whatever it holds.
pub type TupleStream = BoxStream<'static, StorageResult<Tuple>>;

/// Build a stream over an already materialized set of tuples.
pub fn tuple_stream<I>(tuples: I) -> TupleStream
where
    I: IntoIterator<Item = Tuple>,
    I::IntoIter: Send + 'static,
{
    stream::iter(tuples.into_iter().map(Ok)).boxed()
}

/// Drain a stream into a vector, stopping at the first error.
///
/// # Errors
///
/// Returns the first error the stream yields.
pub async fn collect_tuples(stream: TupleStream) -> StorageResult<Vec<Tuple>> {
    stream.try_collect().await
}

/// Read side of the storage port.
#[async_trait]
pub trait TupleReader: Send + Sync {
    /// Tuples matching `filter`, in an engine-defined but stable order.
    async fn read(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream>;

    /// The tuple with exactly `key`'s identity, or [`StorageError::NotFound`].
    async fn read_user_tuple(
        &self,
        ctx: &RequestContext,
        store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple>;

    /// Userset and wildcard tuples on the filter's object and relation.
    async fn read_userset_tuples(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream>;
}

/// Write side of the storage port.
#[async_trait]
pub trait TupleWriter: Send + Sync {
    /// Apply `deletes` then `inserts` as one atomic unit: all or nothing.
    async fn write(
        &self,
        ctx: &RequestContext,
        store: &str,
        inserts: &[TupleKey],
        deletes: &[TupleKey],
    ) -> StorageResult<()>;
}

/// Changelog side of the storage port.
#[async_trait]
pub trait ChangelogReader: Send + Sync {
    async fn read_changes(
        &self,
        ctx: &RequestContext,
        store: &str,
        query: &ChangesQuery,
    ) -> StorageResult<ChangesPage>;
}

/// A complete physical engine (or a decorator standing in for one).
#[async_trait]
pub trait TupleRepository: TupleReader + TupleWriter + ChangelogReader {
    /// Maximum inserts plus deletes accepted by one write
    fn max_tuples_per_write(&self) -> usize;

    /// Maximum type definitions accepted in one authorization model
    fn max_types_per_authorization_model(&self) -> usize;

    /// Release connections and other engine resources.
    async fn close(&self) -> StorageResult<()>;
}

#[async_trait]
impl<T: TupleReader + ?Sized> TupleReader for Arc<T> {
    async fn read(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream> {
        (**self).read(ctx, store, filter).await
    }

    async fn read_user_tuple(
        &self,
        ctx: &RequestContext,
        store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple> {
        (**self).read_user_tuple(ctx, store, key).await
    }

    async fn read_userset_tuples(
        &self,
        ctx: &RequestContext,
        store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream> {
        (**self).read_userset_tuples(ctx, store, filter).await
    }
}

#[async_trait]
impl<T: TupleWriter + ?Sized> TupleWriter for Arc<T> {
    async fn write(
        &self,
        ctx: &RequestContext,
        store: &str,
        inserts: &[TupleKey],
        deletes: &[TupleKey],
    ) -> StorageResult<()> {
        (**self).write(ctx, store, inserts, deletes).await
    }
}

#[async_trait]
impl<T: ChangelogReader + ?Sized> ChangelogReader for Arc<T> {
    async fn read_changes(
        &self,
        ctx: &RequestContext,
        store: &str,
        query: &ChangesQuery,
    ) -> StorageResult<ChangesPage> {
        (**self).read_changes(ctx, store, query).await
    }
}

#[async_trait]
impl<T: TupleRepository + ?Sized> TupleRepository for Arc<T> {
    fn max_tuples_per_write(&self) -> usize {
        (**self).max_tuples_per_write()
    }

    fn max_types_per_authorization_model(&self) -> usize {
        (**self).max_types_per_authorization_model()
    }

    async fn close(&self) -> StorageResult<()> {
        (**self).close().await
    }
}

/// Reject filters that would scan an entire store.
pub(crate) fn validate_filter(filter: &TupleFilter) -> StorageResult<()> {
    let has_type = filter
        .object_parts()
        .is_some_and(|(object_type, _)| !object_type.is_empty());
    if !has_type && filter.user.is_none() {
        return Err(StorageError::InvalidFilter(
            "an object type or a user is required".to_string(),
        ));
    }
    Ok(())
}

/// Checks shared by every engine before a write touches storage.
pub(crate) fn validate_write(
    inserts: &[TupleKey],
    deletes: &[TupleKey],
    max_tuples_per_write: usize,
) -> StorageResult<()> {
    let actual = inserts.len() + deletes.len();
    if actual > max_tuples_per_write {
        return Err(StorageError::ExceededWriteBatchLimit {
            limit: max_tuples_per_write,
            actual,
        });
    }

    let mut seen = std::collections::HashSet::with_capacity(actual);
    for key in deletes.iter().chain(inserts) {
        let (object_type, object_id) = key.object_parts();
        if object_type.is_empty() || object_id.is_empty() || key.relation.is_empty() || key.user.is_empty() {
            return Err(StorageError::InvalidWriteInput(format!(
                "incomplete tuple key: {key}"
            )));
        }
        if !seen.insert(key.identity()) {
            return Err(StorageError::InvalidWriteInput(format!(
                "duplicate tuple in write request: {key}"
            )));
        }
    }
    Ok(())
}
