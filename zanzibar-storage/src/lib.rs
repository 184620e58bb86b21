//! Relationship tuple storage for the ReBAC engine
//!
//! This crate mediates every read and write of relationship tuples between
//! the authorization logic and a physical store:
//! - A storage port ([`TupleReader`], [`TupleWriter`], [`ChangelogReader`],
//!   [`TupleRepository`]) implemented by every engine and decorator
//! - In-memory and PostgreSQL physical engines
//! - A concurrency-bounded reader protecting the engine from read fan-out
//! - An LRU caching reader that short-circuits repeated reads
//!
//! # Core Concepts
//!
//! - **Tuple**: `user` has `relation` on `object`, optionally guarded by a condition
//! - **Store**: tenant scope; tuples, changelog and cache entries are partitioned by it
//! - **Changelog**: append-only record of every mutation, read behind a horizon offset
//!
//! # Example
//!
//! ```rust
//! use std::num::NonZeroUsize;
//! use std::sync::Arc;
//! use telemetry::MetricsRegistry;
//! use zanzibar_storage::{
//!     BoundedConcurrencyTupleReader, CachedTupleReader, InMemoryTupleRepository,
//!     RequestContext, TupleKey, TupleReader, TupleWriter, BOUNDED_READ_DELAY_HISTOGRAM,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = MetricsRegistry::new();
//! let engine = Arc::new(InMemoryTupleRepository::new());
//! let stack = CachedTupleReader::new(
//!     BoundedConcurrencyTupleReader::new(
//!         engine,
//!         NonZeroUsize::new(8).unwrap(),
//!         metrics.histogram(BOUNDED_READ_DELAY_HISTOGRAM),
//!     ),
//!     10_000,
//! );
//!
//! let ctx = RequestContext::background();
//! let key = TupleKey::new("document:roadmap", "viewer", "user:anne");
//! stack.write(&ctx, "store-1", &[key.clone()], &[]).await?;
//! let tuple = stack.read_user_tuple(&ctx, "store-1", &key).await?;
//! assert_eq!(tuple.key, key);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod models;
pub mod repository;
pub mod wrappers;

pub use context::{CancelHandle, RequestContext};
pub use error::{StorageError, StorageResult};
pub use models::*;
pub use repository::{
    collect_tuples, tuple_stream, ChangelogReader, InMemoryTupleRepository, PostgresOptions,
    PostgresTupleRepository, TupleReader, TupleRepository, TupleStream, TupleWriter,
};
pub use wrappers::{
    BoundedConcurrencyTupleReader, CachedTupleReader, Fingerprint, ReadKind,
    BOUNDED_READ_DELAY_BUCKETS_MS, BOUNDED_READ_DELAY_HISTOGRAM, TIME_WAITING_SPAN_ATTRIBUTE,
};
