//! Physical engine selection and the read decorator stack.

use crate::error::{ServerError, ServerResult};
use config_engine::ServiceConfig;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use telemetry::MetricsRegistry;
use tracing::{error, info, warn};
use zanzibar_storage::{
    BoundedConcurrencyTupleReader, CachedTupleReader, InMemoryTupleRepository, PostgresOptions,
    PostgresTupleRepository, TupleRepository, BOUNDED_READ_DELAY_BUCKETS_MS,
    BOUNDED_READ_DELAY_HISTOGRAM,
};

/// Cache in front of the concurrency bound in front of the engine.
pub type DatastoreStack =
    CachedTupleReader<BoundedConcurrencyTupleReader<Arc<dyn TupleRepository>>>;

/// The physical engines the server can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatastoreEngine {
    Memory,
    Postgres,
}

impl DatastoreEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            DatastoreEngine::Memory => "memory",
            DatastoreEngine::Postgres => "postgres",
        }
    }
}

impl fmt::Display for DatastoreEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatastoreEngine {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(DatastoreEngine::Memory),
            "postgres" => Ok(DatastoreEngine::Postgres),
            other => Err(ServerError::Configuration(format!(
                "unsupported datastore engine '{other}'"
            ))),
        }
    }
}

/// Metrics registry carrying the bucket layout of every server histogram.
///
/// # Errors
///
/// Fails if the Prometheus recorder rejects the bucket configuration.
pub fn metrics_registry() -> ServerResult<MetricsRegistry> {
    Ok(MetricsRegistry::builder()
        .histogram_buckets(BOUNDED_READ_DELAY_HISTOGRAM, &BOUNDED_READ_DELAY_BUCKETS_MS)
        .build()?)
}

/// Construct the configured engine and bring its schema up to date.
///
/// # Errors
///
/// [`ServerError::Configuration`] when a required parameter is missing,
/// [`ServerError::Connection`] when the engine cannot be reached and
/// [`ServerError::Migration`] when pending migrations fail.
pub async fn open_engine(
    engine: DatastoreEngine,
    config: &ServiceConfig,
) -> ServerResult<Arc<dyn TupleRepository>> {
    match engine {
        DatastoreEngine::Memory => {
            info!("Using in-memory datastore");
            Ok(Arc::new(InMemoryTupleRepository::with_limits(
                config.max_tuples_per_write,
                config.max_types_per_authorization_model,
            )))
        }
        DatastoreEngine::Postgres => {
            let uri = config.datastore_uri.as_deref().ok_or_else(|| {
                ServerError::Configuration("the postgres engine requires datastore_uri".to_string())
            })?;
            let options = PostgresOptions {
                max_tuples_per_write: config.max_tuples_per_write,
                max_types_per_authorization_model: config.max_types_per_authorization_model,
                ..PostgresOptions::default()
            };
            let repository = PostgresTupleRepository::from_connection_string(uri, &options).await?;

            if let Err(e) = repository.migrate().await {
                error!("Schema migration failed: {}", e);
                if let Err(close_err) = repository.close().await {
                    warn!("Closing datastore after failed migration: {}", close_err);
                }
                return Err(e.into());
            }

            info!("Using PostgreSQL datastore");
            Ok(Arc::new(repository))
        }
    }
}

/// Wrap `engine` as cache over concurrency bound over engine.
///
/// Cache hits never contend for the bound; only misses reach it.
///
/// # Errors
///
/// [`ServerError::Configuration`] for a zero concurrency bound or cache size.
pub fn build_datastore_stack(
    engine: Arc<dyn TupleRepository>,
    config: &ServiceConfig,
    metrics: &MetricsRegistry,
) -> ServerResult<DatastoreStack> {
    let concurrency = NonZeroUsize::new(config.datastore_max_concurrent_reads).ok_or_else(|| {
        ServerError::Configuration("datastore_max_concurrent_reads must be at least 1".to_string())
    })?;
    if config.datastore_max_cache_size == 0 {
        return Err(ServerError::Configuration(
            "datastore_max_cache_size must be at least 1".to_string(),
        ));
    }

    let bounded = BoundedConcurrencyTupleReader::new(
        engine,
        concurrency,
        metrics.histogram(BOUNDED_READ_DELAY_HISTOGRAM),
    );
    info!(
        max_concurrent_reads = concurrency.get(),
        max_cache_size = config.datastore_max_cache_size,
        "Datastore read stack assembled"
    );
    Ok(CachedTupleReader::new(bounded, config.datastore_max_cache_size))
}
