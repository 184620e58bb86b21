//! Observability for the ReBAC engine.
//!
//! - [`init_tracing`] installs the process-wide `tracing` subscriber,
//!   text for development or JSON for production
//! - [`MetricsRegistry`] owns a Prometheus recorder that components
//!   register histograms and counters against, and renders the
//!   exposition served on `/metrics`
//!
//! # Example
//!
//! ```rust
//! use telemetry::MetricsRegistry;
//!
//! let registry = MetricsRegistry::builder()
//!     .histogram_buckets("request_duration_ms", &[1.0, 10.0, 100.0])
//!     .build()
//!     .unwrap();
//! registry.histogram("request_duration_ms").record(4.0);
//! assert!(registry.render().contains("request_duration_ms_count 1"));
//! ```

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Result, TelemetryError};
pub use logging::{init_tracing, LogFormat, LogSettings};
pub use self::metrics::{MetricsRegistry, MetricsRegistryBuilder};
