//! Prometheus metrics owned by the process rather than a global recorder.

use crate::error::{Result, TelemetryError};
use ::metrics::{Counter, Histogram, Key, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::fmt;
use std::sync::Arc;

/// Shared handle to a Prometheus recorder.
///
/// Components register their instruments here at construction time; the
/// HTTP layer renders the text exposition from the same registry. Cloning
/// is cheap and every clone sees the same series.
#[derive(Clone)]
pub struct MetricsRegistry {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// A registry with no custom histogram buckets.
    pub fn new() -> Self {
        Self::from_recorder(PrometheusBuilder::new().build_recorder())
    }

    pub fn builder() -> MetricsRegistryBuilder {
        MetricsRegistryBuilder::default()
    }

    fn from_recorder(recorder: PrometheusRecorder) -> Self {
        let handle = recorder.handle();
        Self {
            recorder: Arc::new(recorder),
            handle,
        }
    }

    /// Register (or look up) the histogram called `name`.
    pub fn histogram(&self, name: &'static str) -> Histogram {
        self.recorder
            .register_histogram(&Key::from_static_name(name), &metadata())
    }

    /// Register (or look up) the counter called `name`.
    pub fn counter(&self, name: &'static str) -> Counter {
        self.recorder
            .register_counter(&Key::from_static_name(name), &metadata())
    }

    /// Prometheus text exposition of every registered series.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Configures bucket boundaries before the recorder is built.
#[derive(Default)]
pub struct MetricsRegistryBuilder {
    buckets: Vec<(String, Vec<f64>)>,
}

impl MetricsRegistryBuilder {
    /// Render `name` as a histogram with these upper bounds instead of a summary.
    pub fn histogram_buckets(mut self, name: &str, buckets: &[f64]) -> Self {
        self.buckets.push((name.to_string(), buckets.to_vec()));
        self
    }

    /// # Errors
    ///
    /// Fails if a bucket list is empty.
    pub fn build(self) -> Result<MetricsRegistry> {
        let mut builder = PrometheusBuilder::new();
        for (name, buckets) in self.buckets {
            builder = builder
                .set_buckets_for_metric(Matcher::Full(name.clone()), &buckets)
                .map_err(|e| TelemetryError::Metrics(format!("{name}: {e}")))?;
        }
        Ok(MetricsRegistry::from_recorder(builder.build_recorder()))
    }
}
