//! Instrumented reader used by decorator tests.

use crate::{
    context::RequestContext,
    error::{StorageError, StorageResult},
    models::*,
    repository::{tuple_stream, TupleReader, TupleStream},
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Counts calls and tracks how many run at once.
pub(crate) struct ProbeReader {
    tuples: Vec<Tuple>,
    delay: Duration,
    failure: Option<StorageError>,
    first_failure: Option<StorageError>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProbeReader {
    pub(crate) fn new(keys: &[TupleKey]) -> Self {
        Self {
            tuples: keys
                .iter()
                .map(|key| Tuple::new(key.clone(), Utc::now()))
                .collect(),
            delay: Duration::ZERO,
            failure: None,
            first_failure: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing(err: StorageError) -> Self {
        let mut probe = Self::new(&[]);
        probe.failure = Some(err);
        probe
    }

    /// Fails only the first call with `err`, as when the caller that
    /// started a load hits its own deadline.
    pub(crate) fn failing_once(mut self, err: StorageError) -> Self {
        self.first_failure = Some(err);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> StorageResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (&self.failure, &self.first_failure) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(err)) if call == 1 => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn matching<F: Fn(&TupleKey) -> bool>(&self, predicate: F) -> Vec<Tuple> {
        self.tuples
            .iter()
            .filter(|tuple| predicate(&tuple.key))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TupleReader for ProbeReader {
    async fn read(
        &self,
        _ctx: &RequestContext,
        _store: &str,
        filter: &TupleFilter,
    ) -> StorageResult<TupleStream> {
        self.enter().await?;
        Ok(tuple_stream(self.matching(|key| filter.matches(key))))
    }

    async fn read_user_tuple(
        &self,
        _ctx: &RequestContext,
        _store: &str,
        key: &TupleKey,
    ) -> StorageResult<Tuple> {
        self.enter().await?;
        self.matching(|candidate| candidate.identity() == key.identity())
            .into_iter()
            .next()
            .ok_or(StorageError::NotFound)
    }

    async fn read_userset_tuples(
        &self,
        _ctx: &RequestContext,
        _store: &str,
        filter: &UsersetFilter,
    ) -> StorageResult<TupleStream> {
        self.enter().await?;
        Ok(tuple_stream(self.matching(|key| filter.matches(key))))
    }
}
