//! Read decorators layered over a physical engine.
//!
//! Stack order is fixed: [`CachedTupleReader`] wraps
//! [`BoundedConcurrencyTupleReader`] which wraps the engine, so cache hits
//! never contend for a read slot. Both forward writes, changelog reads and
//! engine lifecycle calls untouched.

pub mod bounded;
pub mod caching;

#[cfg(test)]
pub(crate) mod testing;

pub use bounded::{
    BoundedConcurrencyTupleReader, BOUNDED_READ_DELAY_BUCKETS_MS, BOUNDED_READ_DELAY_HISTOGRAM,
    TIME_WAITING_SPAN_ATTRIBUTE,
};
pub use caching::{CachedTupleReader, Fingerprint, ReadKind};
