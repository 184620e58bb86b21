//! ReBAC engine server
//!
//! Composition root of the datastore service: it selects the physical
//! engine, applies schema migrations, stacks the caching and
//! concurrency-bounded readers over the engine, wires authentication and
//! metrics, and exposes the run/close lifecycle.

pub mod datastore;
pub mod error;
pub mod routes;
pub mod server;

pub use datastore::{
    build_datastore_stack, metrics_registry, open_engine, DatastoreEngine, DatastoreStack,
};
pub use error::{ApiError, ApiErrorResponse, ServerError, ServerResult};
pub use routes::{create_router, AppState, TuplesResponse, WriteRequest};
pub use server::Server;
