//! HTTP surface over the datastore stack.

use crate::datastore::DatastoreStack;
use crate::error::ApiError;
use auth_gateway::{require_authentication, Authenticator};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use telemetry::MetricsRegistry;
use tower_http::trace::TraceLayer;
use zanzibar_storage::{
    collect_tuples, ChangelogReader, ChangesPage, ChangesQuery, RequestContext, Tuple, TupleFilter,
    TupleKey, TupleReader, TupleWriter, UsersetFilter,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub datastore: Arc<DatastoreStack>,
    pub metrics: MetricsRegistry,
    pub request_timeout: Option<Duration>,
    pub changelog_horizon_offset: chrono::Duration,
    pub changes_page_size: usize,
}

impl AppState {
    /// Fresh per-request context carrying the configured deadline.
    fn request_context(&self) -> RequestContext {
        match self.request_timeout {
            Some(timeout) => RequestContext::with_timeout(timeout),
            None => RequestContext::background(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TuplesResponse {
    pub tuples: Vec<Tuple>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub writes: Vec<TupleKey>,
    #[serde(default)]
    pub deletes: Vec<TupleKey>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangesParams {
    #[serde(rename = "type")]
    pub object_type: Option<String>,
    pub after: Option<i64>,
}

/// Build the router; store routes require authentication when an
/// authenticator is configured.
pub fn create_router(state: AppState, authenticator: Option<Arc<dyn Authenticator>>) -> Router {
    let mut stores = Router::new()
        .route("/stores/:store/read", post(read))
        .route("/stores/:store/read-user-tuple", post(read_user_tuple))
        .route("/stores/:store/read-userset-tuples", post(read_userset_tuples))
        .route("/stores/:store/write", post(write))
        .route("/stores/:store/changes", get(read_changes));

    if let Some(authenticator) = authenticator {
        stores = stores.route_layer(middleware::from_fn_with_state(
            authenticator,
            require_authentication,
        ));
    }

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .merge(stores)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn read(
    State(state): State<AppState>,
    Path(store): Path<String>,
    Json(filter): Json<TupleFilter>,
) -> Result<Json<TuplesResponse>, ApiError> {
    let ctx = state.request_context();
    let stream = state.datastore.read(&ctx, &store, &filter).await?;
    let tuples = ctx.run(collect_tuples(stream)).await?;
    Ok(Json(TuplesResponse { tuples }))
}

async fn read_user_tuple(
    State(state): State<AppState>,
    Path(store): Path<String>,
    Json(key): Json<TupleKey>,
) -> Result<Json<Tuple>, ApiError> {
    let ctx = state.request_context();
    let tuple = state.datastore.read_user_tuple(&ctx, &store, &key).await?;
    Ok(Json(tuple))
}

async fn read_userset_tuples(
    State(state): State<AppState>,
    Path(store): Path<String>,
    Json(filter): Json<UsersetFilter>,
) -> Result<Json<TuplesResponse>, ApiError> {
    let ctx = state.request_context();
    let stream = state
        .datastore
        .read_userset_tuples(&ctx, &store, &filter)
        .await?;
    let tuples = ctx.run(collect_tuples(stream)).await?;
    Ok(Json(TuplesResponse { tuples }))
}

async fn write(
    State(state): State<AppState>,
    Path(store): Path<String>,
    Json(request): Json<WriteRequest>,
) -> Result<StatusCode, ApiError> {
    let ctx = state.request_context();
    state
        .datastore
        .write(&ctx, &store, &request.writes, &request.deletes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_changes(
    State(state): State<AppState>,
    Path(store): Path<String>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<ChangesPage>, ApiError> {
    let ctx = state.request_context();
    let query = ChangesQuery {
        object_type: params.object_type,
        horizon_offset: state.changelog_horizon_offset,
        page_size: state.changes_page_size,
        after: params.after,
    };
    let page = state.datastore.read_changes(&ctx, &store, &query).await?;
    Ok(Json(page))
}
