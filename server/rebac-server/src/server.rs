//! Composition root and run/close lifecycle.

use crate::datastore::{self, DatastoreEngine, DatastoreStack};
use crate::error::{ServerError, ServerResult};
use crate::routes::{create_router, AppState};
use auth_gateway::{AuthSettings, Authenticator};
use axum::Router;
use config_engine::ServiceConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telemetry::MetricsRegistry;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use validator::Validate;
use zanzibar_storage::{RequestContext, TupleRepository};

/// A fully wired ReBAC datastore service.
///
/// Construction performs every fallible startup step (engine selection,
/// connection, migrations, authentication) before any listener opens.
pub struct Server {
    config: ServiceConfig,
    addr: SocketAddr,
    engine: DatastoreEngine,
    datastore: Arc<DatastoreStack>,
    metrics: MetricsRegistry,
    authenticator: Option<Arc<dyn Authenticator>>,
    changelog_horizon_offset: chrono::Duration,
    shutdown: watch::Sender<bool>,
    // held shared while serving; close takes it exclusively to wait for the drain
    serving: RwLock<()>,
    engine_closed: AtomicBool,
}

impl Server {
    /// # Errors
    ///
    /// [`ServerError::Configuration`] for invalid options, an unknown engine
    /// or authentication method; [`ServerError::Connection`] and
    /// [`ServerError::Migration`] when the engine cannot be brought up.
    pub async fn new(config: ServiceConfig, metrics: MetricsRegistry) -> ServerResult<Self> {
        config
            .validate()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;

        let engine: DatastoreEngine = config.datastore_engine.parse()?;
        let addr: SocketAddr = config.http_addr.parse().map_err(|e| {
            ServerError::Configuration(format!("invalid http_addr '{}': {e}", config.http_addr))
        })?;
        let changelog_horizon_offset = chrono::Duration::from_std(config.changelog_horizon_offset()).map_err(|e| {
            ServerError::Configuration(format!("changelog horizon offset out of range: {e}"))
        })?;

        let authenticator = AuthSettings {
            method: config.auth_method.clone(),
            preshared_keys: config.preshared_keys.clone(),
            oidc_issuer: config.oidc_issuer.clone(),
            oidc_audience: config.oidc_audience.clone(),
        }
        .build()?;

        let repository = datastore::open_engine(engine, &config).await?;
        let datastore = match datastore::build_datastore_stack(Arc::clone(&repository), &config, &metrics) {
            Ok(stack) => stack,
            Err(e) => {
                if let Err(close_err) = repository.close().await {
                    warn!("Closing datastore after failed startup: {}", close_err);
                }
                return Err(e);
            }
        };

        info!(engine = %engine, addr = %addr, "Server initialized");
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            addr,
            engine,
            datastore: Arc::new(datastore),
            metrics,
            authenticator,
            changelog_horizon_offset,
            shutdown,
            serving: RwLock::new(()),
            engine_closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn engine(&self) -> DatastoreEngine {
        self.engine
    }

    pub fn datastore(&self) -> &Arc<DatastoreStack> {
        &self.datastore
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// The application router, without a listener.
    pub fn router(&self) -> Router {
        let state = AppState {
            datastore: Arc::clone(&self.datastore),
            metrics: self.metrics.clone(),
            request_timeout: self.config.request_timeout(),
            changelog_horizon_offset: self.changelog_horizon_offset,
            changes_page_size: self.config.changes_page_size,
        };
        create_router(state, self.authenticator.clone())
    }

    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// [`ServerError::Network`] when the address cannot be bound.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::Network(format!("failed to bind {}: {e}", self.addr)))
    }

    /// Bind and serve until `ctx` is done or [`Server::close`] is called.
    ///
    /// # Errors
    ///
    /// [`ServerError::Network`] for bind or accept-loop failures.
    pub async fn run(&self, ctx: &RequestContext) -> ServerResult<()> {
        if self.is_closing() {
            return Ok(());
        }
        let listener = self.bind().await?;
        self.serve(listener, ctx).await
    }

    /// Serve on an already bound listener; see [`Server::run`].
    ///
    /// # Errors
    ///
    /// [`ServerError::Network`] if the accept loop fails.
    pub async fn serve(&self, listener: TcpListener, ctx: &RequestContext) -> ServerResult<()> {
        let _serving = self.serving.read().await;
        if self.is_closing() {
            return Ok(());
        }

        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(e.to_string()))?;
        info!(addr = %local_addr, "Serving HTTP");

        let closing = self.shutdown.subscribe();
        let ctx = ctx.clone();
        let signal = async move {
            tokio::select! {
                () = wait_for_close(closing) => {}
                _ = ctx.done() => {}
            }
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| ServerError::Network(e.to_string()))?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Stop accepting requests, drain in-flight ones within `ctx`'s
    /// deadline, then close the engine. Idempotent; safe whether or not
    /// `run` was ever called.
    ///
    /// # Errors
    ///
    /// [`ServerError::Shutdown`] when draining outlives `ctx`, and
    /// [`ServerError::Storage`] when the engine fails to close.
    pub async fn close(&self, ctx: &RequestContext) -> ServerResult<()> {
        self.shutdown.send_replace(true);

        let drained = ctx
            .run(async {
                drop(self.serving.write().await);
                Ok(())
            })
            .await;

        if self.engine_closed.swap(true, Ordering::SeqCst) {
            return drained.map_err(|e| ServerError::Shutdown(e.to_string()));
        }

        if let Err(e) = &drained {
            warn!("In-flight requests did not drain before the deadline: {}", e);
        }
        self.datastore.close().await?;
        info!(engine = %self.engine, "Datastore closed");

        drained.map_err(|e| ServerError::Shutdown(e.to_string()))
    }

    fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }
}

async fn wait_for_close(mut closing: watch::Receiver<bool>) {
    // an error means the server was dropped, which also ends serving
    let _ = closing.wait_for(|closing| *closing).await;
}
