//! Server lifecycle with deferred startup.
//!
//! `new()` wires state, `start()` binds the listener (so callers learn the
//! port before traffic flows), and `serve()` runs until the shutdown future
//! resolves, then drains.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    count_handler, create_handler, delete_handler, health_handler, list_handler,
    liveness_handler, readiness_handler, update_handler, usage_handler, ws_upgrade_handler,
    AppState, Services,
};
use super::middleware::{admission, bind_tenant, build_http_layers};
use super::shutdown::ShutdownController;

/// Upper bound on how long draining waits for requests and sockets.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NetworkModule {
    config: NetworkConfig,
    services: Services,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, services: Services) -> Self {
        Self {
            config,
            services,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `GET /ws`: realtime upgrade, authenticated in-band
    /// - `/api/v1/records/{entity}`: `POST` create, `GET` list, `PATCH`
    ///   update by filter, `DELETE` by filter
    /// - `GET /api/v1/records/{entity}/count`
    /// - `GET /api/v1/usage/{resource}`
    ///
    /// API routes pass admission (ready state, in-flight tracking) and then
    /// tenant binding before any handler runs.
    pub fn build_router(&self) -> Router {
        let state = AppState::new(
            self.services.clone(),
            Arc::clone(&self.shutdown),
            Arc::new(self.config.clone()),
        );

        let api = Router::new()
            .route(
                "/api/v1/records/{entity}",
                post(create_handler)
                    .get(list_handler)
                    .patch(update_handler)
                    .delete(delete_handler),
            )
            .route("/api/v1/records/{entity}/count", get(count_handler))
            .route("/api/v1/usage/{resource}", get(usage_handler))
            .route_layer(from_fn_with_state(state.clone(), bind_tenant))
            .route_layer(from_fn_with_state(state.clone(), admission));

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/ws", get(ws_upgrade_handler))
            .merge(api)
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// When the signal fires the health state moves to `Draining`: readiness
    /// fails, new API requests get 503, and realtime sessions are closed.
    /// Draining waits up to 30 seconds for in-flight work.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, TLS material cannot be
    /// loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();
        let ctrl = Arc::clone(&self.shutdown);

        let signal_ctrl = Arc::clone(&ctrl);
        let signal = async move {
            shutdown.await;
            signal_ctrl.trigger_shutdown();
        };

        ctrl.set_ready();
        match self.config.tls {
            Some(ref tls) => serve_tls(listener, router, tls, signal).await?,
            None => {
                info!("serving plain HTTP/WS");
                axum::serve(listener, router)
                    .with_graceful_shutdown(signal)
                    .await?;
            }
        }

        if ctrl.wait_for_drain(DRAIN_TIMEOUT).await {
            info!("drained cleanly");
        } else {
            warn!(
                in_flight = ctrl.in_flight_count(),
                "drain timeout expired with work in flight"
            );
        }
        Ok(())
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let on_signal = handle.clone();
    tokio::spawn(async move {
        signal.await;
        on_signal.graceful_shutdown(Some(DRAIN_TIMEOUT));
    });

    info!(%addr, "serving TLS");
    axum_server::from_tcp_rustls(std_listener, rustls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
