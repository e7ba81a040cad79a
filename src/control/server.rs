//! HTTP control server

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ControlConfig;
use crate::control::handlers;
use crate::engine::AudioPipeline;
use crate::error::{Error, Result};

/// Shared state for handlers
pub struct ControlState {
    pub pipeline: Arc<AudioPipeline>,
    pub started_at: Instant,
}

/// Build the API router
pub fn router(pipeline: Arc<AudioPipeline>) -> Router {
    let state = Arc::new(ControlState {
        pipeline,
        started_at: Instant::now(),
    });

    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/capture/start", post(handlers::start_capture))
        .route("/api/capture/stop", post(handlers::stop_capture))
        .route("/api/playback/start", post(handlers::start_playback))
        .route("/api/playback/stop", post(handlers::stop_playback))
        .route(
            "/api/peers",
            post(handlers::add_peer).delete(handlers::clear_peers),
        )
        .route("/api/codec", get(handlers::get_codec).post(handlers::set_codec))
        .route("/api/packets", post(handlers::enqueue_packet))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Control server bound to the configured address
pub struct ControlServer {
    config: ControlConfig,
    pipeline: Arc<AudioPipeline>,
}

impl ControlServer {
    pub fn new(config: ControlConfig, pipeline: Arc<AudioPipeline>) -> Self {
        Self { config, pipeline }
    }

    pub fn address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("control bind address: {}", e)))
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = self.address()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Control API listening on http://{}", addr);

        axum::serve(listener, router(self.pipeline))
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Control API stopped");
        Ok(())
    }
}
