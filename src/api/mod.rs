//! HTTP gateway: one upload endpoint and a health probe.
//!
//! ```text
//! POST /process-cin/   multipart `file` → 200 {..aggregated.., warnings}
//!                                       → 400 | 502 | 504 {error: {stage, kind, message}}
//! GET  /health         → 200 {status, module, version, uptime_seconds}
//! ```
//!
//! The coordinator future runs inside the request task. If the client goes
//! away, hyper drops that task and the run is cancelled with it.

pub mod error;
pub mod health;
pub mod process;

pub use error::ApiError;
pub use health::health_routes;
pub use process::process_routes;

use crate::config::GatewayConfig;
use crate::coordinator::PipelineCoordinator;
use crate::error::GatewayError;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Multipart framing allowance on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared, read-only state for every request.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PipelineCoordinator>,
    pub max_upload_bytes: usize,
    pub started: Instant,
}

impl AppState {
    pub fn new(coordinator: Arc<PipelineCoordinator>, max_upload_bytes: usize) -> Self {
        Self {
            coordinator,
            max_upload_bytes,
            started: Instant::now(),
        }
    }

    /// State over HTTP stage transports, built from validated configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let coordinator = PipelineCoordinator::from_config(config)?;
        Ok(Self::new(Arc::new(coordinator), config.max_upload_bytes))
    }
}

/// The full gateway router.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);
    Router::new()
        .merge(process_routes())
        .merge(health_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
