mod routes;

use axum::{
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::{metrics::MetricsRegistry, service::CronjobService, sync::SyncMonitor, Error};

pub struct Server {
    service: Arc<CronjobService>,
    metrics: Arc<MetricsRegistry>,
    synchronizers: SyncMonitor,
    shutdown: CancellationToken,
}

impl Server {
    /// Open streams are closed once `shutdown` fires so the server can drain.
    pub fn new(
        service: Arc<CronjobService>,
        metrics: Arc<MetricsRegistry>,
        synchronizers: SyncMonitor,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            metrics,
            synchronizers,
            shutdown,
        }
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/cronjobs/stream", get(routes::stream_cronjobs))
            .route("/cronjobs/{namespace}/{name}/stream", get(routes::stream_cronjob))
            .route("/cronjobs/{namespace}/{name}/pods/stream", get(routes::stream_cronjob_pods))
            .route("/cronjobs/{namespace}/{name}/raw", get(routes::cron_job_raw))
            .route("/jobs/stream", get(routes::stream_job_runs))
            .route("/jobs/{namespace}/{name}/raw", get(routes::job_raw))
            .route("/pods/{namespace}/{name}/raw", get(routes::pod_raw))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Maps crate errors onto HTTP responses with a JSON body.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Kubernetes(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
