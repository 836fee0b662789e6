use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use http::{header, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{ApiError, Server};
use crate::Error;

// One refresh worth of backlog per subscriber is plenty.
const STREAM_BUFFER: usize = 4;

pub async fn health(State(server): State<Arc<Server>>) -> Response {
    let synchronizers = server.synchronizers.snapshot();
    let (status, label) = if server.synchronizers.is_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (status, Json(json!({ "status": label, "synchronizers": synchronizers }))).into_response()
}

pub async fn metrics(State(server): State<Arc<Server>>) -> Result<String, ApiError> {
    Ok(server.metrics.render()?)
}

fn sse<T: Serialize + Send + 'static>(
    server: &Server,
    rx: mpsc::Receiver<T>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = ReceiverStream::new(rx)
        .take_until(server.shutdown.clone().cancelled_owned())
        .map(|message| Event::default().json_data(message));
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn log_stream_end(stream: &str, result: crate::Result<()>) {
    match result {
        Ok(()) | Err(Error::SubscriberGone) => debug!(stream, "Subscriber went away"),
        Err(e) => warn!(stream, "Stream ended: {}", e),
    }
}

pub async fn stream_cronjobs(
    State(server): State<Arc<Server>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let service = server.service.clone();
    tokio::spawn(async move {
        log_stream_end("cronjobs", service.stream_cronjobs(tx).await);
    });
    sse(&server, rx)
}

pub async fn stream_cronjob(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    server.service.find_cron_job(&namespace, &name).await?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let service = server.service.clone();
    tokio::spawn(async move {
        log_stream_end("cronjob", service.stream_cronjob(&namespace, &name, tx).await);
    });
    Ok(sse(&server, rx))
}

pub async fn stream_cronjob_pods(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    server.service.find_cron_job(&namespace, &name).await?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let service = server.service.clone();
    tokio::spawn(async move {
        log_stream_end("cronjob pods", service.stream_cronjob_pods(&namespace, &name, tx).await);
    });
    Ok(sse(&server, rx))
}

pub async fn stream_job_runs(
    State(server): State<Arc<Server>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let service = server.service.clone();
    tokio::spawn(async move {
        log_stream_end("jobs", service.stream_job_runs(tx).await);
    });
    sse(&server, rx)
}

fn yaml(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/yaml")], body).into_response()
}

pub async fn cron_job_raw(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    Ok(yaml(server.service.get_cron_job_raw(&namespace, &name).await?))
}

pub async fn job_raw(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    Ok(yaml(server.service.get_job_raw(&namespace, &name).await?))
}

pub async fn pod_raw(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    Ok(yaml(server.service.get_pod_raw(&namespace, &name).await?))
}
