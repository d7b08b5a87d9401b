use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Extension;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::Response;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use qrelay_provider_core::{RelayContext, RelayError, RelayMode};

use crate::core::CoreState;
use crate::orchestrator::{RelayResponse, relay_text};

pub async fn chat_completions(
    State(state): State<Arc<CoreState>>,
    Extension(ctx): Extension<RelayContext>,
    body: Bytes,
) -> Response {
    relay(state, ctx, RelayMode::ChatCompletions, None, body).await
}

pub async fn completions(
    State(state): State<Arc<CoreState>>,
    Extension(ctx): Extension<RelayContext>,
    body: Bytes,
) -> Response {
    relay(state, ctx, RelayMode::Completions, None, body).await
}

pub async fn embeddings(
    State(state): State<Arc<CoreState>>,
    Extension(ctx): Extension<RelayContext>,
    body: Bytes,
) -> Response {
    relay(state, ctx, RelayMode::Embeddings, None, body).await
}

pub async fn engine_embeddings(
    State(state): State<Arc<CoreState>>,
    Path(model): Path<String>,
    Extension(ctx): Extension<RelayContext>,
    body: Bytes,
) -> Response {
    relay(state, ctx, RelayMode::Embeddings, Some(model), body).await
}

pub async fn moderations(
    State(state): State<Arc<CoreState>>,
    Extension(ctx): Extension<RelayContext>,
    body: Bytes,
) -> Response {
    relay(state, ctx, RelayMode::Moderations, None, body).await
}

pub async fn edits(
    State(state): State<Arc<CoreState>>,
    Extension(ctx): Extension<RelayContext>,
    body: Bytes,
) -> Response {
    relay(state, ctx, RelayMode::Edits, None, body).await
}

async fn relay(
    state: Arc<CoreState>,
    ctx: RelayContext,
    relay_mode: RelayMode,
    path_model: Option<String>,
    body: Bytes,
) -> Response {
    let started_at = Instant::now();
    let request_id = ctx.request_id.clone();

    match relay_text(state, ctx, relay_mode, path_model, body).await {
        Ok(RelayResponse::Json { status, body }) => {
            info!(
                event = "relay_completed",
                request_id = %request_id,
                status = status.as_u16(),
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = false
            );
            json_response(status, body)
        }
        Ok(RelayResponse::Stream { body }) => {
            info!(
                event = "relay_completed",
                request_id = %request_id,
                status = 200,
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = true
            );
            sse_response(body)
        }
        Err(err) => {
            warn!(
                event = "relay_failed",
                request_id = %request_id,
                status = err.status.as_u16(),
                code = %err.error.code,
                error = %err.error.message,
                elapsed_ms = started_at.elapsed().as_millis()
            );
            error_response(&err)
        }
    }
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn sse_response(body: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(body).map(Ok::<Bytes, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn error_response(err: &RelayError) -> Response {
    let mut response = Response::new(Body::from(err.to_body()));
    *response.status_mut() = err.status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
