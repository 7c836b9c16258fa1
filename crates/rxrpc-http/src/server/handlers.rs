//! HTTP request handlers for the polling listener.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tracing::{debug, warn};

use super::state::ListenerState;
use crate::{CLIENT_ID_HEADER, CONNECT_PATH, MESSAGE_PATH, POLLING_PATH};

/// Create the axum router for the polling endpoints.
pub(crate) fn router(state: Arc<ListenerState>) -> Router {
    Router::new()
        .route(CONNECT_PATH, post(handle_connect))
        .route(MESSAGE_PATH, post(handle_message))
        .route(POLLING_PATH, post(handle_polling))
        .with_state(state)
}

/// POST /connect
async fn handle_connect(State(state): State<Arc<ListenerState>>) -> Response {
    let _ = state.evict_idle();
    let Some(client_id) = state.connect() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match HeaderValue::from_str(&client_id) {
        Ok(value) => {
            let mut headers = HeaderMap::new();
            let _ = headers.insert(CLIENT_ID_HEADER, value);
            (StatusCode::OK, headers).into_response()
        }
        Err(e) => {
            warn!(error = %e, "client id is not a valid header value");
            state.remove(&client_id);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// POST /message
async fn handle_message(
    State(state): State<Arc<ListenerState>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let Some(client_id) = extract_client_id(&headers) else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(slot) = state.client(client_id) else {
        return StatusCode::NOT_FOUND;
    };

    match slot.deliver(body) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            debug!(client_id, error = %e, "server side no longer reads messages");
            StatusCode::GONE
        }
    }
}

/// POST /polling
async fn handle_polling(State(state): State<Arc<ListenerState>>, headers: HeaderMap) -> Response {
    let Some(client_id) = extract_client_id(&headers) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(slot) = state.client(client_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let drained = slot.drain();
    if drained.finished && drained.messages.is_empty() {
        state.remove(client_id);
        return StatusCode::GONE.into_response();
    }
    if !drained.messages.is_empty() {
        debug!(client_id, count = drained.messages.len(), "delivering messages");
    }
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain")],
        drained.messages.join("\n"),
    )
        .into_response()
}

fn extract_client_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
