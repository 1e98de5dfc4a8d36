//! HTTP route handlers.

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;

use crate::bridge::protocol::WorkerId;
use crate::master::Master;

#[derive(Debug, Deserialize)]
pub struct WorkerQuery {
    /// Target worker id.
    pub n: Option<String>,
}

fn bad_input(msg: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

fn server_error(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "Exception while processing request");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// Strings go out as plain text, everything else as JSON.
fn content_response(content: Value) -> Response {
    match content {
        Value::String(text) => (StatusCode::OK, text).into_response(),
        other => (StatusCode::OK, Json(other)).into_response(),
    }
}

/// Sends `{}` as a request to worker `n` and returns its response content.
async fn request_worker(State(master): State<Master>, Query(query): Query<WorkerQuery>) -> Response {
    let Some(n) = query.n else {
        return bad_input("Need process number!");
    };
    let worker = WorkerId::from(n);

    match master.send_request(serde_json::json!({}), Some(&worker)).await {
        Ok(content) => {
            tracing::info!(worker_id = %worker, response = %content, "Sending response");
            content_response(content)
        }
        Err(e) => server_error(e),
    }
}

/// Sends a `{}` note to worker `n`, or to every worker without `n`.
async fn message_worker(State(master): State<Master>, Query(query): Query<WorkerQuery>) -> Response {
    let worker = query.n.map(WorkerId::from);

    match master.send_msg(serde_json::json!({}), worker.as_ref()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => server_error(e),
    }
}

pub fn routes(master: Master) -> Router {
    Router::new()
        .route("/slaves/request", get(request_worker))
        .route("/slaves/message", get(message_worker))
        .with_state(master)
}
