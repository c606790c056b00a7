use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use encoder_engine::{NewStream, StreamError};

use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  Messages
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStreamRequest {
    pub topic: String,
    pub recipient_key: String,
    pub datastore_target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStreamResponse {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteStreamRequest {
    pub uid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteStreamResponse {}

/// Twirp error body: `{"code": "...", "msg": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwirpError {
    pub code: String,
    pub msg: String,
}

impl TwirpError {
    fn new(code: &str, msg: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            msg: msg.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.code.as_str() {
            "invalid_argument" | "malformed" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "already_exists" => StatusCode::CONFLICT,
            "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StreamError> for TwirpError {
    fn from(err: StreamError) -> Self {
        match &err {
            StreamError::InvalidArgument(msg) => TwirpError::new("invalid_argument", msg.clone()),
            StreamError::Conflict(_) => TwirpError::new("already_exists", err.to_string()),
            StreamError::NotFound(_) => TwirpError::new("not_found", err.to_string()),
            StreamError::Unavailable(_) => TwirpError::new("unavailable", err.to_string()),
            StreamError::Internal(_) => TwirpError::new("internal", err.to_string()),
        }
    }
}

impl From<JsonRejection> for TwirpError {
    fn from(rejection: JsonRejection) -> Self {
        TwirpError::new("malformed", rejection.body_text())
    }
}

impl IntoResponse for TwirpError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

const CREATE_STREAM: &str = "CreateStream";
const DELETE_STREAM: &str = "DeleteStream";

// ═══════════════════════════════════════════════════════════════
//  POST {prefix}/CreateStream
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_create_stream(
    State(state): State<AppState>,
    body: Result<Json<CreateStreamRequest>, JsonRejection>,
) -> Result<Json<CreateStreamResponse>, TwirpError> {
    let started = state.rpc.received(CREATE_STREAM);
    let outcome = create_stream(&state, body).await;
    state.rpc.answered(CREATE_STREAM, code_of(&outcome), started);
    outcome
}

async fn create_stream(
    state: &AppState,
    body: Result<Json<CreateStreamRequest>, JsonRejection>,
) -> Result<Json<CreateStreamResponse>, TwirpError> {
    let Json(req) = body?;
    let topic = req.topic.clone();

    match state
        .manager
        .create_stream(NewStream {
            topic: req.topic,
            recipient_key: req.recipient_key,
            datastore_target: req.datastore_target,
        })
        .await
    {
        Ok(uid) => Ok(Json(CreateStreamResponse { uid })),
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "CreateStream failed");
            Err(e.into())
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  POST {prefix}/DeleteStream
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_delete_stream(
    State(state): State<AppState>,
    body: Result<Json<DeleteStreamRequest>, JsonRejection>,
) -> Result<Json<DeleteStreamResponse>, TwirpError> {
    let started = state.rpc.received(DELETE_STREAM);
    let outcome = delete_stream(&state, body).await;
    state.rpc.answered(DELETE_STREAM, code_of(&outcome), started);
    outcome
}

async fn delete_stream(
    state: &AppState,
    body: Result<Json<DeleteStreamRequest>, JsonRejection>,
) -> Result<Json<DeleteStreamResponse>, TwirpError> {
    let Json(req) = body?;
    if req.uid.trim().is_empty() {
        return Err(TwirpError::new("invalid_argument", "uid must not be empty"));
    }

    match state.manager.delete_stream(&req.uid).await {
        Ok(()) => Ok(Json(DeleteStreamResponse {})),
        Err(e) => {
            tracing::warn!(uid = %req.uid, error = %e, "DeleteStream failed");
            Err(e.into())
        }
    }
}

fn code_of<T>(outcome: &Result<T, TwirpError>) -> &str {
    match outcome {
        Ok(_) => "ok",
        Err(e) => &e.code,
    }
}
