//! HTTP surface: JSON CRUD over every collection, fronted by bearer auth.
//!
//! Handlers translate [`MutationOutcome`](crate::concurrency::MutationOutcome)
//! variants into status codes; a conflict becomes a 409 carrying the server's
//! current state so the client can merge and retry.

pub mod auth;
pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;

use crate::concurrency::{Conflict, ConflictReason};
use crate::core::{Document, StoreError};
use crate::model::EntityFields;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Body of a 409. `clientVersion` is serialized as `null` when the client
/// sent none.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub error: &'static str,
    pub message: String,
    pub conflict_data: ConflictData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    pub entity: &'static str,
    pub reason: ConflictReason,
    pub client_version: Option<u64>,
    pub server_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_file_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_file_timestamp: Option<DateTime<Utc>>,
    pub server_data: Option<Document>,
}

impl<T: EntityFields> From<Conflict<T>> for ConflictResponse {
    fn from(conflict: Conflict<T>) -> Self {
        let server_data = conflict
            .server_data
            .as_ref()
            .and_then(|record| record.to_public().ok());
        Self {
            error: "CONFLICT",
            message: conflict.message,
            conflict_data: ConflictData {
                entity: conflict.entity.label(),
                reason: conflict.reason,
                client_version: conflict.client_version,
                server_version: conflict.server_version,
                modified_by: conflict.modified_by,
                last_modified_at: conflict.last_modified_at,
                client_file_timestamp: conflict.client_file_timestamp,
                server_file_timestamp: conflict.server_file_timestamp,
                server_data,
            },
        }
    }
}

#[derive(Debug)]
pub enum WebError {
    Store(StoreError),
    Input(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(Box<ConflictResponse>),
    Internal(String),
}

impl From<StoreError> for WebError {
    fn from(err: StoreError) -> Self {
        WebError::Store(err)
    }
}

impl<T: EntityFields> From<Box<Conflict<T>>> for WebError {
    fn from(conflict: Box<Conflict<T>>) -> Self {
        WebError::Conflict(Box::new(ConflictResponse::from(*conflict)))
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            WebError::Conflict(body) => {
                return (StatusCode::CONFLICT, Json(*body)).into_response();
            }
            WebError::Store(err) => {
                error!(error = %err, "storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                    "storage_error",
                )
            }
            WebError::Input(msg) => (StatusCode::BAD_REQUEST, msg, "validation_error"),
            WebError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, "unauthorized"),
            WebError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, "forbidden"),
            WebError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "not_found"),
            WebError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg, "internal_error")
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;
