use crate::concurrency::{Applied, MutationOutcome};
use crate::core::{Document, EntityKind, VERSION_FIELD};
use crate::model::{Actor, EntityFields, Record};
use crate::repository::WriteContext;
use crate::storage::BackendKind;
use crate::web::auth::authorize_write;
use crate::web::state::AppState;
use crate::web::{Result as WebResult, WebError};
use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header::IF_MATCH};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const FILE_TIMESTAMP_FIELD: &str = "fileTimestamp";
pub const IF_MATCH_INVALID_ASCII_MESSAGE: &str = "If-Match header must be valid ASCII";
pub const IF_MATCH_INVALID_VERSION_MESSAGE: &str =
    "If-Match header must contain a positive integer version";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_timestamp: Option<DateTime<Utc>>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            file_timestamp: None,
        }
    }

    pub fn with_file_timestamp(mut self, file_timestamp: Option<DateTime<Utc>>) -> Self {
        self.file_timestamp = file_timestamp;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ApiMessage {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedRecord {
    pub id: String,
    pub deleted: bool,
    pub version: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub customer_id: Option<String>,
    pub reference_id: Option<String>,
}

impl ListQuery {
    fn owner(&self) -> Option<&str> {
        self.customer_id
            .as_deref()
            .or(self.reference_id.as_deref())
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    pub version: Option<u64>,
    pub file_timestamp: Option<DateTime<Utc>>,
}

pub async fn healthcheck(State(state): State<AppState>) -> Json<ApiResponse<ApiMessage>> {
    let backend = match state.store.backend_kind() {
        BackendKind::File => "file",
        BackendKind::Document => "document",
    };
    Json(ApiResponse::new(ApiMessage {
        message: format!("ok ({backend} storage)"),
    }))
}

pub async fn list_records<T: EntityFields>(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> WebResult<Json<ApiResponse<Vec<Document>>>> {
    let listing = state.repository::<T>().list(query.owner()).await?;
    let records = listing
        .records
        .iter()
        .map(public)
        .collect::<WebResult<Vec<_>>>()?;

    Ok(Json(
        ApiResponse::new(records).with_file_timestamp(listing.file_timestamp),
    ))
}

pub async fn get_record<T: EntityFields>(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> WebResult<Json<ApiResponse<Document>>> {
    let repo = state.repository::<T>();
    let file_timestamp = repo.file_timestamp().await?;
    let record = repo
        .get(&id)
        .await?
        .ok_or_else(|| WebError::NotFound(format!("{} {id} not found", T::KIND.label())))?;

    Ok(Json(
        ApiResponse::new(public(&record)?).with_file_timestamp(file_timestamp),
    ))
}

pub async fn create_record<T: EntityFields>(
    State(state): State<AppState>,
    actor: Option<Extension<Actor>>,
    Json(payload): Json<Document>,
) -> WebResult<(StatusCode, Json<ApiResponse<Document>>)> {
    let actor = actor.map(|Extension(actor)| actor);
    authorize_write(actor.as_ref(), T::KIND == EntityKind::User)?;

    let applied = settle(
        state
            .repository::<T>()
            .create(payload, actor.as_ref())
            .await?,
    )?;

    Ok((StatusCode::CREATED, Json(applied_response(&applied)?)))
}

/// Version comes from `If-Match` or the body's `version`; the collection
/// timestamp from the body's `fileTimestamp`.
pub async fn update_record<T: EntityFields>(
    State(state): State<AppState>,
    actor: Option<Extension<Actor>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(mut payload): Json<Document>,
) -> WebResult<Json<ApiResponse<Document>>> {
    let actor = actor.map(|Extension(actor)| actor);
    authorize_write(actor.as_ref(), T::KIND == EntityKind::User)?;

    let body_version = take_version(&mut payload)?;
    let file_timestamp = take_file_timestamp(&mut payload)?;
    let context = WriteContext {
        client_version: if_match_version(&headers)?.or(body_version),
        file_timestamp,
    };

    let applied = settle(
        state
            .repository::<T>()
            .update(&id, payload, &context, actor.as_ref())
            .await?,
    )?;

    Ok(Json(applied_response(&applied)?))
}

pub async fn delete_record<T: EntityFields>(
    State(state): State<AppState>,
    actor: Option<Extension<Actor>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<DeleteQuery>,
) -> WebResult<Json<ApiResponse<DeletedRecord>>> {
    let actor = actor.map(|Extension(actor)| actor);
    authorize_write(actor.as_ref(), T::KIND == EntityKind::User)?;

    let context = WriteContext {
        client_version: if_match_version(&headers)?.or(query.version),
        file_timestamp: query.file_timestamp,
    };

    let applied = settle(
        state
            .repository::<T>()
            .delete(&id, &context, actor.as_ref())
            .await?,
    )?;

    Ok(Json(
        ApiResponse::new(DeletedRecord {
            id: applied.record.id,
            deleted: true,
            version: applied.record.audit.version,
        })
        .with_file_timestamp(applied.file_timestamp),
    ))
}

fn settle<T: EntityFields>(outcome: MutationOutcome<T>) -> WebResult<Applied<T>> {
    match outcome {
        MutationOutcome::Applied(applied) => Ok(applied),
        MutationOutcome::Conflict(conflict) => Err(conflict.into()),
        MutationOutcome::NotFound(message) => Err(WebError::NotFound(message)),
        MutationOutcome::Invalid(message) => Err(WebError::Input(message)),
    }
}

fn public<T: EntityFields>(record: &Record<T>) -> WebResult<Document> {
    record
        .to_public()
        .map_err(|err| WebError::Internal(format!("failed to render record: {err}")))
}

fn applied_response<T: EntityFields>(applied: &Applied<T>) -> WebResult<ApiResponse<Document>> {
    Ok(ApiResponse::new(public(&applied.record)?).with_file_timestamp(applied.file_timestamp))
}

/// `None` when the header is absent; quotes and weak-tag prefix are ignored.
pub fn parse_if_match_header(raw: Option<&str>) -> WebResult<Option<u64>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let normalized = raw.trim().trim_start_matches("W/").trim_matches('"');
    let version = normalized
        .parse::<u64>()
        .map_err(|_| WebError::Input(IF_MATCH_INVALID_VERSION_MESSAGE.to_string()))?;

    if version == 0 {
        return Err(WebError::Input(IF_MATCH_INVALID_VERSION_MESSAGE.to_string()));
    }

    Ok(Some(version))
}

fn if_match_version(headers: &HeaderMap) -> WebResult<Option<u64>> {
    let raw = headers
        .get(IF_MATCH)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| WebError::Input(IF_MATCH_INVALID_ASCII_MESSAGE.to_string()))
        })
        .transpose()?;
    parse_if_match_header(raw)
}

fn take_version(payload: &mut Document) -> WebResult<Option<u64>> {
    match payload.remove(VERSION_FIELD) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| WebError::Input("version must be a non-negative integer".to_string())),
    }
}

fn take_file_timestamp(payload: &mut Document) -> WebResult<Option<DateTime<Utc>>> {
    match payload.remove(FILE_TIMESTAMP_FIELD) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(raw)) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| WebError::Input("fileTimestamp must be an RFC 3339 timestamp".to_string())),
        Some(_) => Err(WebError::Input(
            "fileTimestamp must be an RFC 3339 timestamp".to_string(),
        )),
    }
}
