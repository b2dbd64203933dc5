//! Client-facing API: account management, uploads, downloads, and tag
//! queries. Handlers surface one clean error kind per class and never leak
//! peer identities or vector clocks.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use common::unix_ts_ms;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{authenticate, generate_token, hash_password, verify_password};
use crate::clock::VectorClock;
use crate::data::{self, DataError};
use crate::model::{EntityPayload, OpKind, TagRecord, UserRecord};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/nodes", get(cluster_nodes))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/files", post(upload).get(list_files).delete(delete_files))
        .route("/files/{file_id}/download", get(download))
        .route("/files/tags", post(add_tags).delete(remove_tags))
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict(String),
    BadRequest(String),
    NoCapacity,
    Unavailable,
    Backpressure,
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }
}

impl From<DataError> for ApiError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::NoCapacity => Self::NoCapacity,
            DataError::Unavailable(_) => Self::Unavailable,
            DataError::Backpressure => Self::Backpressure,
            DataError::Internal(err) => Self::Internal(err),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid or missing token".to_string()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "not the owner of this file".to_string()),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            Self::Conflict(message) => (StatusCode::CONFLICT, message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NoCapacity => (StatusCode::SERVICE_UNAVAILABLE, "no storage available".to_string()),
            Self::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "data temporarily unavailable, retry later".to_string(),
            ),
            Self::Backpressure => (
                StatusCode::TOO_MANY_REQUESTS,
                "write capacity exhausted, retry later".to_string(),
            ),
            Self::Internal(err) => {
                error!(error = %err, "internal error serving client request");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<common::node::HealthStatus> {
    Json(common::node::HealthStatus {
        node_id: state.node_id.clone(),
        role: "metadata-node".to_string(),
        online: true,
    })
}

// --- cluster visibility ---

#[derive(Debug, Serialize)]
pub(crate) struct ClusterStatusResponse {
    pub(crate) node_id: common::NodeId,
    pub(crate) metadata_peers: usize,
    pub(crate) storage_nodes_total: usize,
    pub(crate) storage_nodes_active: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct ClusterNodesResponse {
    pub(crate) metadata_peers: Vec<common::protocol::PeerInfo>,
    pub(crate) storage_nodes: Vec<crate::model::StorageNodeRecord>,
}

pub(crate) async fn cluster_status(
    State(state): State<AppState>,
) -> Json<ClusterStatusResponse> {
    let metadata_peers = state.peers.lock().await.len();
    let (storage_nodes_total, storage_nodes_active) = {
        let storage = state.storage.lock().await;
        (storage.len(), storage.active().len())
    };

    Json(ClusterStatusResponse {
        node_id: state.node_id.clone(),
        metadata_peers,
        storage_nodes_total,
        storage_nodes_active,
    })
}

pub(crate) async fn cluster_nodes(State(state): State<AppState>) -> Json<ClusterNodesResponse> {
    let metadata_peers = state.peers.lock().await.all();
    let storage_nodes = state.storage.lock().await.all();
    Json(ClusterNodesResponse {
        metadata_peers,
        storage_nodes,
    })
}

// --- accounts ---

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    user_id: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    let now = unix_ts_ms();
    let user = UserRecord {
        user_id: Uuid::new_v4().to_string(),
        username: request.username.clone(),
        password_hash: hash_password(&request.password).map_err(ApiError::internal)?,
        token: Some(generate_token()),
        created_at_ms: now,
        token_rotated_at_ms: None,
        clock: VectorClock::new().incremented(state.node_id.as_str()),
        last_modified_by: state.node_id.to_string(),
        version: 1,
    };

    let entry = state.gossip_entry(OpKind::Create, EntityPayload::User(user.clone()));
    let created = state
        .store
        .create_user(&user, &entry)
        .map_err(ApiError::internal)?;

    if !created {
        return Err(ApiError::Conflict(format!(
            "username '{}' already exists",
            request.username
        )));
    }

    info!(username = %request.username, "registered user");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.user_id,
            token: user.token.unwrap_or_default(),
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let mut user = state
        .store
        .user_by_username(&request.username)
        .map_err(ApiError::internal)?
        .ok_or(ApiError::Unauthorized)?;

    if !verify_password(&request.password, &user.password_hash) {
        return Err(ApiError::Unauthorized);
    }

    let token = generate_token();
    user.token = Some(token.clone());
    user.token_rotated_at_ms = Some(unix_ts_ms());
    user.clock = user.clock.incremented(state.node_id.as_str());
    user.last_modified_by = state.node_id.to_string();
    user.version += 1;

    let entry = state.gossip_entry(OpKind::Update, EntityPayload::User(user.clone()));
    state
        .store
        .update_user(&user, &entry)
        .map_err(ApiError::internal)?;

    info!(username = %request.username, "rotated token on login");
    Ok(Json(LoginResponse { token }))
}

// --- files ---

#[derive(Debug, Deserialize)]
struct UploadQuery {
    name: String,
    tags: String,
}

#[derive(Debug, Serialize)]
struct FileResponse {
    file_id: String,
    name: String,
    size: u64,
    tags: Vec<String>,
    created_at_ms: i64,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    #[serde(flatten)]
    file: FileResponse,
    replaced_file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsQuery {
    tags: String,
}

#[derive(Debug, Serialize)]
struct ListFilesResponse {
    files: Vec<FileResponse>,
}

#[derive(Debug, Serialize)]
struct DeleteFilesResponse {
    deleted_count: usize,
    file_ids: Vec<String>,
}

fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .split(',')
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &headers).await?;

    if query.name.is_empty() {
        return Err(ApiError::BadRequest("file name is required".to_string()));
    }
    let tags = parse_tags(&query.tags);
    if tags.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one tag is required".to_string(),
        ));
    }

    let outcome = data::upload_file(&state, &user.user_id, &query.name, tags, payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            file: FileResponse {
                file_id: outcome.file.file_id,
                name: outcome.file.name,
                size: outcome.file.size,
                tags: outcome.tags,
                created_at_ms: outcome.file.created_at_ms,
            },
            replaced_file_id: outcome.replaced_file_id,
        }),
    ))
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<TagsQuery>,
    headers: HeaderMap,
) -> Result<Json<ListFilesResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;

    let tags = parse_tags(&query.tags);
    if tags.is_empty() {
        return Err(ApiError::BadRequest("tag query must not be empty".to_string()));
    }

    let files = state
        .store
        .files_by_tags(&user.user_id, &tags)
        .map_err(ApiError::internal)?;

    let mut responses = Vec::with_capacity(files.len());
    for file in files {
        let tags = state
            .store
            .live_tags_for_file(&file.file_id)
            .map_err(ApiError::internal)?;
        responses.push(FileResponse {
            file_id: file.file_id,
            name: file.name,
            size: file.size,
            tags,
            created_at_ms: file.created_at_ms,
        });
    }

    Ok(Json(ListFilesResponse { files: responses }))
}

async fn download(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await?;

    let file = state
        .store
        .file_by_id(&file_id)
        .map_err(ApiError::internal)?
        .filter(|file| !file.deleted)
        .ok_or(ApiError::NotFound)?;

    if file.owner_id != user.user_id {
        return Err(ApiError::Forbidden);
    }

    let payload = data::download_file(&state, &file).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.name),
        )
        .header(axum::http::header::CONTENT_LENGTH, payload.len())
        .body(Body::from(payload))
        .map_err(ApiError::internal)
}

async fn delete_files(
    State(state): State<AppState>,
    Query(query): Query<TagsQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteFilesResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;

    let tags = parse_tags(&query.tags);
    if tags.is_empty() {
        return Err(ApiError::BadRequest("tag query must not be empty".to_string()));
    }

    let files = state
        .store
        .files_by_tags(&user.user_id, &tags)
        .map_err(ApiError::internal)?;

    let file_ids = data::delete_files(&state, files).await?;

    Ok(Json(DeleteFilesResponse {
        deleted_count: file_ids.len(),
        file_ids,
    }))
}

// --- tags ---

#[derive(Debug, Deserialize)]
struct AddTagsRequest {
    query_tags: Vec<String>,
    new_tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AddTagsResponse {
    updated_count: usize,
    file_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveTagsRequest {
    query_tags: Vec<String>,
    tags_to_remove: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RemoveTagsResponse {
    updated_count: usize,
    file_ids: Vec<String>,
    skipped_files: Vec<String>,
}

async fn add_tags(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AddTagsRequest>,
) -> Result<Json<AddTagsResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    if request.query_tags.is_empty() || request.new_tags.is_empty() {
        return Err(ApiError::BadRequest(
            "query_tags and new_tags must not be empty".to_string(),
        ));
    }

    let files = state
        .store
        .files_by_tags(&user.user_id, &request.query_tags)
        .map_err(ApiError::internal)?;

    let mut records = Vec::new();
    let mut entries = Vec::new();
    let mut file_ids = Vec::new();

    for file in &files {
        for tag in &request.new_tags {
            let record = next_tag_record(&state, &file.file_id, tag, false)?;
            entries.push(state.gossip_entry(OpKind::Create, EntityPayload::Tag(record.clone())));
            records.push(record);
        }
        file_ids.push(file.file_id.clone());
    }

    state
        .store
        .commit_mutations(&[], &records, &entries)
        .map_err(ApiError::internal)?;

    Ok(Json(AddTagsResponse {
        updated_count: file_ids.len(),
        file_ids,
    }))
}

async fn remove_tags(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RemoveTagsRequest>,
) -> Result<Json<RemoveTagsResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    if request.query_tags.is_empty() || request.tags_to_remove.is_empty() {
        return Err(ApiError::BadRequest(
            "query_tags and tags_to_remove must not be empty".to_string(),
        ));
    }

    let files = state
        .store
        .files_by_tags(&user.user_id, &request.query_tags)
        .map_err(ApiError::internal)?;

    let mut records = Vec::new();
    let mut entries = Vec::new();
    let mut file_ids = Vec::new();
    let mut skipped_files = Vec::new();

    for file in &files {
        let live = state
            .store
            .live_tags_for_file(&file.file_id)
            .map_err(ApiError::internal)?;
        let removable: Vec<&String> = request
            .tags_to_remove
            .iter()
            .filter(|tag| live.contains(tag))
            .collect();

        // a file must keep at least one tag or it becomes unreachable
        if live.len() == removable.len() {
            skipped_files.push(file.file_id.clone());
            continue;
        }
        if removable.is_empty() {
            continue;
        }

        for tag in removable {
            let record = next_tag_record(&state, &file.file_id, tag, true)?;
            entries.push(
                state.gossip_entry(OpKind::TombstoneTag, EntityPayload::Tag(record.clone())),
            );
            records.push(record);
        }
        file_ids.push(file.file_id.clone());
    }

    state
        .store
        .commit_mutations(&[], &records, &entries)
        .map_err(ApiError::internal)?;

    Ok(Json(RemoveTagsResponse {
        updated_count: file_ids.len(),
        file_ids,
        skipped_files,
    }))
}

/// Build the next version of a (file, tag) record, advancing the clock of
/// any existing record so the mutation causally dominates it.
fn next_tag_record(
    state: &AppState,
    file_id: &str,
    tag: &str,
    deleted: bool,
) -> Result<TagRecord, ApiError> {
    let entity_id = TagRecord::entity_id(file_id, tag);
    let existing = state
        .store
        .get_entity(crate::model::EntityKind::Tag, &entity_id)
        .map_err(ApiError::internal)?;

    let (clock, version) = match existing {
        Some(EntityPayload::Tag(previous)) => (previous.clock, previous.version + 1),
        _ => (VectorClock::new(), 1),
    };

    Ok(TagRecord {
        file_id: file_id.to_string(),
        tag: tag.to_string(),
        deleted,
        stamp_ms: unix_ts_ms(),
        clock: clock.incremented(state.node_id.as_str()),
        last_modified_by: state.node_id.to_string(),
        version,
    })
}
