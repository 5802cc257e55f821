//! HTTP surface over [`BlockRegistry`].
//!
//! Every block route is scoped to the owner named by the `x-kioku-owner`
//! header (or the configured default owner). Store calls are synchronous and
//! run on the blocking pool.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use kioku_store::{
    BlockRegistry, ErrorKind, NewProposal, OwnerScope, ProposalDiff, StoreError,
};
use kioku_types::{
    Block, Confidence, EditOperation, Proposal, ProposalId, ProposalStatus, ProposalSummary,
    Version, VersionId, VersionSummary, now_millis,
};

use crate::config::ServerConfig;
use crate::constants::{BUSY_RETRY_AFTER_SECS, OWNER_HEADER, REVIEWER_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub registry: BlockRegistry,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(registry: BlockRegistry, config: ServerConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/blocks", get(list_blocks).post(create_block))
        .route("/blocks/{label}", get(current).put(edit))
        .route("/blocks/{label}/history", get(history))
        .route("/blocks/{label}/versions/{id}", get(version_at))
        .route("/blocks/{label}/restore", post(restore))
        .route("/blocks/{label}/propose", post(propose))
        .route("/blocks/{label}/diffs", get(pending))
        .route("/blocks/{label}/diffs/{id}", get(proposal_diff))
        .route("/blocks/{label}/diffs/{id}/approve", post(approve))
        .route("/blocks/{label}/diffs/{id}/reject", post(reject))
        .route("/admin/expire", post(expire))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_input",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let (status, code) = match (&err, err.kind()) {
            (_, ErrorKind::NotFound) => (StatusCode::NOT_FOUND, "not_found"),
            (StoreError::AlreadyExists(_), _) => (StatusCode::CONFLICT, "already_exists"),
            (StoreError::NotPending { .. }, _) => (StatusCode::CONFLICT, "not_pending"),
            (_, ErrorKind::Conflict) => (StatusCode::CONFLICT, "invalid_transition"),
            (_, ErrorKind::MatchNotFound) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "match_not_found")
            }
            (_, ErrorKind::Busy) => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
            (_, ErrorKind::InvalidInput) => (StatusCode::BAD_REQUEST, "invalid_input"),
            (_, ErrorKind::Corrupt) => (StatusCode::INTERNAL_SERVER_ERROR, "corrupt"),
            (_, ErrorKind::Storage) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        };
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %err, code, "request failed");
        }
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.code, "message": self.message }));
        let mut response = (self.status, body).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(BUSY_RETRY_AFTER_SECS));
        }
        response
    }
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> kioku_store::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("store task failed: {e}")))?
        .map_err(ApiError::from)
}

fn parse_proposal_id(raw: &str) -> Result<ProposalId, ApiError> {
    ProposalId::parse(raw).map_err(|e| ApiError::bad_request(format!("bad proposal id '{raw}': {e}")))
}

fn parse_version_id(raw: &str) -> Result<VersionId, ApiError> {
    VersionId::parse(raw).map_err(|e| ApiError::bad_request(format!("bad version id '{raw}': {e}")))
}

// ============================================================================
// Owner extraction
// ============================================================================

/// The caller's owner scope and reviewer identity.
pub struct Owner {
    pub scope: OwnerScope,
    pub reviewer: String,
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Result<Option<&'a str>, ApiError> {
    match parts.headers.get(name) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .map(|s| Some(s.trim()).filter(|s| !s.is_empty()))
            .map_err(|_| ApiError::bad_request(format!("{name} header is not valid text"))),
    }
}

impl FromRequestParts<AppState> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let owner_id = match header_str(parts, OWNER_HEADER)? {
            Some(id) => id.to_string(),
            None => state
                .config
                .default_owner
                .clone()
                .ok_or_else(|| ApiError::bad_request(format!("missing {OWNER_HEADER} header")))?,
        };
        let scope = state.registry.owner(&owner_id)?;
        let reviewer = header_str(parts, REVIEWER_HEADER)?
            .map(str::to_string)
            .unwrap_or(owner_id);
        Ok(Owner { scope, reviewer })
    }
}

// ============================================================================
// Blocks
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn list_blocks(owner: Owner) -> Result<Json<Vec<Block>>, ApiError> {
    let scope = owner.scope;
    Ok(Json(blocking(move || scope.list_blocks()).await?))
}

#[derive(Deserialize)]
struct CreateBlockRequest {
    label: String,
    #[serde(default)]
    body: String,
}

async fn create_block(
    owner: Owner,
    Json(req): Json<CreateBlockRequest>,
) -> Result<(StatusCode, Json<Block>), ApiError> {
    let scope = owner.scope;
    let block = blocking(move || scope.create_block(&req.label, &req.body)).await?;
    Ok((StatusCode::CREATED, Json(block)))
}

#[derive(Serialize)]
struct CurrentResponse {
    block: Block,
    version: Version,
}

async fn current(owner: Owner, Path(label): Path<String>) -> Result<Json<CurrentResponse>, ApiError> {
    let scope = owner.scope;
    let (block, version) = blocking(move || scope.current(&label)).await?;
    Ok(Json(CurrentResponse { block, version }))
}

#[derive(Deserialize)]
struct EditRequest {
    body: String,
    author: String,
    message: Option<String>,
}

async fn edit(
    owner: Owner,
    Path(label): Path<String>,
    Json(req): Json<EditRequest>,
) -> Result<Json<VersionSummary>, ApiError> {
    if req.author.trim().is_empty() {
        return Err(ApiError::bad_request("author must not be empty"));
    }
    let scope = owner.scope;
    let version = blocking(move || {
        scope.edit(&label, &req.body, &req.author, req.message.as_deref())
    })
    .await?;
    Ok(Json(version.summary()))
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    owner: Owner,
    Path(label): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<VersionSummary>>, ApiError> {
    if params.limit == Some(0) {
        return Err(ApiError::bad_request("limit must be at least 1"));
    }
    let limit = state.config.history_limit(params.limit);
    let scope = owner.scope;
    let versions = blocking(move || scope.history(&label, limit)).await?;
    Ok(Json(versions.iter().map(Version::summary).collect()))
}

async fn version_at(
    owner: Owner,
    Path((label, id)): Path<(String, String)>,
) -> Result<Json<Version>, ApiError> {
    let id = parse_version_id(&id)?;
    let scope = owner.scope;
    Ok(Json(blocking(move || scope.at(&label, id)).await?))
}

#[derive(Deserialize)]
struct RestoreRequest {
    version_id: String,
}

async fn restore(
    owner: Owner,
    Path(label): Path<String>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<VersionSummary>, ApiError> {
    let id = parse_version_id(&req.version_id)?;
    let Owner { scope, reviewer } = owner;
    let version = blocking(move || scope.restore(&label, id, &reviewer)).await?;
    Ok(Json(version.summary()))
}

// ============================================================================
// Proposals
// ============================================================================

#[derive(Deserialize)]
struct ProposeRequest {
    agent_id: String,
    field: Option<String>,
    content: String,
    strategy: String,
    reasoning: String,
    #[serde(rename = "match")]
    match_text: Option<String>,
    confidence: Option<String>,
    base_version: Option<String>,
}

impl ProposeRequest {
    fn into_new_proposal(self) -> Result<NewProposal, ApiError> {
        if self.agent_id.trim().is_empty() {
            return Err(ApiError::bad_request("agent_id must not be empty"));
        }
        let operation = EditOperation::from_wire(&self.strategy, self.match_text.as_deref())
            .map_err(StoreError::from)?;
        let confidence = match self.confidence.as_deref() {
            None => Confidence::default(),
            Some(raw) => Confidence::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown confidence '{raw}'")))?,
        };
        let base_version = self.base_version.as_deref().map(parse_version_id).transpose()?;
        Ok(NewProposal {
            agent_id: self.agent_id,
            base_version,
            field: self.field,
            operation,
            content: self.content,
            reasoning: self.reasoning,
            confidence,
        })
    }
}

async fn propose(
    owner: Owner,
    Path(label): Path<String>,
    Json(req): Json<ProposeRequest>,
) -> Result<(StatusCode, Json<Proposal>), ApiError> {
    let new = req.into_new_proposal()?;
    let scope = owner.scope;
    let proposal = blocking(move || scope.propose(&label, new)).await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

async fn pending(owner: Owner, Path(label): Path<String>) -> Result<Json<Vec<ProposalSummary>>, ApiError> {
    let scope = owner.scope;
    let proposals = blocking(move || scope.pending(Some(&label))).await?;
    Ok(Json(proposals.iter().map(Proposal::summary).collect()))
}

async fn proposal_diff(
    owner: Owner,
    Path((label, id)): Path<(String, String)>,
) -> Result<Json<ProposalDiff>, ApiError> {
    let id = parse_proposal_id(&id)?;
    let scope = owner.scope;
    Ok(Json(blocking(move || scope.diff(&label, id)).await?))
}

#[derive(Serialize)]
struct ApproveResponse {
    applied_version: VersionId,
    superseded_ids: Vec<ProposalId>,
}

async fn approve(
    owner: Owner,
    Path((label, id)): Path<(String, String)>,
) -> Result<Json<ApproveResponse>, ApiError> {
    let id = parse_proposal_id(&id)?;
    let Owner { scope, reviewer } = owner;
    let approval = blocking(move || scope.approve(&label, id, &reviewer)).await?;
    Ok(Json(ApproveResponse {
        applied_version: approval.version.id,
        superseded_ids: approval.superseded,
    }))
}

#[derive(Deserialize, Default)]
struct RejectRequest {
    reason: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: ProposalStatus,
}

/// The body is optional, so it is read raw rather than through `Json`.
fn optional_json<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

async fn reject(
    owner: Owner,
    Path((label, id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_proposal_id(&id)?;
    let req: RejectRequest = optional_json(&body)?;
    let Owner { scope, reviewer } = owner;
    let proposal = blocking(move || scope.reject(&label, id, &reviewer, req.reason)).await?;
    Ok(Json(StatusResponse {
        status: proposal.status,
    }))
}

// ============================================================================
// Admin
// ============================================================================

#[derive(Deserialize, Default)]
struct ExpireRequest {
    older_than_secs: Option<u64>,
}

#[derive(Serialize)]
struct ExpireResponse {
    expired: Vec<ProposalId>,
}

async fn expire(State(state): State<AppState>, body: Bytes) -> Result<Json<ExpireResponse>, ApiError> {
    let req: ExpireRequest = optional_json(&body)?;
    let secs = req
        .older_than_secs
        .or(state.config.expire_after_secs)
        .ok_or_else(|| ApiError::bad_request("older_than_secs is required (no expire_after_secs configured)"))?;
    let cutoff = now_millis().saturating_sub(secs.saturating_mul(1000));
    let registry = state.registry.clone();
    let expired = blocking(move || registry.expire_pending(cutoff)).await?;
    tracing::info!(count = expired.len(), secs, "expired pending proposals");
    Ok(Json(ExpireResponse { expired }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kioku_types::BlockKey;

    #[test]
    fn test_error_mapping() {
        let key = BlockKey::new("alice", "persona");
        let cases = [
            (StoreError::block_not_found(&key), StatusCode::NOT_FOUND, "not_found"),
            (StoreError::AlreadyExists(key.clone()), StatusCode::CONFLICT, "already_exists"),
            (
                StoreError::MatchNotFound { label: "persona".into() },
                StatusCode::UNPROCESSABLE_ENTITY,
                "match_not_found",
            ),
            (StoreError::Busy(key.clone()), StatusCode::SERVICE_UNAVAILABLE, "busy"),
            (
                StoreError::corrupt(&key, "dangling parent"),
                StatusCode::INTERNAL_SERVER_ERROR,
                "corrupt",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status(), status);
            assert_eq!(api.code(), code);
        }
    }

    #[test]
    fn test_busy_sets_retry_after() {
        let api = ApiError::from(StoreError::Busy(BlockKey::new("alice", "persona")));
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("1")
        );
    }

    #[test]
    fn test_propose_request_validation() {
        let req = ProposeRequest {
            agent_id: "a1".into(),
            field: None,
            content: "x".into(),
            strategy: "replace".into(),
            reasoning: "r".into(),
            match_text: None,
            confidence: None,
            base_version: None,
        };
        let err = req.into_new_proposal().unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let req = ProposeRequest {
            agent_id: "a1".into(),
            field: None,
            content: "x".into(),
            strategy: "append".into(),
            reasoning: "r".into(),
            match_text: None,
            confidence: Some("HIGH".into()),
            base_version: None,
        };
        let new = req.into_new_proposal().unwrap();
        assert_eq!(new.operation, EditOperation::Append);
        assert_eq!(new.confidence, Confidence::High);
    }

    #[test]
    fn test_optional_json() {
        let empty: RejectRequest = optional_json(&Bytes::new()).unwrap();
        assert!(empty.reason.is_none());
        let some: RejectRequest = optional_json(&Bytes::from_static(br#"{"reason":"no"}"#)).unwrap();
        assert_eq!(some.reason.as_deref(), Some("no"));
        assert!(optional_json::<RejectRequest>(&Bytes::from_static(b"{")).is_err());
    }
}
