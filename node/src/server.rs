use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tidemark_calendar::CalendarStore;
use tidemark_proofs::Digest;

use crate::aggregator::Aggregator;
use crate::api::{BackupQuery, TipResponse};
use crate::backup::verify_backup_token;
use crate::errors::ApiError;

/// Everything the public surface identifies itself with.
#[derive(Clone)]
pub struct ServerIdentity {
    pub uri: String,
    pub donation_addr: Option<String>,
    pub chain: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CalendarStore>,
    pub aggregator: Aggregator,
    pub identity: ServerIdentity,
    pub hmac_key: Arc<Vec<u8>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/digest", post(submit_digest))
        .route("/timestamp/:digest", get(get_timestamp))
        .route("/tip", get(get_tip))
        .route("/backup/:offset", get(get_backup))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Result<String, ApiError> {
    let stats = state.store.stats();
    let pending = state.store.unanchored_commitments()?.len();
    Ok(format!(
        "tidemark calendar server\n\
         \n\
         uri:          {}\n\
         chain:        {}\n\
         commitments:  {} ({} awaiting anchor)\n\
         journal:      {} records, {} bytes\n\
         indexed:      {} digests\n\
         donations:    {}\n",
        state.identity.uri,
        state.identity.chain,
        stats.commitments,
        pending,
        stats.journal_records,
        stats.journal_bytes,
        stats.indexed_digests,
        state
            .identity
            .donation_addr
            .as_deref()
            .unwrap_or("(none configured)"),
    ))
}

async fn submit_digest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let digest = Digest::from_slice(&body)
        .map_err(|_| ApiError::BadRequest(format!("expected 32 bytes, got {}", body.len())))?;

    let path = state.aggregator.submit(digest).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        path.encode(),
    ))
}

async fn get_timestamp(
    State(state): State<AppState>,
    UrlPath(digest_hex): UrlPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let digest: Digest = digest_hex
        .parse()
        .map_err(|_| ApiError::BadRequest("malformed digest hex".into()))?;

    match state.store.get(&digest)? {
        Some(path) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            path.encode(),
        )),
        None => Err(ApiError::NotFound),
    }
}

async fn get_tip(State(state): State<AppState>) -> Result<Json<TipResponse>, ApiError> {
    match state.store.tip() {
        Some((commitment, path)) => Ok(Json(TipResponse {
            commitment: commitment.to_hex(),
            path: hex::encode(path.encode()),
        })),
        None => Err(ApiError::NotFound),
    }
}

async fn get_backup(
    State(state): State<AppState>,
    UrlPath(offset): UrlPath<u64>,
    Query(query): Query<BackupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !verify_backup_token(&state.hmac_key, &query.token) {
        return Err(ApiError::Forbidden);
    }
    let bytes = state
        .store
        .backup_from(offset)
        .map_err(|_| ApiError::BadRequest("offset is not a record boundary".into()))?;
    metrics::counter!("tidemark_backup_bytes_total", bytes.len() as u64);
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

async fn metrics() -> String {
    crate::telemetry::get_metrics()
}
