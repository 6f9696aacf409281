//! Run-now trigger: re-scan the ledger and sweep pending settlements.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::api::AppState;
use crate::error::AppError;
use crate::orchestration::{IndexerError, RescanReport};

pub const SECRET_HEADER: &str = "x-indexer-secret";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQuery {
    pub from_block: Option<u64>,
}

pub async fn run_indexer(
    Query(params): Query<RunQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RescanReport>, AppError> {
    let Some(expected) = state.config.indexer_secret.as_deref() else {
        return Err(AppError::Forbidden("Indexer trigger is disabled".into()));
    };

    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !secrets_match(provided, expected) {
        return Err(AppError::Unauthorized("Invalid indexer secret".into()));
    }

    let report = state
        .indexer
        .rescan(params.from_block)
        .await
        .map_err(|e| match e {
            IndexerError::Busy => AppError::Conflict(e.to_string()),
            other => AppError::Internal(format!("Re-scan failed: {}", other)),
        })?;

    Ok(Json(report))
}

/// Compare digests so the comparison time does not depend on the secret's
/// prefix or length.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
