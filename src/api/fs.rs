//! `/fs/:uid` — the virtual filesystem surface, one home directory per
//! agent uid (`agent_<pid>`).

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::kernel::vfs::VfsError;

use super::{ok, AppState, Envelope};

impl From<VfsError> for AppError {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::AccessDenied => AppError::Forbidden(e.to_string()),
            VfsError::NotFound(_) => AppError::NotFound(e.to_string()),
            VfsError::InvalidMountName(_) => AppError::InvalidInput(e.to_string()),
            VfsError::Io(_) => AppError::ExecutionError(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: String,
}

pub async fn read_file(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<PathQuery>,
) -> AppResult<Json<Envelope<Value>>> {
    let contents = state.kernel.vfs.read_file(&uid, &query.path).await?;
    Ok(Json(ok(serde_json::json!({ "contents": contents }))))
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    path: String,
    contents: String,
}

pub async fn write_file(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(req): Json<WriteFileRequest>,
) -> AppResult<Json<Envelope<Value>>> {
    state.kernel.vfs.write_file(&uid, &req.path, req.contents.as_bytes()).await?;
    Ok(Json(ok(serde_json::json!({ "written": true }))))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<PathQuery>,
) -> AppResult<Json<Envelope<Value>>> {
    state.kernel.vfs.rm(&uid, &query.path).await?;
    Ok(Json(ok(serde_json::json!({ "removed": true }))))
}

pub async fn list_dir(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<PathQuery>,
) -> AppResult<Json<Envelope<Value>>> {
    let entries = state.kernel.vfs.ls(&uid, &query.path).await?;
    Ok(Json(ok(serde_json::json!({ "entries": entries }))))
}

pub async fn make_dir(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(req): Json<PathQuery>,
) -> AppResult<Json<Envelope<Value>>> {
    state.kernel.vfs.mkdir(&uid, &req.path).await?;
    Ok(Json(ok(serde_json::json!({ "created": true }))))
}

/// `GET /fs/:uid/raw?path=...` — a byte-range-aware download, the REST
/// counterpart to §4.7's `createReadStream({start?, end?})`. Honors a
/// standard single-range `Range: bytes=start-end` header with a `206
/// Partial Content` response; with no `Range` header it streams the whole
/// file as `200 OK`.
pub async fn read_raw(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let info = state.kernel.vfs.stat(&uid, &query.path).await?;
    let total = info.size_bytes;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range_header(v, total));

    match range {
        Some((start, end)) if start <= end => {
            let bytes = state.kernel.vfs.read_range(&uid, &query.path, start, end + 1).await?;
            let content_range = format!("bytes {start}-{end}/{total}");
            Ok((
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_RANGE, content_range),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                ],
                bytes,
            )
                .into_response())
        }
        _ => {
            let bytes = state.kernel.vfs.read_file_raw(&uid, &query.path).await?;
            Ok((
                StatusCode::OK,
                [
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                ],
                bytes,
            )
                .into_response())
        }
    }
}

/// Parses a single-range `bytes=start-end` (end/start both optional per
/// RFC 7233 §2.1 suffix/open-ended forms), clamped to `[0, total)`. Any
/// other form (multi-range, unsatisfiable) is treated as "no range."
fn parse_range_header(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    if total == 0 {
        return None;
    }
    let last = total - 1;
    if start_str.is_empty() {
        // Suffix range: last N bytes.
        let n: u64 = end_str.parse().ok()?;
        let start = last.saturating_sub(n.saturating_sub(1).min(last));
        return Some((start, last));
    }
    let start: u64 = start_str.parse().ok()?;
    if start > last {
        return None;
    }
    let end = if end_str.is_empty() { last } else { end_str.parse::<u64>().ok()?.min(last) };
    Some((start, end))
}

pub async fn stat(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<PathQuery>,
) -> AppResult<Json<Envelope<crate::kernel::vfs::Stat>>> {
    let info = state.kernel.vfs.stat(&uid, &query.path).await?;
    Ok(Json(ok(info)))
}
