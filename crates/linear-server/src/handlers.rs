//! Dataset endpoints
//!
//! Record batches travel in a flat binary framing, both in request and
//! response bodies:
//!
//! ```text
//! [index: u64 BE][length: u64 BE][data: length bytes] ... repeated
//! ```

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::{Buf, BufMut, BytesMut};
use linear_core::Record;
use linear_storage::DatasetConfig;
use thiserror::Error;

use crate::AppState;

/// Largest `count` served by one ranged read
pub const MAX_READ_COUNT: u64 = 10_000;

const FRAME_HEADER_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Storage(#[from] linear_storage::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("Failed to encode metrics: {0}")]
    Metrics(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use linear_storage::Error as E;

        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Storage(e) => match e.root() {
                E::DatasetExists(_) => StatusCode::CONFLICT,
                E::DatasetNotFound(_) | E::NotFound(_) => StatusCode::NOT_FOUND,
                E::InvalidName(_)
                | E::IndexNotIncreasing { .. }
                | E::IndexGap { .. }
                | E::IndexOutOfRange(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /metrics`
///
/// The cache size gauge is refreshed from the live cache before rendering.
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state.registry.cache().stats();
    linear_observability::metrics::CACHE_SIZE_BYTES.set(stats.current_size as i64);

    let body = linear_observability::render().map_err(|e| ApiError::Metrics(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, linear_observability::CONTENT_TYPE)],
        body,
    )
        .into_response())
}

/// `PUT /api/datasets/:name`
pub async fn create_dataset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    config: Option<Json<DatasetConfig>>,
) -> ApiResult<Response> {
    let config = config.map(|Json(c)| c).unwrap_or_default();
    let dataset = state.registry.create(&name, config).await?;
    Ok((StatusCode::CREATED, Json(dataset.info().await)).into_response())
}

/// `GET /api/datasets/:name`
pub async fn get_dataset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let dataset = state.registry.get(&name).await?;
    Ok(Json(dataset.info().await).into_response())
}

/// `POST /api/datasets/:name/records/:index`
pub async fn append_record(
    State(state): State<AppState>,
    Path((name, index)): Path<(String, u64)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let dataset = state.registry.get(&name).await?;
    dataset.append(index, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/datasets/:name/records`
pub async fn append_records(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let records: Vec<(u64, Bytes)> = decode_records(body)?
        .into_iter()
        .map(|r| (r.index, r.data))
        .collect();

    let dataset = state.registry.get(&name).await?;
    dataset.append_batch(&records).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/datasets/:name/records/:index`
pub async fn read_record(
    State(state): State<AppState>,
    Path((name, index)): Path<(String, u64)>,
) -> ApiResult<Response> {
    let dataset = state.registry.get(&name).await?;

    let mut found = None;
    dataset
        .read(index, 1, |_, data| {
            found = Some(data);
            Ok(())
        })
        .await?;

    let data = found.ok_or(linear_storage::Error::NotFound(index))?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

/// `GET /api/datasets/:name/records/:index/:count`
pub async fn read_records(
    State(state): State<AppState>,
    Path((name, index, count)): Path<(String, u64, u64)>,
) -> ApiResult<Response> {
    if count > MAX_READ_COUNT {
        return Err(ApiError::BadRequest(format!(
            "count {} exceeds the maximum of {}",
            count, MAX_READ_COUNT
        )));
    }

    let dataset = state.registry.get(&name).await?;

    let mut records = Vec::new();
    dataset
        .read(index, count, |index, data| {
            records.push(Record::new(index, data));
            Ok(())
        })
        .await?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        encode_records(&records),
    )
        .into_response())
}

/// `POST /api/datasets/:name/archive`
pub async fn archive_dataset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let dataset = state.registry.get(&name).await?;
    match dataset.archive_now().await? {
        Some(descriptor) => Ok(Json(descriptor).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub fn encode_records(records: &[Record]) -> Bytes {
    let size = records
        .iter()
        .map(|r| FRAME_HEADER_SIZE + r.data.len())
        .sum();
    let mut buf = BytesMut::with_capacity(size);
    for record in records {
        buf.put_u64(record.index);
        buf.put_u64(record.data.len() as u64);
        buf.put_slice(&record.data);
    }
    buf.freeze()
}

pub fn decode_records(mut body: Bytes) -> ApiResult<Vec<Record>> {
    let mut records = Vec::new();
    while body.has_remaining() {
        if body.remaining() < FRAME_HEADER_SIZE {
            return Err(ApiError::BadRequest(format!(
                "truncated frame header after {} records",
                records.len()
            )));
        }
        let index = body.get_u64();
        let len = body.get_u64();
        if len > body.remaining() as u64 {
            return Err(ApiError::BadRequest(format!(
                "frame for index {} declares {} bytes, {} remain",
                index,
                len,
                body.remaining()
            )));
        }
        let data = body.split_to(len as usize);
        records.push(Record::new(index, data));
    }
    Ok(records)
}
