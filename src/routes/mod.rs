use axum::{
    extract::Multipart,
    http::{header, Method},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::{error::AppError, services::paths, AppState};

pub mod cases;
pub mod rules;

pub const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

pub fn routes() -> Router<Arc<AppState>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_check))
        .merge(cases::routes())
        .merge(rules::routes())
        .layer(cors)
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: String,
}

impl StatusResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self { status: "success", message: message.into() }
    }
}

/// Runs filesystem and workbook work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// One part of a multipart upload.
#[derive(Debug)]
pub struct UploadPart {
    pub name: String,
    pub file_name: Option<String>,
    pub data: Bytes,
}

impl UploadPart {
    pub fn text(&self) -> Option<String> {
        std::str::from_utf8(&self.data)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

pub async fn collect_parts(mut multipart: Multipart) -> Result<Vec<UploadPart>, AppError> {
    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(format!("malformed upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::InvalidInput(format!("failed to read upload field {}: {}", name, e)))?;
        tracing::debug!("Received field {} ({:?}, {} bytes)", name, file_name, data.len());
        parts.push(UploadPart { name, file_name, data });
    }
    Ok(parts)
}

pub fn attachment_response(file_name: &str, content_type: &'static str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, paths::content_disposition(file_name)),
        ],
        body,
    )
        .into_response()
}
