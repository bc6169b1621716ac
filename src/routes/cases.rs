use axum::{
    extract::{Multipart, Path, Query, State},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{attachment_response, blocking, collect_parts, StatusResponse, XLSX_CONTENT_TYPE, ZIP_CONTENT_TYPE};
use crate::{
    error::{messages, AppError},
    models::{CaseMetadata, ExportMode},
    services::{cases::Attachment, excel::Record},
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/files/", get(list_files))
        .route("/api/upload/", post(upload_files))
        .route("/api/read-xlsx/", post(read_xlsx))
        .route("/api/save-xlsx/", post(save_xlsx))
        .route("/api/download/:folder_name/:file_name/", get(download_file))
        .route("/api/download_zip/:folder_name/", get(download_case_zip))
        .route("/api/delete_file/:folder_name/", delete(delete_file).post(delete_file))
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::MissingRequiredField(field.to_string()))
}

async fn list_files(State(state): State<Arc<AppState>>) -> Result<Json<Vec<CaseMetadata>>, AppError> {
    let start = std::time::Instant::now();
    let cases = blocking(move || state.cases.list()).await?;
    tracing::info!("Listed {} cases in {:?}", cases.len(), start.elapsed());
    Ok(Json(cases))
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    status: &'static str,
    message: String,
    metadata: CaseMetadata,
}

async fn upload_files(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let parts = collect_parts(multipart).await?;

    let mut workbook = None;
    let mut attachments = Vec::new();
    let mut requested_rule = None;
    for part in parts {
        match part.name.as_str() {
            "excel_file" => {
                let file_name = required(part.file_name.clone(), "excel_file")?;
                workbook = Some((file_name, part.data));
            }
            "attachment_folder" => {
                if let Some(file_name) = part.file_name.clone() {
                    attachments.push(Attachment { file_name, data: part.data });
                }
            }
            "ruleName" => requested_rule = part.text(),
            other => tracing::debug!("Ignoring upload field {}", other),
        }
    }
    let (file_name, data) = workbook.ok_or_else(|| AppError::MissingRequiredField("excel_file".to_string()))?;
    if data.len() > state.config().max_file_size {
        return Err(AppError::InvalidInput(messages::FILE_TOO_LARGE.to_string()));
    }

    tracing::info!(
        "Upload of {} ({}KB) with {} attachments",
        file_name,
        data.len() / 1024,
        attachments.len()
    );

    let metadata = blocking(move || {
        let rule_name = state.rules.default_rule(requested_rule.as_deref())?;
        state.cases.create_case(&file_name, &data, &attachments, rule_name)
    })
    .await?;

    Ok(Json(UploadResponse {
        status: "success",
        message: messages::UPLOAD_SUCCESS.to_string(),
        metadata,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    folder_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    status: &'static str,
    message: String,
    columns: Vec<String>,
    data: Vec<Record>,
    progress: f64,
    column_line: i64,
    rule_name: Option<String>,
    sheet_name: String,
    synthesized_columns: Vec<String>,
}

async fn read_xlsx(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReadRequest>,
) -> Result<Json<ReadResponse>, AppError> {
    let case_id = required(request.folder_name, "folderName")?;
    let sheet_name = state.cases.worksheet().to_string();
    let sheet = blocking(move || state.cases.read(&case_id)).await?;

    let (status, message) = if sheet.synthesized.is_empty() {
        ("success", messages::EXCEL_READ_SUCCESS.to_string())
    } else {
        ("warning", messages::core_columns_missing(&sheet.synthesized))
    };

    Ok(Json(ReadResponse {
        status,
        message,
        columns: sheet.columns,
        data: sheet.records,
        progress: sheet.metadata.progress,
        column_line: sheet.metadata.column_line,
        rule_name: sheet.metadata.rule_name,
        sheet_name,
        synthesized_columns: sheet.synthesized,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    folder_name: Option<String>,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<Record>,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    status: &'static str,
    message: String,
    progress: f64,
}

async fn save_xlsx(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, AppError> {
    let case_id = required(request.folder_name, "folderName")?;
    tracing::info!("Saving {} records to case {}", request.data.len(), case_id);

    let progress = blocking(move || state.cases.save(&case_id, &request.columns, &request.data)).await?;

    Ok(Json(SaveResponse {
        status: "success",
        message: messages::SAVE_SUCCESS.to_string(),
        progress,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    mode: ExportMode,
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((folder_name, file_name)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let name = file_name.clone();
    let body = blocking(move || state.cases.export(&folder_name, &name, query.mode)).await?;
    Ok(attachment_response(&file_name, XLSX_CONTENT_TYPE, body))
}

async fn download_case_zip(
    State(state): State<Arc<AppState>>,
    Path(folder_name): Path<String>,
) -> Result<Response, AppError> {
    let name = folder_name.clone();
    let body = blocking(move || state.cases.zip_case(&name)).await?;
    Ok(attachment_response(&format!("{}.zip", folder_name), ZIP_CONTENT_TYPE, body))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(folder_name): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let name = folder_name.clone();
    blocking(move || state.cases.delete(&name)).await?;
    Ok(Json(StatusResponse::success(messages::delete_success(&folder_name))))
}
