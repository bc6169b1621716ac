use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
};
use serde_json::json;
use axum::Json;

/// User-facing messages returned by the API.
pub mod messages {
    pub const UPLOAD_SUCCESS: &str = "파일이 성공적으로 업로드되었습니다";
    pub const DELETE_SUCCESS: &str = "이(가) 성공적으로 삭제되었습니다";
    pub const SAVE_SUCCESS: &str = "변경사항이 성공적으로 저장되었습니다";
    pub const RULE_UPLOAD_SUCCESS: &str = "검토 규칙이 성공적으로 업로드되었습니다";
    pub const RULE_SAVE_SUCCESS: &str = "검토 규칙이 성공적으로 저장되었습니다";
    pub const RULE_NAME_UPDATE_SUCCESS: &str = "규칙명이 성공적으로 변경되었습니다";
    pub const EXCEL_READ_SUCCESS: &str = "엑셀 파일을 성공적으로 불러왔습니다";

    pub const FILE_NOT_FOUND: &str = "요청한 파일을 찾을 수 없습니다";
    pub const EXCEL_FILTER_ERROR: &str = "Excel 파일에 정렬 또는 필터 조건이 적용되어 있어 읽을 수 없습니다. Excel에서 모든 정렬/필터를 해제하고 \"단일 시트\"로 저장한 후 다시 업로드해주세요";
    pub const MISSING_REQUIRED_INFO: &str = "필수 입력 정보가 누락되었습니다";
    pub const FILE_TOO_LARGE: &str = "업로드 가능한 파일 크기를 초과했습니다";

    pub fn worksheet_not_found(sheet: &str) -> String {
        format!("Excel 파일에 \"{}\" 시트를 찾을 수 없습니다. 시트명을 확인해주세요", sheet)
    }

    pub fn core_columns_missing(columns: &[String]) -> String {
        format!("필수 컬럼이 누락되었습니다: {}. 자동으로 생성합니다", columns.join(", "))
    }

    pub fn delete_success(name: &str) -> String {
        format!("{}{}", name, DELETE_SUCCESS)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("worksheet \"{0}\" not found")]
    SheetNotFound(String),
    #[error("unreadable workbook: {0}")]
    UnreadableWorkbook(String),
    #[error("missing required field: {0}")]
    MissingRequiredField(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("workbook write error: {0}")]
    WorkbookWrite(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ParseError(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for AppError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        AppError::WorkbookWrite(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::Archive(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::SheetNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UnreadableWorkbook(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::MissingRequiredField(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::ParseError(_) => StatusCode::BAD_REQUEST,
            AppError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::WorkbookWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Archive(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the reviewer.
    pub fn user_message(&self) -> String {
        match self {
            AppError::SheetNotFound(sheet) => messages::worksheet_not_found(sheet),
            AppError::UnreadableWorkbook(_) => messages::EXCEL_FILTER_ERROR.to_string(),
            AppError::MissingRequiredField(_) => messages::MISSING_REQUIRED_INFO.to_string(),
            AppError::NotFound(_) => messages::FILE_NOT_FOUND.to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::warn!("request rejected: {}", self);
        }

        let body = Json(json!({
            "status": "error",
            "message": self.user_message(),
            "detail": self.to_string(),
        }));

        (status, body).into_response()
    }
}
