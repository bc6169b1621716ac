use axum::{
    extract::{Multipart, Path, State},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{attachment_response, blocking, collect_parts, StatusResponse, ZIP_CONTENT_TYPE};
use crate::{
    error::{messages, AppError},
    models::RuleView,
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/rules/", get(list_rules))
        .route("/api/rule/:folder_name/", get(get_rule))
        .route("/api/upload_rule/", post(upload_rule))
        .route("/api/save_rule/", post(save_rule))
        .route("/api/update_rule_name/", post(update_rule_name))
        .route("/api/delete_rule/:rule_name/", delete(delete_rule).post(delete_rule))
        .route("/api/download_rule/:folder_name/", get(download_rule_zip))
}

async fn list_rules(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RuleView>>, AppError> {
    let rules = blocking(move || state.rules.list()).await?;
    Ok(Json(rules))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(folder_name): Path<String>,
) -> Result<Json<RuleView>, AppError> {
    let rule = blocking(move || state.rules.get(&folder_name)).await?;
    Ok(Json(rule))
}

#[derive(Debug, Serialize)]
pub struct RuleResponse {
    status: &'static str,
    message: String,
    rule: RuleView,
}

async fn upload_rule(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<RuleResponse>, AppError> {
    let mut rule_file = None;
    let mut rule_name = None;
    for part in collect_parts(multipart).await? {
        match part.name.as_str() {
            "rule_file" => {
                let file_name = part
                    .file_name
                    .clone()
                    .ok_or_else(|| AppError::MissingRequiredField("rule_file".to_string()))?;
                rule_file = Some((file_name, part.data));
            }
            "ruleName" => rule_name = part.text(),
            other => tracing::debug!("Ignoring rule upload field {}", other),
        }
    }
    let (file_name, data) = rule_file.ok_or_else(|| AppError::MissingRequiredField("rule_file".to_string()))?;

    let rule = blocking(move || state.rules.create(rule_name.as_deref(), &file_name, &data)).await?;
    Ok(Json(RuleResponse {
        status: "success",
        message: messages::RULE_UPLOAD_SUCCESS.to_string(),
        rule,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRuleRequest {
    folder_name: Option<String>,
    document_rule: Option<Value>,
}

async fn save_rule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveRuleRequest>,
) -> Result<Json<RuleResponse>, AppError> {
    let rule_id = request
        .folder_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| AppError::MissingRequiredField("folderName".to_string()))?;
    let document_rule = request
        .document_rule
        .ok_or_else(|| AppError::MissingRequiredField("documentRule".to_string()))?;

    let rule = blocking(move || state.rules.save(&rule_id, &document_rule)).await?;
    Ok(Json(RuleResponse {
        status: "success",
        message: messages::RULE_SAVE_SUCCESS.to_string(),
        rule,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRuleRequest {
    old_name: Option<String>,
    new_name: Option<String>,
}

async fn update_rule_name(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RenameRuleRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    let (Some(old_name), Some(new_name)) = (request.old_name, request.new_name) else {
        return Err(AppError::MissingRequiredField("oldName/newName".to_string()));
    };

    let (old_name, new_name) = (old_name.trim().to_string(), new_name.trim().to_string());
    blocking(move || {
        state.rules.rename(&old_name, &new_name)?;
        state.cases.relink_rule(&old_name, Some(&new_name))?;
        Ok(())
    })
    .await?;

    Ok(Json(StatusResponse::success(messages::RULE_NAME_UPDATE_SUCCESS)))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_name): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let name = rule_name.trim().to_string();
    blocking(move || {
        state.rules.delete(&name)?;
        state.cases.relink_rule(&name, None)?;
        Ok(())
    })
    .await?;

    Ok(Json(StatusResponse::success(messages::delete_success(&rule_name))))
}

async fn download_rule_zip(
    State(state): State<Arc<AppState>>,
    Path(folder_name): Path<String>,
) -> Result<Response, AppError> {
    let name = folder_name.clone();
    let body = blocking(move || state.rules.zip_rule(&name)).await?;
    Ok(attachment_response(&format!("{}.zip", folder_name), ZIP_CONTENT_TYPE, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaseMetadata;
    use crate::routes::test_support;
    use crate::services::excel::{self, CellValue, SheetGrid, Workbook};
    use crate::services::metadata;
    use serde_json::json;

    #[test]
    fn rename_and_delete_relink_cases() {
        let root = tempfile::tempdir().unwrap();
        let state = test_support::state(root.path());
        let document = r#"{"여비": {"영수증": {}}}"#;
        state.rules.create(Some("기본"), "rule.json", document.as_bytes()).unwrap();

        let grid = SheetGrid::from_rows("집행내역", vec![vec![CellValue::text("번호")]]);
        let bytes = excel::workbook_to_bytes(&Workbook { sheets: vec![grid] }).unwrap();
        let linked = state.rules.default_rule(None).unwrap();
        let case = state.cases.create_case("a.xlsx", &bytes, &[], linked).unwrap();
        assert_eq!(case.rule_name.as_deref(), Some("기본"));
        let case_dir = root.path().join("Upload_file").join(&case.folder_name);

        let request = RenameRuleRequest { old_name: Some("기본".into()), new_name: Some("2024".into()) };
        tokio_test::block_on(update_rule_name(State(state.clone()), Json(request))).unwrap();
        let meta: CaseMetadata = metadata::get_typed(&case_dir);
        assert_eq!(meta.rule_name.as_deref(), Some("2024"));

        tokio_test::block_on(delete_rule(State(state.clone()), Path("2024".to_string()))).unwrap();
        let meta: CaseMetadata = metadata::get_typed(&case_dir);
        assert_eq!(meta.rule_name, None);
    }

    #[test]
    fn padded_rule_names_still_relink_cases() {
        let root = tempfile::tempdir().unwrap();
        let state = test_support::state(root.path());
        state.rules.create(Some("기본"), "rule.json", b"{}").unwrap();

        let grid = SheetGrid::from_rows("집행내역", vec![vec![CellValue::text("번호")]]);
        let bytes = excel::workbook_to_bytes(&Workbook { sheets: vec![grid] }).unwrap();
        let case = state.cases.create_case("a.xlsx", &bytes, &[], Some("기본".into())).unwrap();
        let case_dir = root.path().join("Upload_file").join(&case.folder_name);

        let request = RenameRuleRequest { old_name: Some(" 기본 ".into()), new_name: Some(" 2024 ".into()) };
        tokio_test::block_on(update_rule_name(State(state.clone()), Json(request))).unwrap();
        let meta: CaseMetadata = metadata::get_typed(&case_dir);
        assert_eq!(meta.rule_name.as_deref(), Some("2024"));

        tokio_test::block_on(delete_rule(State(state.clone()), Path(" 2024 ".to_string()))).unwrap();
        let meta: CaseMetadata = metadata::get_typed(&case_dir);
        assert_eq!(meta.rule_name, None);
    }

    #[test]
    fn save_rule_requires_document() {
        let root = tempfile::tempdir().unwrap();
        let state = test_support::state(root.path());
        let request = SaveRuleRequest { folder_name: Some("r".into()), document_rule: None };
        let result = tokio_test::block_on(save_rule(State(state), Json(request)));
        assert!(matches!(result, Err(AppError::MissingRequiredField(_))));
    }

    #[test]
    fn save_rule_returns_derived_categories() {
        let root = tempfile::tempdir().unwrap();
        let state = test_support::state(root.path());
        state.rules.create(Some("r"), "r.json", b"{}").unwrap();

        let request = SaveRuleRequest {
            folder_name: Some("r".into()),
            document_rule: Some(json!({"회의비": {"회의록": {}, "영수증": {}}})),
        };
        let Json(response) = tokio_test::block_on(save_rule(State(state.clone()), Json(request))).unwrap();
        assert_eq!(response.rule.category_rule["회의비"], json!(["회의록", "영수증"]));

        let Json(rules) = tokio_test::block_on(list_rules(State(state))).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], response.rule);
    }
}
