use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::services::excel::{column_line, header_row_from_column_line};

/// Sidecar of a case folder (`metadata.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaseMetadata {
    pub folder_name: String,
    pub xlsx_file: Option<String>,
    pub last_modified: Option<String>,
    pub progress: f64,
    pub rule_name: Option<String>,
    /// 0-based header row detected at upload, `-1` when none was found.
    pub column_line: i64,
}

impl Default for CaseMetadata {
    fn default() -> Self {
        Self {
            folder_name: String::new(),
            xlsx_file: None,
            last_modified: None,
            progress: 0.0,
            rule_name: None,
            column_line: -1,
        }
    }
}

impl CaseMetadata {
    pub fn header_row(&self) -> Option<usize> {
        header_row_from_column_line(self.column_line)
    }

    pub fn set_header_row(&mut self, header_row: Option<usize>) {
        self.column_line = column_line(header_row);
    }
}

/// Sidecar of a rule folder (`metadata.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleMetadata {
    pub folder_name: String,
    /// File name of the document-rule JSON inside the rule folder.
    pub document_rule: Option<String>,
    pub category_rule: Map<String, Value>,
    pub upload_time: Option<String>,
}

/// A rule as served to the review UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleView {
    pub folder_name: String,
    pub document_rule: Value,
    pub category_rule: Map<String, Value>,
    pub upload_time: Option<String>,
}

/// Records of a case sheet together with its refreshed progress.
#[derive(Debug, Clone)]
pub struct CaseSheet {
    pub metadata: CaseMetadata,
    pub columns: Vec<String>,
    pub records: Vec<crate::services::excel::Record>,
    pub synthesized: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    #[default]
    Full,
    /// Drops the reviewer columns before download.
    NoReview,
}
