use crate::error::AppError;
use crate::models::{RuleMetadata, RuleView};
use crate::services::{archive, metadata, paths};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const DEFAULT_RULE_FILE: &str = "rule.json";

/// Category → item names, read from the keys of the document rule.
///
/// Categories whose value is not an object map to an empty list.
pub fn derive_category_rule(document_rule: &Value) -> Map<String, Value> {
    let Some(categories) = document_rule.as_object() else {
        return Map::new();
    };
    categories
        .iter()
        .map(|(category, items)| {
            let names = items
                .as_object()
                .map(|items| items.keys().cloned().map(Value::String).collect())
                .unwrap_or_default();
            (category.clone(), Value::Array(names))
        })
        .collect()
}

/// Rule folders under the rule root: one document-rule JSON plus `metadata.json` each.
#[derive(Debug)]
pub struct RuleStore {
    root: PathBuf,
}

impl RuleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn rule_dir(&self, rule_id: &str) -> Result<PathBuf, AppError> {
        paths::existing_dir(&self.root, rule_id)
    }

    /// Rule ids in lexicographic order.
    pub fn rule_ids(&self) -> Result<Vec<String>, AppError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        paths::list_dirs(&self.root)
    }

    /// Rule a new case links to: the requested one if it exists, else the first id.
    pub fn default_rule(&self, requested: Option<&str>) -> Result<Option<String>, AppError> {
        let ids = self.rule_ids()?;
        if let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) {
            if ids.iter().any(|id| id == requested) {
                return Ok(Some(requested.to_string()));
            }
            return Err(AppError::NotFound(format!("rule {}", requested)));
        }
        Ok(ids.into_iter().next())
    }

    fn document_file(dir: &Path, meta: &RuleMetadata) -> PathBuf {
        dir.join(meta.document_rule.as_deref().unwrap_or(DEFAULT_RULE_FILE))
    }

    fn load(&self, rule_id: &str, dir: &Path) -> RuleView {
        let meta: RuleMetadata = metadata::get_typed(dir);
        let path = Self::document_file(dir, &meta);
        let document_rule = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Rule {}: {} is not valid JSON: {}", rule_id, path.display(), e);
                Value::Object(Map::new())
            }),
            Err(e) => {
                tracing::warn!("Rule {}: cannot read {}: {}", rule_id, path.display(), e);
                Value::Object(Map::new())
            }
        };

        RuleView {
            folder_name: rule_id.to_string(),
            category_rule: derive_category_rule(&document_rule),
            document_rule,
            upload_time: meta.upload_time,
        }
    }

    pub fn list(&self) -> Result<Vec<RuleView>, AppError> {
        Ok(self
            .rule_ids()?
            .iter()
            .map(|id| self.load(id, &self.root.join(id)))
            .collect())
    }

    pub fn get(&self, rule_id: &str) -> Result<RuleView, AppError> {
        let dir = self.rule_dir(rule_id)?;
        Ok(self.load(rule_id, &dir))
    }

    /// Stores an uploaded rule file. The folder is named `name`, or the upload time.
    pub fn create(&self, name: Option<&str>, file_name: &str, data: &[u8]) -> Result<RuleView, AppError> {
        let document_rule: Value = serde_json::from_slice(data)
            .map_err(|e| AppError::InvalidInput(format!("rule file is not valid JSON: {}", e)))?;
        let file_name = paths::sanitize_file_name(file_name)?;
        if !file_name.to_lowercase().ends_with(".json") {
            return Err(AppError::InvalidInput(format!("rule file must be .json: {}", file_name)));
        }

        std::fs::create_dir_all(&self.root)?;
        let (rule_id, dir) = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => {
                let name = paths::validate_name(name)?;
                let dir = self.root.join(name);
                if dir.exists() {
                    return Err(AppError::InvalidInput(format!("rule {} already exists", name)));
                }
                std::fs::create_dir(&dir)?;
                (name.to_string(), dir)
            }
            None => paths::create_timestamp_dir(&self.root)?,
        };

        std::fs::write(dir.join(&file_name), data)?;
        let meta = RuleMetadata {
            folder_name: rule_id.clone(),
            document_rule: Some(file_name),
            category_rule: derive_category_rule(&document_rule),
            upload_time: Some(paths::now_display()),
        };
        metadata::merge_put_typed(&dir, &meta)?;

        tracing::info!("Created rule {} with {} categories", rule_id, meta.category_rule.len());
        Ok(self.load(&rule_id, &dir))
    }

    /// Replaces the document rule and refreshes the stored category snapshot.
    pub fn save(&self, rule_id: &str, document_rule: &Value) -> Result<RuleView, AppError> {
        let dir = self.rule_dir(rule_id)?;
        let mut meta: RuleMetadata = metadata::get_typed(&dir);
        let path = Self::document_file(&dir, &meta);

        std::fs::write(&path, serde_json::to_string_pretty(document_rule)?)?;

        meta.folder_name = rule_id.to_string();
        meta.document_rule = path.file_name().map(|n| n.to_string_lossy().into_owned());
        meta.category_rule = derive_category_rule(document_rule);
        metadata::merge_put_typed(&dir, &meta)?;

        tracing::info!("Saved rule {}", rule_id);
        Ok(self.load(rule_id, &dir))
    }

    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<(), AppError> {
        let old_dir = self.rule_dir(old_id)?;
        let new_id = paths::validate_name(new_id)?;
        let new_dir = self.root.join(new_id);
        if new_dir.exists() {
            return Err(AppError::InvalidInput(format!("rule {} already exists", new_id)));
        }

        std::fs::rename(&old_dir, &new_dir)?;
        let mut update = Map::new();
        update.insert("folderName".to_string(), Value::String(new_id.to_string()));
        metadata::merge_put(&new_dir, update)?;

        tracing::info!("Renamed rule {} to {}", old_id, new_id);
        Ok(())
    }

    pub fn delete(&self, rule_id: &str) -> Result<(), AppError> {
        let dir = self.rule_dir(rule_id)?;
        std::fs::remove_dir_all(&dir)?;
        tracing::info!("Deleted rule {}", rule_id);
        Ok(())
    }

    pub fn zip_rule(&self, rule_id: &str) -> Result<Vec<u8>, AppError> {
        archive::zip_dir(&self.rule_dir(rule_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, RuleStore) {
        let root = tempfile::tempdir().unwrap();
        let store = RuleStore::new(root.path().join("rules"));
        (root, store)
    }

    fn document() -> Value {
        json!({
            "여비": {"출장신청서": {"필수": true}, "영수증": {}},
            "회의비": {"회의록": {}, "참석자명단": {}, "영수증": {}},
            "기타": "자유 기재",
        })
    }

    #[test]
    fn categories_follow_document_key_order() {
        let categories = derive_category_rule(&document());
        assert_eq!(
            Value::Object(categories),
            json!({
                "여비": ["출장신청서", "영수증"],
                "회의비": ["회의록", "참석자명단", "영수증"],
                "기타": [],
            })
        );
        assert!(derive_category_rule(&json!([1, 2])).is_empty());
    }

    #[test]
    fn create_list_and_derive_on_read() {
        let (_root, store) = store();
        let body = serde_json::to_vec(&document()).unwrap();
        let created = store.create(Some("2024 기본"), "upload/규칙.json", &body).unwrap();
        assert_eq!(created.folder_name, "2024 기본");
        assert_eq!(created.category_rule["회의비"], json!(["회의록", "참석자명단", "영수증"]));

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![created]);
    }

    #[test]
    fn save_replaces_document_and_categories() {
        let (_root, store) = store();
        store.create(Some("r"), "r.json", br#"{"a": {"x": 1}}"#).unwrap();

        let saved = store.save("r", &json!({"b": {"y": 1, "z": 2}})).unwrap();
        assert_eq!(Value::Object(saved.category_rule), json!({"b": ["y", "z"]}));

        let meta: RuleMetadata = metadata::get_typed(&store.root.join("r"));
        assert_eq!(meta.document_rule.as_deref(), Some("r.json"));
        assert_eq!(Value::Object(meta.category_rule), json!({"b": ["y", "z"]}));
    }

    #[test]
    fn stale_snapshot_is_not_trusted() {
        let (_root, store) = store();
        store.create(Some("r"), "r.json", br#"{"a": {"x": 1}}"#).unwrap();
        std::fs::write(store.root.join("r/r.json"), r#"{"c": {"w": 1}}"#).unwrap();

        let rule = store.get("r").unwrap();
        assert_eq!(Value::Object(rule.category_rule), json!({"c": ["w"]}));
    }

    #[test]
    fn invalid_uploads_are_rejected() {
        let (_root, store) = store();
        assert!(matches!(store.create(None, "r.json", b"{oops"), Err(AppError::InvalidInput(_))));
        assert!(matches!(store.create(None, "r.txt", b"{}"), Err(AppError::InvalidInput(_))));
        store.create(Some("dup"), "r.json", b"{}").unwrap();
        assert!(matches!(store.create(Some("dup"), "r.json", b"{}"), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn default_rule_is_lexicographic_first() {
        let (_root, store) = store();
        assert_eq!(store.default_rule(None).unwrap(), None);

        store.create(Some("b-rule"), "r.json", b"{}").unwrap();
        store.create(Some("a-rule"), "r.json", b"{}").unwrap();
        assert_eq!(store.default_rule(None).unwrap().as_deref(), Some("a-rule"));
        assert_eq!(store.default_rule(Some("b-rule")).unwrap().as_deref(), Some("b-rule"));
        assert!(matches!(store.default_rule(Some("zzz")), Err(AppError::NotFound(_))));
    }

    #[test]
    fn rename_and_delete() {
        let (_root, store) = store();
        store.create(Some("old"), "r.json", b"{}").unwrap();
        store.create(Some("taken"), "r.json", b"{}").unwrap();

        assert!(matches!(store.rename("old", "taken"), Err(AppError::InvalidInput(_))));
        store.rename("old", "new").unwrap();
        assert_eq!(store.get("new").unwrap().folder_name, "new");
        let meta: RuleMetadata = metadata::get_typed(&store.root.join("new"));
        assert_eq!(meta.folder_name, "new");

        store.delete("new").unwrap();
        assert_eq!(store.rule_ids().unwrap(), vec!["taken".to_string()]);
        assert!(matches!(store.delete("new"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn zip_contains_rule_and_metadata() {
        let (_root, store) = store();
        store.create(Some("r"), "r.json", b"{}").unwrap();
        let bytes = store.zip_rule("r").unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["metadata.json", "r.json"]);
    }
}
