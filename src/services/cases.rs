use crate::error::AppError;
use crate::models::{CaseMetadata, CaseSheet, ExportMode};
use crate::services::excel::{self, Record, Workbook, CORE_COLUMNS, REVIEW_COLUMNS};
use crate::services::{archive, locks::CaseLocks, metadata, paths};
use rayon::prelude::*;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

const ATTACHMENTS_DIR: &str = "attachments";

/// A file received next to the workbook at upload time.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub data: bytes::Bytes,
}

/// Case folders under the upload root: one workbook plus `metadata.json` each.
#[derive(Debug)]
pub struct CaseStore {
    root: PathBuf,
    worksheet: String,
    locks: CaseLocks,
}

impl CaseStore {
    pub fn new(root: impl Into<PathBuf>, worksheet: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            worksheet: worksheet.into(),
            locks: CaseLocks::default(),
        }
    }

    pub fn worksheet(&self) -> &str {
        &self.worksheet
    }

    fn case_dir(&self, case_id: &str) -> Result<PathBuf, AppError> {
        paths::existing_dir(&self.root, case_id)
    }

    fn load_metadata(&self, case_id: &str, dir: &Path) -> CaseMetadata {
        let mut meta: CaseMetadata = metadata::get_typed(dir);
        if meta.folder_name.is_empty() {
            meta.folder_name = case_id.to_string();
        }
        if meta.xlsx_file.is_none() {
            meta.xlsx_file = find_workbook_file(dir);
        }
        meta
    }

    fn workbook_path(dir: &Path, meta: &CaseMetadata) -> Result<PathBuf, AppError> {
        let file = meta
            .xlsx_file
            .as_deref()
            .ok_or_else(|| AppError::NotFound(format!("workbook of case {}", meta.folder_name)))?;
        let path = dir.join(paths::validate_name(file)?);
        if !path.is_file() {
            return Err(AppError::NotFound(format!("{}", path.display())));
        }
        Ok(path)
    }

    /// Stores a new workbook, detects its header row once and records the case.
    pub fn create_case(
        &self,
        file_name: &str,
        data: &[u8],
        attachments: &[Attachment],
        rule_name: Option<String>,
    ) -> Result<CaseMetadata, AppError> {
        let file_name = paths::sanitize_file_name(file_name)?;
        if !file_name.to_lowercase().ends_with(".xlsx") {
            return Err(AppError::InvalidInput(format!("only .xlsx workbooks are supported: {}", file_name)));
        }

        // Parse before touching the disk so a broken upload leaves no folder behind.
        let workbook = excel::load_workbook_from_bytes(data)?;

        let (case_id, dir) = paths::create_timestamp_dir(&self.root)?;
        let result = self.populate_case(&case_id, &dir, &file_name, data, &workbook, attachments, rule_name);
        if result.is_err() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!("Failed to clean up {}: {}", dir.display(), e);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn populate_case(
        &self,
        case_id: &str,
        dir: &Path,
        file_name: &str,
        data: &[u8],
        workbook: &Workbook,
        attachments: &[Attachment],
        rule_name: Option<String>,
    ) -> Result<CaseMetadata, AppError> {
        std::fs::write(dir.join(file_name), data)?;
        store_attachments(dir, attachments)?;

        let (header_row, progress) = match workbook.sheet(&self.worksheet) {
            Some(sheet) => {
                let header_row = excel::locate_header(sheet);
                (header_row, excel::compute_progress(sheet, header_row))
            }
            None => {
                tracing::warn!(
                    "Case {}: sheet {} not found in {}, header left undetected",
                    case_id,
                    self.worksheet,
                    file_name
                );
                (None, 0.0)
            }
        };

        let mut meta = CaseMetadata {
            folder_name: case_id.to_string(),
            xlsx_file: Some(file_name.to_string()),
            last_modified: Some(paths::now_display()),
            progress,
            rule_name,
            ..CaseMetadata::default()
        };
        meta.set_header_row(header_row);
        metadata::merge_put_typed(dir, &meta)?;

        tracing::info!(
            "Created case {} from {} (header row {:?}, progress {}%)",
            case_id,
            file_name,
            header_row,
            progress
        );
        Ok(meta)
    }

    /// Every case, newest first, with progress recomputed from its workbook.
    pub fn list(&self) -> Result<Vec<CaseMetadata>, AppError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let ids = paths::list_dirs(&self.root)?;
        let mut cases: Vec<CaseMetadata> = ids
            .par_iter()
            .map(|case_id| self.refresh_listing_entry(case_id))
            .collect();
        cases.reverse();
        Ok(cases)
    }

    fn refresh_listing_entry(&self, case_id: &str) -> CaseMetadata {
        let dir = self.root.join(case_id);
        let lock = self.locks.handle(case_id);
        let _guard = lock.lock();

        let mut meta = self.load_metadata(case_id, &dir);
        let progress = Self::workbook_path(&dir, &meta)
            .and_then(|path| excel::load_sheet(&path, &self.worksheet))
            .map(|sheet| excel::compute_progress(&sheet, meta.header_row()));

        match progress {
            Ok(progress) => {
                meta.progress = progress;
                if let Err(e) = metadata::merge_put(&dir, progress_update(progress, None)) {
                    tracing::warn!("Case {}: failed to store progress: {}", case_id, e);
                }
            }
            Err(e) => {
                tracing::warn!("Case {}: progress not recomputed, using stored value: {}", case_id, e);
            }
        }
        meta
    }

    /// Reads the case sheet for editing and refreshes its progress.
    pub fn read(&self, case_id: &str) -> Result<CaseSheet, AppError> {
        let dir = self.case_dir(case_id)?;
        let lock = self.locks.handle(case_id);
        let _guard = lock.lock();

        let mut meta = self.load_metadata(case_id, &dir);
        let path = Self::workbook_path(&dir, &meta)?;
        let workbook = excel::load_workbook(&path)?;
        let table = excel::read_records(&workbook, &self.worksheet, meta.header_row(), &CORE_COLUMNS)?;

        if let Some(sheet) = workbook.sheet(&self.worksheet) {
            meta.progress = excel::compute_progress(sheet, meta.header_row());
        }
        let now = paths::now_display();
        if let Err(e) = metadata::merge_put(&dir, progress_update(meta.progress, Some(&now))) {
            tracing::warn!("Case {}: failed to update metadata: {}", case_id, e);
        }
        meta.last_modified = Some(now);

        Ok(CaseSheet {
            metadata: meta,
            columns: table.columns,
            records: table.records,
            synthesized: table.synthesized.into_vec(),
        })
    }

    /// Replaces the data rows of the case sheet and returns the new progress.
    pub fn save(&self, case_id: &str, columns: &[String], records: &[Record]) -> Result<f64, AppError> {
        if columns.is_empty() {
            return Err(AppError::MissingRequiredField("columns".to_string()));
        }
        let dir = self.case_dir(case_id)?;
        let lock = self.locks.handle(case_id);
        let _guard = lock.lock();

        let meta = self.load_metadata(case_id, &dir);
        let path = Self::workbook_path(&dir, &meta)?;
        let original = std::fs::read(&path)?;
        let mut workbook = excel::load_workbook_from_bytes(&original)?;
        let before = workbook
            .sheet(&self.worksheet)
            .cloned()
            .ok_or_else(|| AppError::SheetNotFound(self.worksheet.clone()))?;

        excel::write_records(&mut workbook, &self.worksheet, meta.header_row(), columns, records)?;
        let after = workbook
            .sheet(&self.worksheet)
            .ok_or_else(|| AppError::SheetNotFound(self.worksheet.clone()))?;
        let header_idx = excel::effective_header_row(meta.header_row());
        let bytes = excel::replace_sheet_rows(&original, &before, after, header_idx)?;
        excel::save_bytes(&path, &bytes)?;

        let progress = excel::compute_progress(after, meta.header_row());
        let mut update = progress_update(progress, Some(&paths::now_display()));
        update.insert("folderName".to_string(), json!(case_id));
        update.insert("xlsxFile".to_string(), json!(meta.xlsx_file));
        metadata::merge_put(&dir, update)?;

        tracing::info!("Case {}: saved {} records, progress {}%", case_id, records.len(), progress);
        Ok(progress)
    }

    pub fn delete(&self, case_id: &str) -> Result<(), AppError> {
        let dir = self.case_dir(case_id)?;
        {
            let lock = self.locks.handle(case_id);
            let _guard = lock.lock();
            std::fs::remove_dir_all(&dir)?;
        }
        self.locks.forget(case_id);
        tracing::info!("Deleted case {}", case_id);
        Ok(())
    }

    /// Workbook bytes for download, optionally without the reviewer columns.
    pub fn export(&self, case_id: &str, file_name: &str, mode: ExportMode) -> Result<Vec<u8>, AppError> {
        let dir = self.case_dir(case_id)?;
        let path = dir.join(paths::validate_name(file_name)?);
        if !path.is_file() {
            return Err(AppError::NotFound(format!("{}/{}", case_id, file_name)));
        }

        let lock = self.locks.handle(case_id);
        let _guard = lock.lock();
        match mode {
            ExportMode::Full => Ok(std::fs::read(&path)?),
            ExportMode::NoReview => {
                let meta = self.load_metadata(case_id, &dir);
                let mut workbook = excel::load_workbook(&path)?;
                let removed = excel::drop_columns(&mut workbook, &self.worksheet, meta.header_row(), &REVIEW_COLUMNS)?;
                tracing::info!("Case {}: exporting without {} review columns", case_id, removed);
                excel::workbook_to_bytes(&workbook)
            }
        }
    }

    pub fn zip_case(&self, case_id: &str) -> Result<Vec<u8>, AppError> {
        let dir = self.case_dir(case_id)?;
        let lock = self.locks.handle(case_id);
        let _guard = lock.lock();
        archive::zip_dir(&dir)
    }

    /// Points every case linked to `old_rule` at `new_rule` (or unlinks it).
    pub fn relink_rule(&self, old_rule: &str, new_rule: Option<&str>) -> Result<usize, AppError> {
        if !self.root.is_dir() {
            return Ok(0);
        }
        let mut updated = 0;
        for case_id in paths::list_dirs(&self.root)? {
            let dir = self.root.join(&case_id);
            let lock = self.locks.handle(&case_id);
            let _guard = lock.lock();

            let meta = metadata::get(&dir);
            if meta.get("ruleName").and_then(Value::as_str) != Some(old_rule) {
                continue;
            }
            let mut update = Map::new();
            update.insert("ruleName".to_string(), json!(new_rule));
            metadata::merge_put(&dir, update)?;
            updated += 1;
        }
        if updated > 0 {
            tracing::info!("Relinked {} cases from rule {} to {:?}", updated, old_rule, new_rule);
        }
        Ok(updated)
    }
}

fn progress_update(progress: f64, last_modified: Option<&str>) -> Map<String, Value> {
    let mut update = Map::new();
    update.insert("progress".to_string(), json!(progress));
    if let Some(ts) = last_modified {
        update.insert("lastModified".to_string(), json!(ts));
    }
    update
}

/// First `.xlsx` in the folder by name, for cases whose sidecar lost the file name.
fn find_workbook_file(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.to_lowercase().ends_with(".xlsx") && !name.starts_with("~$"))
        .collect();
    names.sort();
    names.into_iter().next()
}

fn store_attachments(dir: &Path, attachments: &[Attachment]) -> Result<(), AppError> {
    if attachments.is_empty() {
        return Ok(());
    }
    let target = dir.join(ATTACHMENTS_DIR);
    std::fs::create_dir_all(&target)?;
    for attachment in attachments {
        let name = paths::sanitize_file_name(&attachment.file_name)?;
        if name.to_lowercase().ends_with(".zip") {
            archive::extract_zip(&attachment.data, &target)?;
        } else {
            std::fs::write(target.join(&name), &attachment.data)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::excel::{CellValue, SheetGrid};

    const SHEET: &str = "집행내역";

    fn text_row(cells: &[&str]) -> Vec<CellValue> {
        cells
            .iter()
            .map(|c| if c.is_empty() { CellValue::Empty } else { CellValue::text(*c) })
            .collect()
    }

    fn workbook_bytes(sheet_name: &str, rows: &[&[&str]]) -> Vec<u8> {
        let workbook = Workbook {
            sheets: vec![SheetGrid::from_rows(sheet_name, rows.iter().map(|r| text_row(r)).collect())],
        };
        excel::workbook_to_bytes(&workbook).unwrap()
    }

    fn audit_workbook() -> Vec<u8> {
        workbook_bytes(
            SHEET,
            &[
                &["2024년 사업비 집행내역"],
                &["번호", "집행금액", "거래처명", "검토사항", "메모"],
                &["1", "1000", "가게", "적정", ""],
                &["2", "2000", "식당", "", ""],
                &["3", "3000", "문구", "", ""],
                &["4", "4000", "서점", "", ""],
            ],
        )
    }

    fn store() -> (tempfile::TempDir, CaseStore) {
        let root = tempfile::tempdir().unwrap();
        let store = CaseStore::new(root.path().join("cases"), SHEET);
        (root, store)
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn upload_detects_header_and_progress() {
        let (_root, store) = store();
        let meta = store
            .create_case("reports/집행내역.xlsx", &audit_workbook(), &[], Some("기본규칙".into()))
            .unwrap();

        assert_eq!(meta.xlsx_file.as_deref(), Some("집행내역.xlsx"));
        assert_eq!(meta.column_line, 1);
        assert_eq!(meta.progress, 25.0);
        assert_eq!(meta.rule_name.as_deref(), Some("기본규칙"));

        let stored: CaseMetadata = metadata::get_typed(&store.root.join(&meta.folder_name));
        assert_eq!(stored, meta);
    }

    #[test]
    fn upload_without_designated_sheet_records_missing_header() {
        let (_root, store) = store();
        let bytes = workbook_bytes("Sheet1", &[&["번호", "금액", "메모"]]);
        let meta = store.create_case("a.xlsx", &bytes, &[], None).unwrap();
        assert_eq!(meta.column_line, -1);
        assert_eq!(meta.progress, 0.0);

        let err = store.read(&meta.folder_name).unwrap_err();
        assert!(matches!(err, AppError::SheetNotFound(_)));
    }

    #[test]
    fn broken_upload_leaves_no_folder() {
        let (_root, store) = store();
        let err = store.create_case("a.xlsx", b"garbage", &[], None).unwrap_err();
        assert!(matches!(err, AppError::UnreadableWorkbook(_)));
        assert!(!store.root.exists() || paths::list_dirs(&store.root).unwrap().is_empty());

        let err = store.create_case("a.csv", &audit_workbook(), &[], None).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn attachments_are_stored_under_the_case() {
        let (_root, store) = store();
        let attachment = Attachment {
            file_name: "증빙/receipt.txt".to_string(),
            data: bytes::Bytes::from_static(b"r"),
        };
        let meta = store.create_case("a.xlsx", &audit_workbook(), &[attachment], None).unwrap();
        let stored = store.root.join(&meta.folder_name).join(ATTACHMENTS_DIR).join("receipt.txt");
        assert!(stored.is_file());
    }

    #[test]
    fn read_synthesizes_missing_core_columns() {
        let (_root, store) = store();
        let meta = store.create_case("a.xlsx", &audit_workbook(), &[], None).unwrap();

        let sheet = store.read(&meta.folder_name).unwrap();
        assert_eq!(sheet.synthesized, vec!["보완사항".to_string()]);
        assert_eq!(sheet.records.len(), 4);
        assert!(sheet.columns.iter().any(|c| c == "보완사항"));
        assert_eq!(sheet.metadata.progress, 25.0);
        assert!(sheet.metadata.last_modified.is_some());
    }

    #[test]
    fn save_rewrites_sheet_and_updates_progress() {
        let (_root, store) = store();
        let meta = store.create_case("a.xlsx", &audit_workbook(), &[], None).unwrap();
        let case_id = meta.folder_name.clone();

        let sheet = store.read(&case_id).unwrap();
        let mut records = sheet.records.clone();
        records[2].insert("검토사항".into(), json!(["누락", "재확인"]));

        let progress = store.save(&case_id, &sheet.columns, &records).unwrap();
        assert_eq!(progress, 75.0);

        let reread = store.read(&case_id).unwrap();
        assert_eq!(reread.records[2]["검토사항"], json!("누락, 재확인"));
        assert_eq!(reread.metadata.progress, 75.0);
        assert_eq!(reread.metadata.column_line, 1);
        assert!(reread.synthesized.is_empty());

        let stored: CaseMetadata = metadata::get_typed(&store.root.join(&case_id));
        assert_eq!(stored.progress, 75.0);

        let path = store.root.join(&case_id).join("a.xlsx");
        let workbook = excel::load_workbook(&path).unwrap();
        let title = workbook.sheet(SHEET).unwrap().cell(0, 0).clone();
        assert_eq!(title, CellValue::text("2024년 사업비 집행내역"));
    }

    #[test]
    fn save_keeps_formulas_and_formatting_above_header() {
        let mut book = rust_xlsxwriter::Workbook::new();
        let bold = rust_xlsxwriter::Format::new().set_bold();
        let sheet = book.add_worksheet();
        sheet.set_name(SHEET).unwrap();
        sheet.write_formula(0, 0, "=1+1").unwrap();
        sheet.merge_range(0, 1, 0, 4, "2024년 사업비 집행내역", &bold).unwrap();
        for (col, name) in ["번호", "집행금액", "거래처명", "검토사항", "메모"].iter().enumerate() {
            sheet.write_string_with_format(1, col as u16, *name, &bold).unwrap();
        }
        sheet.write_number(2, 0, 1).unwrap();
        sheet.write_number(2, 1, 1000).unwrap();
        let bytes = book.save_to_buffer().unwrap();

        let (_root, store) = store();
        let meta = store.create_case("a.xlsx", &bytes, &[], None).unwrap();
        assert_eq!(meta.column_line, 1);
        let sheet = store.read(&meta.folder_name).unwrap();
        let mut records = sheet.records.clone();
        records[0].insert("검토사항".into(), json!("적정"));
        store.save(&meta.folder_name, &sheet.columns, &records).unwrap();

        let path = store.root.join(&meta.folder_name).join("a.xlsx");
        let mut xlsx: calamine::Xlsx<_> = calamine::open_workbook(&path).unwrap();
        let formulas = calamine::Reader::worksheet_formula(&mut xlsx, SHEET).unwrap();
        assert_eq!(formulas.get_value((0, 0)).map(String::as_str), Some("1+1"));

        let reread = store.read(&meta.folder_name).unwrap();
        assert_eq!(reread.records[0]["검토사항"], json!("적정"));
        assert!(reread.synthesized.is_empty());
    }

    #[test]
    fn save_requires_columns_and_existing_case() {
        let (_root, store) = store();
        assert!(matches!(
            store.save("20240101_000000", &[], &[]),
            Err(AppError::MissingRequiredField(_))
        ));
        assert!(matches!(
            store.save("20240101_000000", &["번호".to_string()], &[record(json!({"번호": 1}))]),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn listing_recomputes_and_falls_back_to_stored_progress() {
        let (_root, store) = store();
        let first = store.create_case("a.xlsx", &audit_workbook(), &[], None).unwrap();
        let second = store.create_case("b.xlsx", &audit_workbook(), &[], None).unwrap();

        // Progress of the second case edited out-of-band, workbook of the first removed.
        let second_dir = store.root.join(&second.folder_name);
        let mut grid = excel::load_workbook(&second_dir.join("b.xlsx")).unwrap();
        grid.sheet_mut(SHEET).unwrap().set_cell(5, 3, CellValue::text("완료"));
        let bytes = excel::workbook_to_bytes(&grid).unwrap();
        excel::save_bytes(&second_dir.join("b.xlsx"), &bytes).unwrap();
        std::fs::remove_file(store.root.join(&first.folder_name).join("a.xlsx")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].folder_name, second.folder_name);
        assert_eq!(listed[0].progress, 100.0);
        assert_eq!(listed[1].folder_name, first.folder_name);
        assert_eq!(listed[1].progress, 25.0);
    }

    #[test]
    fn no_review_export_drops_reviewer_columns() {
        let (_root, store) = store();
        let meta = store.create_case("a.xlsx", &audit_workbook(), &[], None).unwrap();

        let bytes = store.export(&meta.folder_name, "a.xlsx", ExportMode::NoReview).unwrap();
        let workbook = excel::load_workbook_from_bytes(&bytes).unwrap();
        let header: Vec<_> = workbook.sheet(SHEET).unwrap().row(1).to_vec();
        assert_eq!(header, text_row(&["번호", "집행금액", "거래처명"]));

        let full = store.export(&meta.folder_name, "a.xlsx", ExportMode::Full).unwrap();
        let on_disk = std::fs::read(store.root.join(&meta.folder_name).join("a.xlsx")).unwrap();
        assert_eq!(full, on_disk);
    }

    #[test]
    fn relink_and_delete() {
        let (_root, store) = store();
        let meta = store.create_case("a.xlsx", &audit_workbook(), &[], Some("old".into())).unwrap();

        assert_eq!(store.relink_rule("old", Some("new")).unwrap(), 1);
        let stored: CaseMetadata = metadata::get_typed(&store.root.join(&meta.folder_name));
        assert_eq!(stored.rule_name.as_deref(), Some("new"));

        store.delete(&meta.folder_name).unwrap();
        assert!(matches!(store.delete(&meta.folder_name), Err(AppError::NotFound(_))));
    }
}
