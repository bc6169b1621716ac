use super::types::*;
use super::utils::*;
use crate::error::AppError;
use calamine::{open_workbook_from_rs, Data, Range, Reader, Xlsx};
use rust_xlsxwriter::Format;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

/// Highest column index an xlsx worksheet can hold (XFD).
const MAX_COLUMN: usize = 16_383;

fn grid_from_range(name: &str, range: &Range<Data>) -> SheetGrid {
    let mut grid = SheetGrid::new(name);
    let Some((end_row, end_col)) = range.end() else {
        return grid;
    };
    let (start_row, start_col) = range.start().unwrap_or((0, 0));

    // calamine ranges start at the first used cell; re-anchor them at A1.
    for row in start_row..=end_row {
        for col in start_col..=end_col {
            if let Some(data) = range.get_value((row, col)) {
                let cell = cell_from_data(data);
                if cell != CellValue::Empty {
                    grid.set_cell(row as usize, col as usize, cell);
                }
            }
        }
    }
    grid
}

fn read_all_sheets<RS: Read + Seek>(mut xlsx: Xlsx<RS>) -> Result<Workbook, AppError> {
    let mut workbook = Workbook::default();
    for name in xlsx.sheet_names() {
        let range = xlsx.worksheet_range(&name).map_err(|e: calamine::XlsxError| {
            tracing::error!("Failed to read worksheet {}: {}", name, e);
            AppError::UnreadableWorkbook(format!("sheet {}: {}", name, e))
        })?;
        workbook.sheets.push(grid_from_range(&name, &range));
    }
    Ok(workbook)
}

pub fn load_workbook_from_bytes(data: &[u8]) -> Result<Workbook, AppError> {
    let xlsx: Xlsx<_> = open_workbook_from_rs(Cursor::new(data)).map_err(|e: calamine::XlsxError| {
        tracing::error!("Failed to open Excel file: {}", e);
        AppError::UnreadableWorkbook(e.to_string())
    })?;
    read_all_sheets(xlsx)
}

pub fn load_workbook(path: &Path) -> Result<Workbook, AppError> {
    let start = std::time::Instant::now();
    let data = std::fs::read(path)?;
    let workbook = load_workbook_from_bytes(&data)?;
    tracing::debug!(
        "Loaded {} ({} sheets) in {:?}",
        path.display(),
        workbook.sheets.len(),
        start.elapsed()
    );
    Ok(workbook)
}

/// Loads one sheet, failing with `SheetNotFound` when the workbook lacks it.
pub fn load_sheet(path: &Path, sheet_name: &str) -> Result<SheetGrid, AppError> {
    let workbook = load_workbook(path)?;
    workbook
        .sheets
        .into_iter()
        .find(|s| s.name == sheet_name)
        .ok_or_else(|| AppError::SheetNotFound(sheet_name.to_string()))
}

/// Serializes every sheet, in order, into xlsx bytes.
///
/// Only cell values are written: dates get a date number format, everything
/// else uses the default style.
pub fn workbook_to_bytes(workbook: &Workbook) -> Result<Vec<u8>, AppError> {
    let mut book = rust_xlsxwriter::Workbook::new();
    let date_format = Format::new().set_num_format(EXCEL_DATE_FORMAT);

    for grid in &workbook.sheets {
        let sheet = book.add_worksheet();
        sheet.set_name(&grid.name)?;

        for (row_idx, row) in grid.rows.iter().enumerate() {
            for (col_idx, cell) in row.iter().enumerate() {
                if cell.is_blank() {
                    continue;
                }
                if col_idx > MAX_COLUMN {
                    return Err(AppError::WorkbookWrite(format!(
                        "sheet {} has more than {} columns",
                        grid.name,
                        MAX_COLUMN + 1
                    )));
                }
                let (r, c) = (row_idx as u32, col_idx as u16);
                match cell {
                    CellValue::Text(s) | CellValue::Error(s) => {
                        sheet.write_string(r, c, s)?;
                    }
                    CellValue::Number(n) => {
                        sheet.write_number(r, c, *n)?;
                    }
                    CellValue::Bool(b) => {
                        sheet.write_boolean(r, c, *b)?;
                    }
                    CellValue::Date(d) => {
                        sheet.write_number_with_format(r, c, datetime_to_excel_serial(d), &date_format)?;
                    }
                    CellValue::Empty => {}
                }
            }
        }
    }

    Ok(book.save_to_buffer()?)
}

/// Replaces the file at `path` through a temp file in the same directory,
/// so a failed save leaves the previous file in place.
pub fn save_bytes(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Internal(format!("{} has no parent directory", path.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AppError::IoError(e.error))?;

    tracing::info!("Saved workbook {} ({}KB)", path.display(), bytes.len() / 1024);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fixture() -> Workbook {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Workbook {
            sheets: vec![
                SheetGrid::from_rows(
                    "집행내역",
                    vec![
                        vec![CellValue::text("제목")],
                        vec![],
                        vec![CellValue::text("번호"), CellValue::text("사용일자"), CellValue::text("금액")],
                        vec![CellValue::Number(1.0), CellValue::Date(date), CellValue::Number(1500.5)],
                        vec![CellValue::Empty, CellValue::Bool(true)],
                    ],
                ),
                SheetGrid::from_rows("참고", vec![vec![CellValue::Empty, CellValue::text("B1")]]),
            ],
        }
    }

    #[test]
    fn bytes_round_trip_keeps_sheets_and_positions() {
        let original = fixture();
        let bytes = workbook_to_bytes(&original).unwrap();
        let loaded = load_workbook_from_bytes(&bytes).unwrap();

        let names: Vec<_> = loaded.sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["집행내역", "참고"]);

        let sheet = loaded.sheet("집행내역").unwrap();
        assert_eq!(sheet.cell(0, 0), &CellValue::text("제목"));
        assert_eq!(sheet.cell(2, 2), &CellValue::text("금액"));
        assert_eq!(sheet.cell(3, 0), &CellValue::Number(1.0));
        assert_eq!(sheet.cell(3, 1), original.sheets[0].cell(3, 1));
        assert_eq!(sheet.cell(3, 2), &CellValue::Number(1500.5));
        assert_eq!(sheet.cell(4, 1), &CellValue::Bool(true));

        let other = loaded.sheet("참고").unwrap();
        assert_eq!(other.cell(0, 0), &CellValue::Empty);
        assert_eq!(other.cell(0, 1), &CellValue::text("B1"));
    }

    #[test]
    fn garbage_bytes_are_unreadable() {
        let err = load_workbook_from_bytes(b"not a workbook").unwrap_err();
        assert!(matches!(err, AppError::UnreadableWorkbook(_)));
    }

    #[test]
    fn save_then_load_sheet_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case.xlsx");
        save_bytes(&path, &workbook_to_bytes(&fixture()).unwrap()).unwrap();

        let sheet = load_sheet(&path, "집행내역").unwrap();
        assert_eq!(sheet.row_count(), 5);

        let err = load_sheet(&path, "없는시트").unwrap_err();
        assert!(matches!(err, AppError::SheetNotFound(_)));
    }
}
