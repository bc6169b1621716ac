use chrono::NaiveDateTime;
use serde_json::Value;
use smallvec::SmallVec;

/// Number of leading rows inspected when looking for the header row.
pub const HEADER_SCAN_ROWS: usize = 10;
/// Minimum number of known header names a row must contain to be the header.
pub const HEADER_MIN_MATCHES: usize = 3;

pub const PROGRESS_COLUMN: &str = "검토사항";
/// Free-text review field; always persisted as scalar text.
pub const REVIEW_FIELD: &str = "검토사항";
/// Columns holding reviewer input; dropped from `no_review` exports.
pub const REVIEW_COLUMNS: [&str; 2] = ["검토사항", "메모"];
/// Columns the review UI always expects, synthesized when the sheet lacks them.
pub const CORE_COLUMNS: [&str; 3] = ["검토사항", "메모", "보완사항"];

/// Column names seen across historical expense-report formats.
pub const COMMON_HEADER_COLUMNS: &[&str] = &[
    "번호", "사용일자", "집행실행일자", "항목", "내역", "금액", "집행금액",
    "적요", "증빙구분", "집행용도", "비목명", "세목명", "거래처명", "예금주명",
    "취소사유", "답변", "회계연도", "N", "사업집행일자", "집행내역",
    "집행구분", "세부", "예산", "인출액(B)", "입금액(C)", "집행금액(A+B)-C",
    "보완사항", "검토사항", "메모",
];

/// Text form of dates exchanged with the editor.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const EXCEL_DATE_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";

/// One data row keyed by header name, in sheet column order.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDateTime),
    /// Formula error such as `#DIV/0!`, kept as its display text.
    Error(String),
}

pub static EMPTY_CELL: CellValue = CellValue::Empty;

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        CellValue::Text(s.into())
    }

    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

/// A worksheet as a dense grid addressed from A1, rows may be ragged.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetGrid {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
}

impl SheetGrid {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), rows: Vec::new() }
    }

    pub fn from_rows(name: impl Into<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { name: name.into(), rows }
    }

    /// Rows up to and including the last populated one.
    pub fn row_count(&self) -> usize {
        self.rows
            .iter()
            .rposition(|row| row.iter().any(|cell| !cell.is_blank()))
            .map_or(0, |idx| idx + 1)
    }

    /// Columns up to and including the last populated one.
    pub fn column_count(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|row| row.iter().rposition(|cell| !cell.is_blank()))
            .max()
            .map_or(0, |idx| idx + 1)
    }

    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn row(&self, row: usize) -> &[CellValue] {
        self.rows.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: CellValue) {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, Vec::new);
        }
        let cells = &mut self.rows[row];
        if cells.len() <= col {
            cells.resize(col + 1, CellValue::Empty);
        }
        cells[col] = value;
    }

    /// Drops every row at index `len` and below.
    pub fn truncate_rows(&mut self, len: usize) {
        self.rows.truncate(len);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<SheetGrid>,
}

impl Workbook {
    pub fn sheet(&self, name: &str) -> Option<&SheetGrid> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut SheetGrid> {
        self.sheets.iter_mut().find(|s| s.name == name)
    }
}

/// Records read from a sheet below its header row.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetTable {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
    /// Required columns that were absent from the sheet and appended empty.
    pub synthesized: SmallVec<[String; 3]>,
}

/// Row holding column names when no header was detected.
pub fn effective_header_row(header_row: Option<usize>) -> usize {
    header_row.unwrap_or(0)
}

/// Decodes the persisted `columnLine` value, where `-1` means no header was found.
pub fn header_row_from_column_line(column_line: i64) -> Option<usize> {
    usize::try_from(column_line).ok()
}

pub fn column_line(header_row: Option<usize>) -> i64 {
    header_row.map_or(-1, |row| row as i64)
}
