use super::types::*;
use super::utils::*;
use once_cell::sync::Lazy;
use std::collections::HashSet;

static HEADER_VOCABULARY: Lazy<HashSet<&'static str>> =
    Lazy::new(|| COMMON_HEADER_COLUMNS.iter().copied().collect());

/// Finds the 0-based index of the header row.
///
/// Each of the first [`HEADER_SCAN_ROWS`] rows votes with the number of distinct
/// cell texts it shares with the common header vocabulary; the first row
/// reaching [`HEADER_MIN_MATCHES`] wins. Returns `None` when no row qualifies.
pub fn locate_header(sheet: &SheetGrid) -> Option<usize> {
    let scan_rows = sheet.row_count().min(HEADER_SCAN_ROWS);

    for row_idx in 0..scan_rows {
        let values: HashSet<String> = sheet
            .row(row_idx)
            .iter()
            .filter_map(cell_text)
            .collect();

        let matches = values
            .iter()
            .filter(|v| HEADER_VOCABULARY.contains(v.as_str()))
            .count();

        if matches >= HEADER_MIN_MATCHES {
            tracing::debug!("Header row detected at {} ({} known columns)", row_idx, matches);
            return Some(row_idx);
        }
    }

    tracing::debug!("No header row found in the first {} rows of {}", scan_rows, sheet.name);
    None
}

/// Column index whose header text equals `name`, scanning left to right.
pub fn find_column(sheet: &SheetGrid, header_row: Option<usize>, name: &str) -> Option<usize> {
    sheet
        .row(effective_header_row(header_row))
        .iter()
        .position(|cell| cell_text(cell).as_deref() == Some(name))
}

/// Percentage of the sheet the reviewer has worked through.
///
/// Among the rows below the header that hold any data, the position of the
/// last one with a filled progress column is divided by the number of such
/// rows. Gaps in the progress column do not lower the result.
pub fn compute_progress(sheet: &SheetGrid, header_row: Option<usize>) -> f64 {
    let Some(progress_col) = find_column(sheet, header_row, PROGRESS_COLUMN) else {
        return 0.0;
    };

    let mut total_rows = 0usize;
    let mut last_filled_row = 0usize;

    for row_idx in effective_header_row(header_row) + 1..sheet.row_count() {
        let row = sheet.row(row_idx);
        if row.iter().all(CellValue::is_blank) {
            continue;
        }
        total_rows += 1;
        if !sheet.cell(row_idx, progress_col).is_blank() {
            last_filled_row = total_rows;
        }
    }

    if total_rows == 0 {
        return 0.0;
    }

    round2(last_filled_row as f64 * 100.0 / total_rows as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
