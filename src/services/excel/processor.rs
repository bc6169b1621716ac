use super::types::*;
use super::utils::*;
use crate::error::AppError;
use serde_json::Value;
use smallvec::SmallVec;

fn header_names(sheet: &SheetGrid, header_idx: usize) -> Vec<String> {
    (0..sheet.column_count())
        .map(|col| {
            cell_text(sheet.cell(header_idx, col)).unwrap_or_else(|| placeholder_column_name(col))
        })
        .collect()
}

/// Reads the rows below the header of a single sheet as records.
///
/// Rows without any value are skipped. Every name in `required_columns` that the
/// header lacks is appended to the column list and set to null in each record.
/// Duplicate header names are kept in `columns`; the rightmost value wins in a record.
pub fn table_from_sheet(
    sheet: &SheetGrid,
    header_row: Option<usize>,
    required_columns: &[&str],
) -> SheetTable {
    let header_idx = effective_header_row(header_row);
    let mut columns = header_names(sheet, header_idx);

    let mut records = Vec::new();
    for row_idx in header_idx + 1..sheet.row_count() {
        let mut record = Record::new();
        let mut has_value = false;
        for (col, name) in columns.iter().enumerate() {
            let value = cell_to_json(sheet.cell(row_idx, col));
            has_value |= !value.is_null();
            record.insert(name.clone(), value);
        }
        if has_value {
            records.push(record);
        }
    }

    let mut synthesized: SmallVec<[String; 3]> = SmallVec::new();
    for &required in required_columns {
        if columns.iter().any(|c| c == required) {
            continue;
        }
        columns.push(required.to_string());
        for record in &mut records {
            record.insert(required.to_string(), Value::Null);
        }
        synthesized.push(required.to_string());
    }

    if !synthesized.is_empty() {
        tracing::warn!(
            "Sheet {} is missing required columns {:?}, appended empty",
            sheet.name,
            synthesized
        );
    }

    SheetTable { columns, records, synthesized }
}

pub fn read_records(
    workbook: &Workbook,
    sheet_name: &str,
    header_row: Option<usize>,
    required_columns: &[&str],
) -> Result<SheetTable, AppError> {
    let sheet = workbook
        .sheet(sheet_name)
        .ok_or_else(|| AppError::SheetNotFound(sheet_name.to_string()))?;

    let table = table_from_sheet(sheet, header_row, required_columns);
    tracing::info!(
        "Read {} records with {} columns from sheet {}",
        table.records.len(),
        table.columns.len(),
        sheet_name
    );
    Ok(table)
}

fn normalize_record(record: &Record) -> Record {
    let mut normalized = record.clone();
    let review = record.get(REVIEW_FIELD).unwrap_or(&Value::Null);
    normalized.insert(REVIEW_FIELD.to_string(), normalize_review_value(review));
    normalized
}

/// Replaces every row below the header with `records`.
///
/// `column_order` maps record fields to columns left to right. Rows above the
/// header and existing header text are kept; a blank header cell is filled
/// with its column name unless that name is the blank-header placeholder.
pub fn write_records(
    workbook: &mut Workbook,
    sheet_name: &str,
    header_row: Option<usize>,
    column_order: &[String],
    records: &[Record],
) -> Result<(), AppError> {
    let sheet = workbook
        .sheet_mut(sheet_name)
        .ok_or_else(|| AppError::SheetNotFound(sheet_name.to_string()))?;

    let header_idx = effective_header_row(header_row);

    for (col, name) in column_order.iter().enumerate() {
        if sheet.cell(header_idx, col).is_blank() && !is_placeholder_for(name, col) {
            sheet.set_cell(header_idx, col, CellValue::text(name.clone()));
        }
    }

    sheet.truncate_rows(header_idx + 1);

    for (offset, record) in records.iter().map(normalize_record).enumerate() {
        let row_idx = header_idx + 1 + offset;
        for (col, name) in column_order.iter().enumerate() {
            let value = match record.get(name) {
                // Review text is stored verbatim, even when it reads like a date.
                Some(Value::String(s)) if name == REVIEW_FIELD && !s.is_empty() => CellValue::Text(s.clone()),
                Some(value) => cell_from_json(value),
                None => CellValue::Empty,
            };
            if value != CellValue::Empty {
                sheet.set_cell(row_idx, col, value);
            }
        }
    }

    tracing::info!(
        "Wrote {} records below header row {} of sheet {}",
        records.len(),
        header_idx,
        sheet_name
    );
    Ok(())
}

/// Removes the columns whose header text is in `names`, shifting the rest left.
/// Returns the number of columns removed.
pub fn drop_columns(
    workbook: &mut Workbook,
    sheet_name: &str,
    header_row: Option<usize>,
    names: &[&str],
) -> Result<usize, AppError> {
    let sheet = workbook
        .sheet_mut(sheet_name)
        .ok_or_else(|| AppError::SheetNotFound(sheet_name.to_string()))?;

    let header_idx = effective_header_row(header_row);
    let doomed: Vec<usize> = sheet
        .row(header_idx)
        .iter()
        .enumerate()
        .filter(|(_, cell)| cell_text(cell).is_some_and(|text| names.contains(&text.as_str())))
        .map(|(col, _)| col)
        .collect();

    for row in &mut sheet.rows {
        for &col in doomed.iter().rev() {
            if col < row.len() {
                row.remove(col);
            }
        }
    }

    Ok(doomed.len())
}
