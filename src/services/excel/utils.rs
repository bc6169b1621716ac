use super::types::*;
use calamine::Data;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};

const SECONDS_PER_DAY: f64 = 86_400.0;
/// Serial of 10000-01-01, one past the last date Excel can display.
const MAX_EXCEL_SERIAL: f64 = 2_958_466.0;

fn excel_epoch() -> NaiveDateTime {
    // Serial 0 in the 1900 date system, shifted for the fictitious 1900-02-29.
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || !(0.0..MAX_EXCEL_SERIAL).contains(&serial) {
        return None;
    }
    let seconds = (serial * SECONDS_PER_DAY).round() as i64;
    excel_epoch().checked_add_signed(Duration::try_seconds(seconds)?)
}

pub fn datetime_to_excel_serial(value: &NaiveDateTime) -> f64 {
    let delta = *value - excel_epoch();
    delta.num_seconds() as f64 / SECONDS_PER_DAY
}

pub fn cell_from_data(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(d) => match excel_serial_to_datetime(d.as_f64()) {
            Some(dt) => CellValue::Date(dt),
            None => CellValue::Number(d.as_f64()),
        },
        Data::Error(e) => CellValue::Error(e.to_string()),
        other => CellValue::Text(other.to_string()),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Trimmed display text of a cell, `None` when blank.
pub fn cell_text(cell: &CellValue) -> Option<String> {
    let text = match cell {
        CellValue::Empty => return None,
        CellValue::Text(s) => s.trim().to_string(),
        CellValue::Number(n) => format_number(*n),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Date(d) => d.format(DATE_FORMAT).to_string(),
        CellValue::Error(e) => e.clone(),
    };
    (!text.is_empty()).then_some(text)
}

pub fn cell_to_json(cell: &CellValue) -> Value {
    match cell {
        CellValue::Empty => Value::Null,
        CellValue::Text(s) if s.trim().is_empty() => Value::Null,
        CellValue::Text(s) => Value::String(s.clone()),
        CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Value::from(*n as i64),
        CellValue::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Date(d) => Value::String(d.format(DATE_FORMAT).to_string()),
        CellValue::Error(e) => Value::String(e.clone()),
    }
}

/// Plain text of a JSON value; strings are not quoted.
pub fn json_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(json_text).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

pub fn cell_from_json(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Empty,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => n.as_f64().map_or(CellValue::Empty, CellValue::Number),
        Value::String(s) if s.is_empty() => CellValue::Empty,
        Value::String(s) => match NaiveDateTime::parse_from_str(s, DATE_FORMAT) {
            Ok(dt) => CellValue::Date(dt),
            Err(_) => CellValue::Text(s.clone()),
        },
        Value::Array(_) | Value::Object(_) => match json_text(value) {
            text if text.is_empty() => CellValue::Empty,
            text => CellValue::Text(text),
        },
    }
}

/// Coerces the review field to scalar text: lists (from multi-select editors)
/// are comma-joined and null becomes the empty string.
pub fn normalize_review_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::Array(items) if items.is_empty() => Value::String(String::new()),
        Value::Array(_) => Value::String(json_text(value)),
        Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

/// Header name used for a column whose header cell is blank (1-based index).
pub fn placeholder_column_name(col: usize) -> String {
    format!("Column_{}", col + 1)
}

pub fn is_placeholder_for(name: &str, col: usize) -> bool {
    name == placeholder_column_name(col)
}
