//! In-place edits of an existing xlsx package.
//!
//! Saving rewrites only what the data rows touch: the worksheet part of the
//! edited sheet, `styles.xml` when a date format has to be added, and the
//! relationship/content-type entries of the calc chain, which is dropped.
//! Every other part is raw-copied, so formatting, formulas, merged ranges
//! above the header and all other sheets survive a save.

use super::types::*;
use super::utils::*;
use crate::error::AppError;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read, Seek, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const STYLES_REL: &str = "/styles";
const CALC_CHAIN_REL: &str = "/calcChain";
/// Built-in number format `m/d/yyyy h:mm`.
const DATETIME_NUM_FMT: &str = "22";

type Attributes = HashMap<String, String>;

fn xml_error(err: impl std::fmt::Display) -> AppError {
    AppError::WorkbookWrite(format!("xml: {}", err))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), AppError> {
    writer.write_event(event).map_err(xml_error)
}

fn attributes(e: &BytesStart) -> Attributes {
    e.attributes()
        .flatten()
        .filter_map(|a| {
            let key = String::from_utf8_lossy(a.key.local_name().as_ref()).into_owned();
            a.unescape_value().ok().map(|v| (key, v.into_owned()))
        })
        .collect()
}

fn attr_value(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Copy of `e` with `key` set to `value`.
fn with_attr(e: &BytesStart, key: &str, value: &str) -> BytesStart<'static> {
    let mut out = without_attr(e, key.as_bytes());
    out.push_attribute((key, value));
    out
}

fn without_attr(e: &BytesStart, key: &[u8]) -> BytesStart<'static> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for a in e.attributes().flatten() {
        if a.key.as_ref() != key {
            out.push_attribute(a);
        }
    }
    out
}

/// `local` qualified with the namespace prefix of `name`, if any.
fn sibling_tag(name: QName, local: &str) -> String {
    match name.prefix() {
        Some(prefix) => format!("{}:{}", String::from_utf8_lossy(prefix.as_ref()), local),
        None => local.to_string(),
    }
}

fn is(e: &BytesStart, local: &[u8]) -> bool {
    e.local_name().as_ref() == local
}

fn is_end(e: &BytesEnd, local: &[u8]) -> bool {
    e.local_name().as_ref() == local
}

/// Attributes of every element named `local`, in document order.
fn elements(xml: &[u8], local: &[u8]) -> Result<Vec<Attributes>, AppError> {
    let mut reader = Reader::from_reader(xml);
    let mut found = Vec::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if is(&e, local) => found.push(attributes(&e)),
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(found)
}

/// Copy of `xml` without the empty elements named `local` that match `doomed`.
fn drop_elements(xml: &[u8], local: &[u8], doomed: impl Fn(&Attributes) -> bool) -> Result<Vec<u8>, AppError> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Empty(e) if is(&e, local) && doomed(&attributes(&e)) => {}
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }
    Ok(writer.into_inner())
}

/// Package path of a relationship target declared in `xl/_rels/workbook.xml.rels`.
fn resolve_target(target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts = vec!["xl"];
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn rel_target(rels: &[Attributes], type_suffix: &str) -> Option<String> {
    rels.iter()
        .find(|r| r.get("Type").is_some_and(|t| t.ends_with(type_suffix)))
        .and_then(|r| r.get("Target"))
        .map(|t| resolve_target(t))
}

fn sheet_part_path(workbook_xml: &[u8], rels: &[Attributes], sheet_name: &str) -> Result<String, AppError> {
    let sheets = elements(workbook_xml, b"sheet")?;
    let rel_id = sheets
        .iter()
        .find(|s| s.get("name").map(String::as_str) == Some(sheet_name))
        .and_then(|s| s.get("id"))
        .ok_or_else(|| AppError::SheetNotFound(sheet_name.to_string()))?;
    rels.iter()
        .find(|r| r.get("Id") == Some(rel_id))
        .and_then(|r| r.get("Target"))
        .map(|t| resolve_target(t))
        .ok_or_else(|| AppError::UnreadableWorkbook(format!("sheet {} has no worksheet part", sheet_name)))
}

fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<Vec<u8>>, AppError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(Some(data))
}

/// 0-based column index of an `A1`-style reference.
pub fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(u8::is_ascii_alphabetic)
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let number = letters
        .iter()
        .fold(0usize, |acc, b| acc * 26 + usize::from(b - b'A') + 1);
    Some(number - 1)
}

pub fn column_letters(col: usize) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn row_number(e: &BytesStart) -> Option<usize> {
    attr_value(e, b"r").and_then(|r| r.parse().ok())
}

fn cell_column(e: &BytesStart) -> Option<usize> {
    attr_value(e, b"r").and_then(|r| column_index(&r))
}

/// Last (1-based) row covered by a merge reference like `B1:D2`.
fn merge_last_row(range: &str) -> Option<usize> {
    range
        .rsplit(':')
        .next()?
        .trim_start_matches(|c: char| c.is_ascii_alphabetic() || c == '$')
        .parse()
        .ok()
}

/// Index of a `cellXfs` entry using the built-in date-time format, plus the
/// patched stylesheet when that entry had to be appended.
struct DateStyle {
    index: usize,
    patched: Option<Vec<u8>>,
}

fn date_style(styles_xml: &[u8]) -> Result<Option<DateStyle>, AppError> {
    let mut reader = Reader::from_reader(styles_xml);
    let mut in_cell_xfs = false;
    let mut found = false;
    let mut count = 0usize;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) if is(&e, b"cellXfs") => {
                in_cell_xfs = true;
                found = true;
            }
            Event::Empty(e) if is(&e, b"cellXfs") => found = true,
            Event::End(e) if is_end(&e, b"cellXfs") => in_cell_xfs = false,
            Event::Start(e) | Event::Empty(e) if in_cell_xfs && is(&e, b"xf") => {
                if attr_value(&e, b"numFmtId").as_deref() == Some(DATETIME_NUM_FMT) {
                    return Ok(Some(DateStyle { index: count, patched: None }));
                }
                count += 1;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !found {
        return Ok(None);
    }

    let mut reader = Reader::from_reader(styles_xml);
    let mut writer = Writer::new(Vec::with_capacity(styles_xml.len() + 128));
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) if is(&e, b"cellXfs") => {
                write(&mut writer, Event::Start(with_attr(&e, "count", &(count + 1).to_string())))?;
            }
            Event::End(e) if is_end(&e, b"cellXfs") => {
                write_date_xf(&mut writer, &sibling_tag(e.name(), "xf"))?;
                write(&mut writer, Event::End(e))?;
            }
            Event::Empty(e) if is(&e, b"cellXfs") => {
                write(&mut writer, Event::Start(with_attr(&e, "count", "1")))?;
                write_date_xf(&mut writer, &sibling_tag(e.name(), "xf"))?;
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                write(&mut writer, Event::End(BytesEnd::new(name)))?;
            }
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }
    Ok(Some(DateStyle { index: count, patched: Some(writer.into_inner()) }))
}

fn write_date_xf(writer: &mut Writer<Vec<u8>>, tag: &str) -> Result<(), AppError> {
    let mut xf = BytesStart::new(tag.to_string());
    xf.push_attribute(("numFmtId", DATETIME_NUM_FMT));
    for key in ["fontId", "fillId", "borderId", "xfId"] {
        xf.push_attribute((key, "0"));
    }
    xf.push_attribute(("applyNumberFormat", "1"));
    write(writer, Event::Empty(xf))
}

/// Rewrites the `<sheetData>` rows of one worksheet part below the header.
struct RowPatch<'a> {
    before: &'a SheetGrid,
    after: &'a SheetGrid,
    header_idx: usize,
    date_style: Option<String>,
    /// Header cells that were blank and now carry a column name.
    fills: BTreeMap<usize, String>,
    /// Style indexes of the first data row, reused for the new rows.
    column_styles: HashMap<usize, String>,
    styles_captured: bool,
    prefix: String,
}

impl<'a> RowPatch<'a> {
    fn new(before: &'a SheetGrid, after: &'a SheetGrid, header_idx: usize, date_style: Option<String>) -> Self {
        let fills = (0..after.column_count())
            .filter(|&col| before.cell(header_idx, col).is_blank())
            .filter_map(|col| cell_text(after.cell(header_idx, col)).map(|text| (col, text)))
            .collect();
        Self {
            before,
            after,
            header_idx,
            date_style,
            fills,
            column_styles: HashMap::new(),
            styles_captured: false,
            prefix: String::new(),
        }
    }

    fn tag(&self, local: &str) -> String {
        format!("{}{}", self.prefix, local)
    }

    fn header_number(&self) -> usize {
        self.header_idx + 1
    }

    fn apply(mut self, xml: &[u8]) -> Result<Vec<u8>, AppError> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(xml.len()));
        let mut next_row = 1usize;
        let mut header_written = false;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(e) if is(&e, b"sheetData") => {
                    self.prefix = sibling_tag(e.name(), "");
                    write(&mut writer, Event::Start(e))?;
                }
                Event::Empty(e) if is(&e, b"sheetData") => {
                    self.prefix = sibling_tag(e.name(), "");
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    write(&mut writer, Event::Start(e))?;
                    self.write_tail(&mut writer, false)?;
                    write(&mut writer, Event::End(BytesEnd::new(name)))?;
                }
                Event::End(e) if is_end(&e, b"sheetData") => {
                    self.write_tail(&mut writer, header_written)?;
                    write(&mut writer, Event::End(e))?;
                }
                Event::Start(e) if is(&e, b"row") => {
                    let number = row_number(&e).unwrap_or(next_row);
                    next_row = number + 1;
                    if number > self.header_number() {
                        self.skip_row(&mut reader)?;
                    } else if number == self.header_number() {
                        header_written = true;
                        self.patch_header_row(&mut reader, &mut writer, &e, false)?;
                    } else {
                        write(&mut writer, Event::Start(e))?;
                    }
                }
                Event::Empty(e) if is(&e, b"row") => {
                    let number = row_number(&e).unwrap_or(next_row);
                    next_row = number + 1;
                    if number == self.header_number() {
                        header_written = true;
                        self.patch_header_row(&mut reader, &mut writer, &e, true)?;
                    } else if number < self.header_number() {
                        write(&mut writer, Event::Empty(e))?;
                    }
                }
                Event::Empty(e) if is(&e, b"dimension") => {
                    write(&mut writer, Event::Empty(with_attr(&e, "ref", &self.dimension())))?;
                }
                Event::Start(e) if is(&e, b"mergeCells") => self.filter_merges(&mut reader, &mut writer, &e)?,
                Event::Empty(e) if is(&e, b"mergeCells") => {}
                Event::Eof => break,
                other => write(&mut writer, other)?,
            }
        }
        Ok(writer.into_inner())
    }

    fn dimension(&self) -> String {
        let (rows, cols) = (self.after.row_count(), self.after.column_count());
        if rows == 0 || cols == 0 {
            return "A1".to_string();
        }
        format!("A1:{}{}", column_letters(cols - 1), rows)
    }

    /// Consumes an old data row, remembering the cell styles of the first one.
    fn skip_row(&mut self, reader: &mut Reader<&[u8]>) -> Result<(), AppError> {
        let capture = !self.styles_captured;
        self.styles_captured = true;
        let mut next_col = 0usize;
        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(e) | Event::Empty(e) if is(&e, b"c") => {
                    let col = cell_column(&e).unwrap_or(next_col);
                    next_col = col + 1;
                    if capture {
                        if let Some(style) = attr_value(&e, b"s") {
                            self.column_styles.insert(col, style);
                        }
                    }
                }
                Event::End(e) if is_end(&e, b"row") => return Ok(()),
                Event::Eof => return Err(xml_error("unterminated row")),
                _ => {}
            }
        }
    }

    /// Copies the header row, writing column names into the blank cells in `fills`.
    fn patch_header_row(
        &mut self,
        reader: &mut Reader<&[u8]>,
        writer: &mut Writer<Vec<u8>>,
        start: &BytesStart,
        empty: bool,
    ) -> Result<(), AppError> {
        if self.fills.is_empty() {
            let event = if empty { Event::Empty(start.borrow()) } else { Event::Start(start.borrow()) };
            return write(writer, event);
        }

        let row_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        write(writer, Event::Start(without_attr(start, b"spans")))?;
        if !empty {
            let mut next_col = 0usize;
            loop {
                let event = reader.read_event().map_err(xml_error)?;
                match &event {
                    Event::Start(e) | Event::Empty(e) if is(e, b"c") => {
                        let col = cell_column(e).unwrap_or(next_col);
                        next_col = col + 1;
                        self.write_fills(writer, Some(col))?;
                        if let Some(text) = self.fills.remove(&col) {
                            if matches!(event, Event::Start(_)) {
                                reader.read_to_end(e.name()).map_err(xml_error)?;
                            }
                            let style = attr_value(e, b"s");
                            self.write_cell(writer, self.header_idx, col, &CellValue::Text(text), style.as_deref())?;
                        } else {
                            write(writer, event.clone())?;
                        }
                    }
                    Event::End(e) if is_end(e, b"row") => break,
                    Event::Eof => return Err(xml_error("unterminated header row")),
                    _ => write(writer, event.clone())?,
                }
            }
        }
        self.write_fills(writer, None)?;
        write(writer, Event::End(BytesEnd::new(row_name)))
    }

    /// Writes pending header fills left of `limit` (all of them when `None`).
    fn write_fills(&mut self, writer: &mut Writer<Vec<u8>>, limit: Option<usize>) -> Result<(), AppError> {
        loop {
            let Some(col) = self.fills.keys().next().copied() else {
                return Ok(());
            };
            if limit.is_some_and(|limit| col >= limit) {
                return Ok(());
            }
            if let Some(text) = self.fills.remove(&col) {
                self.write_cell(writer, self.header_idx, col, &CellValue::Text(text), None)?;
            }
        }
    }

    /// Emits the header row if the part had none, then every data row of `after`.
    fn write_tail(&mut self, writer: &mut Writer<Vec<u8>>, header_written: bool) -> Result<(), AppError> {
        if !header_written && !self.fills.is_empty() {
            let mut row = BytesStart::new(self.tag("row"));
            row.push_attribute(("r", self.header_number().to_string().as_str()));
            write(writer, Event::Start(row))?;
            self.write_fills(writer, None)?;
            write(writer, Event::End(BytesEnd::new(self.tag("row"))))?;
        }

        for row_idx in self.header_idx + 1..self.after.row_count() {
            let cells = self.after.row(row_idx);
            if cells.iter().all(CellValue::is_blank) {
                continue;
            }
            let mut row = BytesStart::new(self.tag("row"));
            row.push_attribute(("r", (row_idx + 1).to_string().as_str()));
            write(writer, Event::Start(row))?;
            for (col, value) in cells.iter().enumerate() {
                if !value.is_blank() {
                    self.write_cell(writer, row_idx, col, value, self.data_style(col, value))?;
                }
            }
            write(writer, Event::End(BytesEnd::new(self.tag("row"))))?;
        }
        Ok(())
    }

    fn data_style(&self, col: usize, value: &CellValue) -> Option<&str> {
        let date_column = matches!(self.before.cell(self.header_idx + 1, col), CellValue::Date(_));
        let captured = self.column_styles.get(&col).map(String::as_str);
        match (value, date_column) {
            (CellValue::Date(_), true) => captured.or(self.date_style.as_deref()),
            (CellValue::Date(_), false) => self.date_style.as_deref(),
            (_, true) => None,
            (_, false) => captured,
        }
    }

    fn write_cell(
        &self,
        writer: &mut Writer<Vec<u8>>,
        row_idx: usize,
        col: usize,
        value: &CellValue,
        style: Option<&str>,
    ) -> Result<(), AppError> {
        let (kind, text) = match value {
            CellValue::Empty => return Ok(()),
            CellValue::Text(s) | CellValue::Error(s) => (Some("inlineStr"), s.clone()),
            CellValue::Number(n) => (None, n.to_string()),
            CellValue::Bool(b) => (Some("b"), if *b { "1" } else { "0" }.to_string()),
            CellValue::Date(d) => (None, datetime_to_excel_serial(d).to_string()),
        };

        let reference = format!("{}{}", column_letters(col), row_idx + 1);
        let mut cell = BytesStart::new(self.tag("c"));
        cell.push_attribute(("r", reference.as_str()));
        if let Some(style) = style {
            cell.push_attribute(("s", style));
        }
        if let Some(kind) = kind {
            cell.push_attribute(("t", kind));
        }
        write(writer, Event::Start(cell))?;

        if kind == Some("inlineStr") {
            write(writer, Event::Start(BytesStart::new(self.tag("is"))))?;
            let mut t = BytesStart::new(self.tag("t"));
            t.push_attribute(("xml:space", "preserve"));
            write(writer, Event::Start(t))?;
            write(writer, Event::Text(BytesText::new(&text)))?;
            write(writer, Event::End(BytesEnd::new(self.tag("t"))))?;
            write(writer, Event::End(BytesEnd::new(self.tag("is"))))?;
        } else {
            write(writer, Event::Start(BytesStart::new(self.tag("v"))))?;
            write(writer, Event::Text(BytesText::new(&text)))?;
            write(writer, Event::End(BytesEnd::new(self.tag("v"))))?;
        }
        write(writer, Event::End(BytesEnd::new(self.tag("c"))))
    }

    /// Keeps only merged ranges that end on or above the header row.
    fn filter_merges(
        &self,
        reader: &mut Reader<&[u8]>,
        writer: &mut Writer<Vec<u8>>,
        start: &BytesStart,
    ) -> Result<(), AppError> {
        let mut kept = Vec::new();
        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(e) | Event::Empty(e) if is(&e, b"mergeCell") => {
                    if let Some(range) = attr_value(&e, b"ref") {
                        if merge_last_row(&range).is_some_and(|row| row <= self.header_number()) {
                            kept.push(range);
                        }
                    }
                }
                Event::End(e) if is_end(&e, b"mergeCells") => break,
                Event::Eof => return Err(xml_error("unterminated mergeCells")),
                _ => {}
            }
        }
        if kept.is_empty() {
            return Ok(());
        }

        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        write(writer, Event::Start(with_attr(start, "count", &kept.len().to_string())))?;
        for range in &kept {
            let mut merge = BytesStart::new(sibling_tag(start.name(), "mergeCell"));
            merge.push_attribute(("ref", range.as_str()));
            write(writer, Event::Empty(merge))?;
        }
        write(writer, Event::End(BytesEnd::new(name)))
    }
}

fn has_dates_below(sheet: &SheetGrid, header_idx: usize) -> bool {
    sheet
        .rows
        .iter()
        .skip(header_idx + 1)
        .flatten()
        .any(|cell| matches!(cell, CellValue::Date(_)))
}

/// Replaces the rows below `header_idx` of the sheet named `after.name` inside
/// the xlsx package `original` with the rows of `after`.
///
/// `before` is the sheet as it was read from `original`; blank header cells
/// that `after` names are filled in. Rows on and above the header keep their
/// XML untouched otherwise.
pub fn replace_sheet_rows(
    original: &[u8],
    before: &SheetGrid,
    after: &SheetGrid,
    header_idx: usize,
) -> Result<Vec<u8>, AppError> {
    let mut archive =
        ZipArchive::new(Cursor::new(original)).map_err(|e| AppError::UnreadableWorkbook(e.to_string()))?;
    let missing = |part: &str| AppError::UnreadableWorkbook(format!("package has no {}", part));

    let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?.ok_or_else(|| missing(WORKBOOK_PART))?;
    let rels_xml = read_part(&mut archive, WORKBOOK_RELS_PART)?.ok_or_else(|| missing(WORKBOOK_RELS_PART))?;
    let rels = elements(&rels_xml, b"Relationship")?;
    let sheet_part = sheet_part_path(&workbook_xml, &rels, &after.name)?;
    let sheet_xml = read_part(&mut archive, &sheet_part)?.ok_or_else(|| missing(&sheet_part))?;

    let mut replaced: HashMap<String, Vec<u8>> = HashMap::new();
    let mut dropped: HashSet<String> = HashSet::new();

    let mut date_index = None;
    if has_dates_below(after, header_idx) {
        if let Some(styles_part) = rel_target(&rels, STYLES_REL) {
            if let Some(styles_xml) = read_part(&mut archive, &styles_part)? {
                if let Some(style) = date_style(&styles_xml)? {
                    date_index = Some(style.index.to_string());
                    if let Some(patched) = style.patched {
                        replaced.insert(styles_part, patched);
                    }
                }
            }
        }
    }

    let patched_sheet = RowPatch::new(before, after, header_idx, date_index).apply(&sheet_xml)?;
    replaced.insert(sheet_part.clone(), patched_sheet);

    // The calc chain lists formula cells by address; rewritten rows invalidate it.
    if let Some(calc_chain) = rel_target(&rels, CALC_CHAIN_REL) {
        let patched_rels = drop_elements(&rels_xml, b"Relationship", |a| {
            a.get("Type").is_some_and(|t| t.ends_with(CALC_CHAIN_REL))
        })?;
        replaced.insert(WORKBOOK_RELS_PART.to_string(), patched_rels);
        if let Some(types) = read_part(&mut archive, CONTENT_TYPES_PART)? {
            let part_name = format!("/{}", calc_chain);
            let patched_types = drop_elements(&types, b"Override", |a| a.get("PartName") == Some(&part_name))?;
            replaced.insert(CONTENT_TYPES_PART.to_string(), patched_types);
        }
        dropped.insert(calc_chain);
    }

    let bytes = repack(&mut archive, &replaced, &dropped)?;
    tracing::debug!(
        "Patched {} of sheet {} ({} parts rewritten, {} dropped)",
        sheet_part,
        after.name,
        replaced.len(),
        dropped.len()
    );
    Ok(bytes)
}

fn repack<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    replaced: &HashMap<String, Vec<u8>>,
    dropped: &HashSet<String>,
) -> Result<Vec<u8>, AppError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        let name = file.name().to_string();
        if dropped.contains(&name) {
            continue;
        }
        match replaced.get(&name) {
            Some(data) => {
                zip.start_file(name, options)?;
                zip.write_all(data)?;
            }
            None => zip.raw_copy_file(file)?,
        }
    }
    Ok(zip.finish()?.into_inner())
}
