//! Flattening Insightly records into Excel workbooks.
//!
//! Columns are the top-level scalar fields in first-seen order, followed by
//! custom fields (`CUSTOMFIELDS[].FIELD_NAME`). Nested objects and arrays are
//! left out. Identical rows are written once.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::api::Record;
use crate::config::ExportSettings;
use crate::utils::clean_text;

pub const EXPORT_EXTENSION: &str = "xlsx";

const CUSTOM_FIELDS_KEY: &str = "CUSTOMFIELDS";
const CUSTOM_FIELD_NAME: &str = "FIELD_NAME";
const CUSTOM_FIELD_VALUE: &str = "FIELD_VALUE";

/// How Insightly serializes timestamps
const INSIGHTLY_DATETIME: &str = "%Y-%m-%d %H:%M:%S";
const INSIGHTLY_DATE: &str = "%Y-%m-%d";

/// Excel rejects longer sheet names
const MAX_SHEET_NAME_LEN: usize = 31;

static NULL: Value = Value::Null;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to create export directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: XlsxError,
    },

    #[error("{entity} does not fit in a worksheet ({rows} rows, {columns} columns)")]
    TooLarge {
        entity: String,
        rows: usize,
        columns: usize,
    },
}

/// A workbook written to disk, ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub entity: String,
    pub path: PathBuf,
    pub rows: usize,
}

impl ExportFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.{}", self.entity, EXPORT_EXTENSION))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Cell {
    Empty,
    Text(String),
    Number(Number),
    Bool(bool),
}

/// Header plus de-duplicated rows, before anything touches disk
#[derive(Debug)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

/// Write `records` to `{dir}/{entity}.xlsx`. Returns `None` when there is
/// nothing to write.
pub fn export_records(
    entity: &str,
    records: &[Record],
    dir: &Path,
    settings: &ExportSettings,
) -> Result<Option<ExportFile>, ExportError> {
    if records.is_empty() {
        debug!(entity, "No records, skipping export");
        return Ok(None);
    }

    std::fs::create_dir_all(dir).map_err(|source| ExportError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(format!("{}.{}", entity, EXPORT_EXTENSION));
    let table = build_table(records, settings);
    let rows = table.rows.len();
    write_workbook(entity, &table, &path)?;

    info!(entity, rows, duplicates = records.len() - rows, path = %path.display(), "Export written");

    Ok(Some(ExportFile {
        entity: entity.to_string(),
        path,
        rows,
    }))
}

fn write_workbook(entity: &str, table: &Table, path: &Path) -> Result<(), ExportError> {
    let too_large = || ExportError::TooLarge {
        entity: entity.to_string(),
        rows: table.rows.len(),
        columns: table.columns.len(),
    };
    let write_err = |source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet
        .set_name(entity.chars().take(MAX_SHEET_NAME_LEN).collect::<String>())
        .map_err(write_err)?;

    let header = Format::new().set_bold();
    for (col, name) in table.columns.iter().enumerate() {
        let col = u16::try_from(col).map_err(|_| too_large())?;
        sheet
            .write_string_with_format(0, col, name, &header)
            .map_err(write_err)?;
    }

    for (index, row) in table.rows.iter().enumerate() {
        let row_num = u32::try_from(index + 1).map_err(|_| too_large())?;
        for (col, cell) in row.iter().enumerate() {
            let col = u16::try_from(col).map_err(|_| too_large())?;
            match cell {
                Cell::Empty => {}
                Cell::Text(text) => {
                    sheet.write_string(row_num, col, text).map_err(write_err)?;
                }
                Cell::Number(n) => match n.as_f64() {
                    Some(f) => {
                        sheet.write_number(row_num, col, f).map_err(write_err)?;
                    }
                    None => {
                        sheet.write_string(row_num, col, n.to_string()).map_err(write_err)?;
                    }
                },
                Cell::Bool(b) => {
                    sheet.write_boolean(row_num, col, *b).map_err(write_err)?;
                }
            }
        }
    }

    workbook.save(path).map_err(write_err)
}

fn build_table(records: &[Record], settings: &ExportSettings) -> Table {
    let columns = columns(records);
    let date_columns: HashSet<&str> = settings.date_columns.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for record in records {
        let row = row(record, &columns, &date_columns, &settings.date_format);
        if seen.insert(row.clone()) {
            rows.push(row);
        }
    }

    Table { columns, rows }
}

fn columns(records: &[Record]) -> Vec<String> {
    let mut columns = Vec::new();
    let mut custom = Vec::new();
    let mut seen = HashSet::new();

    for record in records {
        for (key, value) in record {
            if key != CUSTOM_FIELDS_KEY && is_scalar(value) && seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
        for (name, _) in custom_fields(record) {
            if seen.insert(name.to_string()) {
                custom.push(name.to_string());
            }
        }
    }

    columns.extend(custom);
    columns
}

fn row(record: &Record, columns: &[String], date_columns: &HashSet<&str>, date_format: &str) -> Vec<Cell> {
    columns
        .iter()
        .map(|column| {
            let value = field_value(record, column).unwrap_or(&NULL);
            match value {
                Value::String(s) if date_columns.contains(column.as_str()) => {
                    Cell::Text(format_date(s, date_format))
                }
                other => cell(other),
            }
        })
        .collect()
}

/// Top-level scalar first, then a custom field of the same name
pub(crate) fn field_value<'a>(record: &'a Record, name: &str) -> Option<&'a Value> {
    record
        .get(name)
        .filter(|v| is_scalar(v))
        .or_else(|| custom_fields(record).find(|(field, _)| *field == name).map(|(_, v)| v))
}

fn custom_fields(record: &Record) -> impl Iterator<Item = (&str, &Value)> {
    record
        .get(CUSTOM_FIELDS_KEY)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|field| {
            let name = field.get(CUSTOM_FIELD_NAME)?.as_str()?;
            Some((name, field.get(CUSTOM_FIELD_VALUE).unwrap_or(&NULL)))
        })
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Empty,
        Value::String(s) => Cell::Text(clean_text(s)),
        Value::Bool(b) => Cell::Bool(*b),
        Value::Number(n) => Cell::Number(n.clone()),
        // Filtered out by `is_scalar`
        Value::Array(_) | Value::Object(_) => Cell::Empty,
    }
}

/// Reformat an Insightly timestamp. Text that is not one passes through.
pub fn format_date(raw: &str, format: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let parsed = NaiveDateTime::parse_from_str(raw, INSIGHTLY_DATETIME)
        .ok()
        .or_else(|| NaiveDate::parse_from_str(raw, INSIGHTLY_DATE).ok()?.and_hms_opt(0, 0, 0));

    let mut formatted = String::new();
    match parsed {
        Some(dt) if write!(formatted, "{}", dt.format(format)).is_ok() => formatted,
        _ => clean_text(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook, Data, Reader, Xlsx};
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn read(path: &Path, sheet: &str) -> Vec<Vec<Data>> {
        let mut workbook: Xlsx<_> = open_workbook(path).unwrap();
        let range = workbook.worksheet_range(sheet).unwrap();
        range.rows().map(|r| r.to_vec()).collect()
    }

    fn text(s: &str) -> Data {
        Data::String(s.to_string())
    }

    #[test]
    fn test_empty_records_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExportSettings::default();
        assert_eq!(export_records("Tasks", &[], dir.path(), &settings).unwrap(), None);
        assert!(!dir.path().join("Tasks.xlsx").exists());
    }

    #[test]
    fn test_columns_union_and_custom_fields() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            record(json!({
                "ORGANISATION_ID": 1,
                "ORGANISATION_NAME": "Acme\r\nPty Ltd",
                "ADDRESSES": [{"CITY": "Perth"}],
                "CUSTOMFIELDS": [
                    {"FIELD_NAME": "Industry__c", "FIELD_VALUE": "Mining"},
                    {"FIELD_NAME": "Trial__c", "FIELD_VALUE": true}
                ]
            })),
            record(json!({
                "ORGANISATION_ID": 2,
                "ORGANISATION_NAME": "Globex",
                "PHONE": null,
                "WEBSITE": "globex.example"
            })),
        ];

        let file = export_records("Organisations", &records, dir.path(), &ExportSettings::default())
            .unwrap()
            .unwrap();
        assert_eq!(file.rows, 2);
        assert_eq!(file.file_name(), "Organisations.xlsx");

        let rows = read(&file.path, "Organisations");
        assert_eq!(
            rows[0],
            ["ORGANISATION_ID", "ORGANISATION_NAME", "PHONE", "WEBSITE", "Industry__c", "Trial__c"]
                .map(text)
                .to_vec()
        );
        assert_eq!(
            rows[1],
            vec![
                Data::Float(1.0),
                text("Acme Pty Ltd"),
                Data::Empty,
                Data::Empty,
                text("Mining"),
                Data::Bool(true)
            ]
        );
        assert_eq!(rows[2][1], text("Globex"));
        assert_eq!(rows[2][3], text("globex.example"));
    }

    #[test]
    fn test_duplicate_rows_are_dropped() {
        let records = vec![
            record(json!({"TASK_ID": 7, "TITLE": "Call"})),
            record(json!({"TASK_ID": 7, "TITLE": "Call"})),
            record(json!({"TASK_ID": 8, "TITLE": "Email"})),
        ];

        let table = build_table(&records, &ExportSettings::default());
        assert_eq!(table.rows.len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let file = export_records("Tasks", &records, dir.path(), &ExportSettings::default())
            .unwrap()
            .unwrap();
        assert_eq!(file.rows, 2);
        assert_eq!(read(&file.path, "Tasks").len(), 3);
    }

    #[test]
    fn test_date_columns_are_formatted() {
        let records = vec![record(json!({
            "QUOTE_ID": 1,
            "DATE_CREATED_UTC": "2024-03-05 14:07:00",
            "DATE_UPDATED_UTC": "not a date",
            "DUE_DATE": "2024-03-09 00:00:00",
            "CUSTOMFIELDS": [{"FIELD_NAME": "Signed__c", "FIELD_VALUE": "2024-01-02"}]
        }))];

        let table = build_table(&records, &ExportSettings::default());
        assert_eq!(table.rows[0][1], Cell::Text("05-Mar-24 2:07 PM".to_string()));
        assert_eq!(table.rows[0][2], Cell::Text("not a date".to_string()));
        // Not a configured date column
        assert_eq!(table.rows[0][3], Cell::Text("2024-03-09 00:00:00".to_string()));

        let settings = ExportSettings {
            date_columns: vec!["DUE_DATE".to_string(), "Signed__c".to_string()],
            date_format: "%m/%d/%Y".to_string(),
            ..ExportSettings::default()
        };
        let table = build_table(&records, &settings);
        assert_eq!(table.rows[0][1], Cell::Text("2024-03-05 14:07:00".to_string()));
        assert_eq!(table.rows[0][3], Cell::Text("03/09/2024".to_string()));
        assert_eq!(table.rows[0][4], Cell::Text("01/02/2024".to_string()));
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date("2024-11-30 09:05:00", "%d-%b-%y %-I:%M %p"), "30-Nov-24 9:05 AM");
        assert_eq!(format_date("2024-11-30", "%m/%d/%Y"), "11/30/2024");
        assert_eq!(format_date("  ", "%m/%d/%Y"), "");
        assert_eq!(format_date("soon", "%m/%d/%Y"), "soon");
    }

    #[test]
    fn test_long_entity_name_fits_sheet_name() {
        let dir = tempfile::tempdir().unwrap();
        let entity = "AVeryLongCustomObjectName__cWithSuffix";
        let records = vec![record(json!({"ID": 1}))];
        let file = export_records(entity, &records, dir.path(), &ExportSettings::default())
            .unwrap()
            .unwrap();
        assert_eq!(read(&file.path, &entity[..MAX_SHEET_NAME_LEN]).len(), 2);
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out").join("today");
        let records = vec![record(json!({"ID": 1}))];
        let file = export_records("Quotes", &records, &nested, &ExportSettings::default())
            .unwrap()
            .unwrap();
        assert!(file.path.starts_with(&nested));
        assert!(file.path.exists());
    }
}
