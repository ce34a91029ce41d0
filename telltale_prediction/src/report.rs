use chrono::NaiveDateTime;
use csv::WriterBuilder;
use serde_json::{Map, Value};
use std::io::Cursor;
use thiserror::Error;
use umya_spreadsheet::Worksheet;

pub const REPORT_SHEET: &str = "Prediction Report";
pub const METADATA_SHEET: &str = "Metadata";
const SYSTEM_NAME: &str = "Telltale AI Production v2.0";
const MODEL_DESCRIPTION: &str = "EfficientNetB7-Batch";

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const CSV_CONTENT_TYPE: &str = "text/csv";

pub type Record = Map<String, Value>;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("No results to export")]
    Empty,
    #[error("Failed to write spreadsheet: {0}")]
    Xlsx(String),
    #[error("Failed to write CSV: {0}")]
    Csv(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Xlsx,
    Csv,
}

impl ReportFormat {
    /// Anything other than `xlsx` falls back to CSV.
    pub fn parse(format: &str) -> Self {
        if format.eq_ignore_ascii_case("xlsx") {
            ReportFormat::Xlsx
        } else {
            ReportFormat::Csv
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Xlsx => "xlsx",
            ReportFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Xlsx => XLSX_CONTENT_TYPE,
            ReportFormat::Csv => CSV_CONTENT_TYPE,
        }
    }
}

#[derive(Debug)]
pub struct ReportFile {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

pub fn export(
    records: &[Record],
    format: ReportFormat,
    now: NaiveDateTime,
) -> Result<ReportFile, ReportError> {
    if records.is_empty() {
        return Err(ReportError::Empty);
    }

    let columns = collect_columns(records);
    let bytes = match format {
        ReportFormat::Xlsx => write_xlsx(records, &columns, now)?,
        ReportFormat::Csv => write_csv(records, &columns)?,
    };

    let filename = format!(
        "telltale_report_{}.{}",
        now.format("%Y%m%d_%H%M%S"),
        format.extension()
    );
    tracing::info!("Exported {} records to {}", records.len(), filename);

    Ok(ReportFile {
        filename,
        content_type: format.content_type(),
        bytes,
    })
}

/// Union of all record keys, in the order they are first seen.
fn collect_columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for key in records.iter().flat_map(|record| record.keys()) {
        if !columns.contains(key) {
            columns.push(key.clone());
        }
    }
    columns
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_csv(records: &[Record], columns: &[String]) -> Result<Vec<u8>, ReportError> {
    let mut wtr = WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(vec![]);

    wtr.write_record(columns)
        .map_err(|e| ReportError::Csv(e.to_string()))?;
    for record in records {
        let row = columns.iter().map(|column| cell_text(record.get(column)));
        wtr.write_record(row)
            .map_err(|e| ReportError::Csv(e.to_string()))?;
    }

    wtr.into_inner().map_err(|e| ReportError::Csv(e.to_string()))
}

fn write_cell(sheet: &mut Worksheet, col: u32, row: u32, value: Option<&Value>) {
    let cell = sheet.get_cell_mut((col, row));
    match value {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(number) => {
                cell.set_value_number(number);
            }
            None => {
                cell.set_value(n.to_string());
            }
        },
        Some(Value::Bool(b)) => {
            cell.set_value_bool(*b);
        }
        None | Some(Value::Null) => {}
        other => {
            cell.set_value(cell_text(other));
        }
    }
}

fn write_xlsx(
    records: &[Record],
    columns: &[String],
    now: NaiveDateTime,
) -> Result<Vec<u8>, ReportError> {
    let mut book = umya_spreadsheet::new_file_empty_worksheet();

    {
        let sheet = book
            .new_sheet(REPORT_SHEET)
            .map_err(|e| ReportError::Xlsx(e.to_string()))?;
        for (col, name) in (1u32..).zip(columns) {
            sheet.get_cell_mut((col, 1u32)).set_value(name.as_str());
        }
        for (row, record) in (2u32..).zip(records) {
            for (col, name) in (1u32..).zip(columns) {
                write_cell(sheet, col, row, record.get(name));
            }
        }
    }

    {
        let sheet = book
            .new_sheet(METADATA_SHEET)
            .map_err(|e| ReportError::Xlsx(e.to_string()))?;
        sheet.get_cell_mut((1u32, 1u32)).set_value("Field");
        sheet.get_cell_mut((2u32, 1u32)).set_value("Value");

        let metadata = [
            (
                "Export Timestamp",
                Value::from(now.format("%Y-%m-%d %H:%M:%S").to_string()),
            ),
            ("Total Images", Value::from(records.len())),
            ("System", Value::from(SYSTEM_NAME)),
            ("Model", Value::from(MODEL_DESCRIPTION)),
        ];
        for (row, (field, value)) in (2u32..).zip(metadata.iter()) {
            sheet.get_cell_mut((1u32, row)).set_value(*field);
            write_cell(sheet, 2, row, Some(value));
        }
    }

    let mut out = Cursor::new(Vec::<u8>::new());
    umya_spreadsheet::writer::xlsx::write_writer(&book, &mut out)
        .map_err(|e| ReportError::Xlsx(e.to_string()))?;
    Ok(out.into_inner())
}
