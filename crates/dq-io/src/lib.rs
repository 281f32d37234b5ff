#![forbid(unsafe_code)]

use csv::{ReaderBuilder, WriterBuilder};
use dq_types::{Row, Scalar, TypeError, rows_from_json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error("csv header {0:?} appears more than once")]
    DuplicateHeader(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Parse CSV text with a header line into rows. Fields keep header order and
/// each cell is typed independently (see [`infer_scalar`]).
pub fn read_csv_str(input: &str) -> Result<Vec<Row>, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned().map_err(IoError::from)?;
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(IoError::MissingHeaders);
    }
    for (idx, header) in headers.iter().enumerate() {
        if headers.iter().take(idx).any(|earlier| earlier == header) {
            return Err(IoError::DuplicateHeader(header.to_owned()));
        }
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Row::with_capacity(headers.len());
        for (idx, header) in headers.iter().enumerate() {
            // Short records read as null for the missing trailing cells.
            row.insert(header, infer_scalar(record.get(idx).unwrap_or_default()));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Parse a JSON array of flat objects into rows.
pub fn read_json_rows_str(input: &str) -> Result<Vec<Row>, IoError> {
    let value = serde_json::from_str::<serde_json::Value>(input)?;
    Ok(rows_from_json(&value)?)
}

/// Render rows as CSV. The header is the union of field names in first-seen
/// order; absent fields and nulls are empty cells.
pub fn write_csv_string(rows: &[Row]) -> Result<String, IoError> {
    let mut headers: Vec<&str> = Vec::new();
    for row in rows {
        for name in row.field_names() {
            if !headers.contains(&name) {
                headers.push(name);
            }
        }
    }

    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    if !headers.is_empty() {
        writer.write_record(&headers)?;
    }
    for row in rows {
        let record = headers
            .iter()
            .map(|name| scalar_to_csv(row.value(name)))
            .collect::<Vec<_>>();
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

/// int, then finite float, then bool; empty is null, anything else is text.
#[must_use]
pub fn infer_scalar(field: &str) -> Scalar {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Scalar::Null;
    }

    if let Ok(value) = trimmed.parse::<i64>() {
        return Scalar::Int64(value);
    }
    if let Ok(value) = trimmed.parse::<f64>()
        && value.is_finite()
    {
        return Scalar::Float64(value);
    }
    if let Ok(value) = trimmed.parse::<bool>() {
        return Scalar::Bool(value);
    }

    Scalar::Utf8(trimmed.to_owned())
}

fn scalar_to_csv(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Null => String::new(),
        Scalar::Float64(v) if v.is_nan() => String::new(),
        Scalar::Timestamp(ts) => ts.to_rfc3339(),
        other => other.to_string(),
    }
}
