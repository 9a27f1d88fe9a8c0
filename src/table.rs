//! Shared CSV helpers for uploaded tables (funnel, A/B results) and LLM output.

use std::path::PathBuf;

use csv::StringRecord;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while reading a tabular upload.
#[derive(Debug, Error)]
pub enum TableError {
    /// The upload could not be opened or read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed to open.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The CSV stream itself was unreadable (bad header row, invalid UTF-8).
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    /// A required column is absent from the header row.
    #[error("missing required column `{0}`")]
    MissingColumn(&'static str),
    /// A cell of a strictly-typed table could not be decoded.
    #[error("invalid {column} value `{value}`")]
    InvalidValue {
        /// Column name.
        column: &'static str,
        /// Offending raw value.
        value: String,
    },
}

/// A data row that was dropped during lenient parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    /// 1-based line number inside the source text, when known.
    pub line: Option<u64>,
    /// Human-readable reason the row was dropped.
    pub reason: String,
}

impl SkippedRow {
    pub(crate) fn new(line: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }

    pub(crate) fn at(record: &StringRecord, reason: impl Into<String>) -> Self {
        Self::new(record.position().map(|pos| pos.line()), reason)
    }
}

/// Locates a header column by case-insensitive, trimmed name.
pub(crate) fn column_index(headers: &StringRecord, name: &'static str) -> Result<usize, TableError> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
        .ok_or(TableError::MissingColumn(name))
}

/// Reads a field by index, trimming whitespace and stray wrapping quotes.
pub(crate) fn field(record: &StringRecord, index: usize) -> &str {
    clean_field(record.get(index).unwrap_or(""))
}

/// Trims whitespace plus one layer of wrapping double quotes.
///
/// LLM output often places a space between the delimiter and an opening quote
/// (`"a", "b"`), which the CSV reader keeps as a literal quoted string.
pub(crate) fn clean_field(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].trim()
    } else {
        trimmed
    }
}

pub(crate) fn parse_count(raw: &str) -> Option<u64> {
    let cleaned: String = raw.chars().filter(|ch| *ch != ',' && *ch != '_').collect();
    if let Ok(value) = cleaned.parse::<u64>() {
        return Some(value);
    }
    // Spreadsheet exports frequently render integer counts as `1000.0`.
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0 && value.fract() == 0.0)
        .map(|value| value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_field_strips_wrapping_quotes() {
        assert_eq!(clean_field("  \"Increase contrast\" "), "Increase contrast");
        assert_eq!(clean_field("plain"), "plain");
        assert_eq!(clean_field("\""), "\"");
    }

    #[test]
    fn parse_count_accepts_spreadsheet_shapes() {
        assert_eq!(parse_count("1000"), Some(1000));
        assert_eq!(parse_count("1,000"), Some(1000));
        assert_eq!(parse_count("400.0"), Some(400));
        assert_eq!(parse_count("12.5"), None);
        assert_eq!(parse_count("-3"), None);
        assert_eq!(parse_count("many"), None);
    }

    #[test]
    fn column_lookup_ignores_case_and_padding() {
        let headers = StringRecord::from(vec![" Step_Name ", "USERS"]);
        assert_eq!(column_index(&headers, "step_name").unwrap(), 0);
        assert_eq!(column_index(&headers, "users").unwrap(), 1);
        assert!(matches!(
            column_index(&headers, "variant"),
            Err(TableError::MissingColumn("variant"))
        ));
    }
}
