use std::fs;
use std::path::Path;

use repdash_core::query_builder::QueryResult;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported export format for {path}; use .csv or .json")]
    UnsupportedFormat { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Writes the result in the format named by the file extension.
pub fn export_result(path: &Path, result: &QueryResult) -> Result<usize, ExportError> {
    match ExportFormat::from_path(path) {
        Some(ExportFormat::Csv) => export_result_to_csv(path, result),
        Some(ExportFormat::Json) => export_result_to_json(path, result),
        None => Err(ExportError::UnsupportedFormat {
            path: path.display().to_string(),
        }),
    }
}

pub fn export_result_to_csv(path: &Path, result: &QueryResult) -> Result<usize, ExportError> {
    let mut content = String::new();
    content.push_str(
        &result
            .columns
            .iter()
            .map(|header| csv_escape(header))
            .collect::<Vec<_>>()
            .join(","),
    );
    content.push('\n');

    for row in &result.rows {
        let values = (0..result.columns.len())
            .map(|column_index| {
                row.get(column_index)
                    .map(QueryResult::cell_text)
                    .unwrap_or_default()
            })
            .map(|value| csv_escape(&value))
            .collect::<Vec<_>>();
        content.push_str(&values.join(","));
        content.push('\n');
    }

    write(path, content)?;
    Ok(result.rows.len())
}

/// One object per row, keyed by column name. Cell values keep their JSON
/// types.
pub fn export_result_to_json(path: &Path, result: &QueryResult) -> Result<usize, ExportError> {
    let records = result
        .rows
        .iter()
        .map(|row| {
            let mut object = Map::with_capacity(result.columns.len());
            for (column_index, header) in result.columns.iter().enumerate() {
                let value = row.get(column_index).cloned().unwrap_or(Value::Null);
                object.insert(header.clone(), value);
            }
            Value::Object(object)
        })
        .collect::<Vec<_>>();

    let payload = serde_json::to_string_pretty(&records)?;
    write(path, payload)?;
    Ok(result.rows.len())
}

fn write(path: &Path, content: String) -> Result<(), ExportError> {
    fs::write(path, content).map_err(|source| ExportError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use repdash_core::query_builder::QueryResult;
    use serde_json::json;
    use tempfile::TempDir;

    use super::{export_result, ExportError, ExportFormat};

    fn sample() -> QueryResult {
        QueryResult {
            columns: vec!["region".to_string(), "note".to_string(), "total".to_string()],
            rows: vec![
                vec![json!("north"), json!("plain"), json!(10)],
                vec![json!("south"), json!("quote \"big\", late"), json!(null)],
            ],
            truncated: false,
            elapsed_ms: None,
        }
    }

    #[test]
    fn csv_export_escapes_and_blanks_nulls() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("result.csv");

        let written = export_result(&path, &sample()).expect("csv export failed");
        assert_eq!(written, 2);
        let output = fs::read_to_string(path).expect("failed to read csv output");
        assert!(output.starts_with("region,note,total\n"));
        assert!(output.contains("north,plain,10\n"));
        assert!(output.contains("south,\"quote \"\"big\"\", late\",\n"));
    }

    #[test]
    fn json_export_keeps_value_types() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("result.JSON");

        export_result(&path, &sample()).expect("json export failed");
        let output = fs::read_to_string(path).expect("failed to read json output");
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("invalid json");
        assert_eq!(parsed[0]["total"], 10);
        assert_eq!(parsed[1]["total"], serde_json::Value::Null);
        assert_eq!(parsed[1]["region"], "south");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert_eq!(ExportFormat::from_path(Path::new("out.xlsx")), None);
        let error = export_result(Path::new("out.xlsx"), &sample()).expect_err("should fail");
        assert!(matches!(error, ExportError::UnsupportedFormat { .. }));
    }
}
