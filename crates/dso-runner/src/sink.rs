use crate::error::{Result, RunError};
use crate::executor::ResultRecord;
use dso_core::{format_row, read_header};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Appends one row per replicate to a CSV summary file.
///
/// Appends take `&mut self`: the coordinator owns the sink and is the only
/// writer, so rows never interleave.
#[derive(Debug, Default)]
pub struct SummarySink {
    headers: HashMap<PathBuf, Vec<String>>,
    rows_written: usize,
}

fn sink_error(path: &Path) -> impl FnOnce(std::io::Error) -> RunError + '_ {
    move |source| RunError::Sink {
        path: path.to_path_buf(),
        source,
    }
}

pub fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Appends `record` to `path`. Returns true when this call wrote the
    /// header.
    pub fn append(&mut self, record: &ResultRecord, path: &Path) -> Result<bool> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(sink_error(path))?;
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let columns: Vec<String> =
                    record.field_names().into_iter().map(str::to_string).collect();
                let mut bytes = format_row(&columns);
                bytes.push_str(&self.row_for(record, &columns, path));
                file.write_all(bytes.as_bytes()).map_err(sink_error(path))?;
                file.sync_data().map_err(sink_error(path))?;
                self.headers.insert(path.to_path_buf(), columns);
                self.rows_written += 1;
                tracing::debug!(path = %path.display(), "created summary file");
                return Ok(true);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(sink_error(path)(e)),
        }

        let (columns, write_header) = match self.headers.get(path) {
            Some(columns) => (columns.clone(), false),
            None => match read_header(path).map_err(sink_error(path))? {
                Some(columns) => (columns, false),
                // present but empty: treat like a fresh file
                None => (
                    record
                        .field_names()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    true,
                ),
            },
        };

        let mut bytes = String::new();
        if write_header {
            bytes.push_str(&format_row(&columns));
        }
        bytes.push_str(&self.row_for(record, &columns, path));

        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(sink_error(path))?;
        file.write_all(bytes.as_bytes()).map_err(sink_error(path))?;
        file.sync_data().map_err(sink_error(path))?;
        self.headers.insert(path.to_path_buf(), columns);
        self.rows_written += 1;
        Ok(write_header)
    }

    fn row_for(&self, record: &ResultRecord, columns: &[String], path: &Path) -> String {
        let dropped: Vec<&str> = record
            .field_names()
            .into_iter()
            .filter(|name| !columns.iter().any(|c| c == name))
            .collect();
        if !dropped.is_empty() {
            tracing::warn!(
                path = %path.display(),
                columns = ?dropped,
                "result fields missing from existing summary header were dropped"
            );
        }
        let cells: Vec<String> = columns
            .iter()
            .map(|c| record.get(c).map(value_to_cell).unwrap_or_default())
            .collect();
        format_row(&cells)
    }
}
