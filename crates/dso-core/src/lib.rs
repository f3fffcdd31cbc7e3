use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest of `value` with object keys sorted, so two configs that differ only
/// in key order hash the same.
pub fn canonical_json_digest(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    sha256_bytes(&bytes)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn needs_quoting(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Encodes one CSV record, newline included.
pub fn format_row<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        let field = field.as_ref();
        if needs_quoting(field) {
            line.push('"');
            line.push_str(&field.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(field);
        }
    }
    line.push('\n');
    line
}

/// Decodes CSV text into records. Quoted fields may span lines.
pub fn parse_table(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut row_started = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                row_started = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                row_started = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                if row_started || !field.is_empty() {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                row_started = false;
            }
            _ => {
                field.push(c);
                row_started = true;
            }
        }
    }
    if row_started || !field.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

/// Reads only the first record of a CSV file.
pub fn read_header(path: &Path) -> std::io::Result<Option<Vec<String>>> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut text = String::new();
    loop {
        let read = reader.read_line(&mut text)?;
        // a record is complete once its quotes balance
        if read == 0 || text.matches('"').count() % 2 == 0 {
            break;
        }
    }
    Ok(parse_table(&text).into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_row_quotes_only_when_needed() {
        let line = format_row(&["plain", "a,b", "say \"hi\"", ""]);
        assert_eq!(line, "plain,\"a,b\",\"say \"\"hi\"\"\",\n");
    }

    #[test]
    fn parse_table_handles_quotes_and_multiline_fields() {
        let text = "expr,r\n\"add(x1, x2)\",0.5\n\"line1\nline2\",\"q\"\"x\"\n";
        let rows = parse_table(text);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["add(x1, x2)", "0.5"]);
        assert_eq!(rows[2], vec!["line1\nline2", "q\"x"]);
    }

    #[test]
    fn parse_table_keeps_trailing_empty_field() {
        let rows = parse_table("a,b,\n1,2,\n");
        assert_eq!(rows[0], vec!["a", "b", ""]);
        assert_eq!(rows[1], vec!["1", "2", ""]);
    }

    #[test]
    fn read_header_stops_after_first_record() {
        let root = std::env::temp_dir().join(format!(
            "dso_core_header_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        let path = root.join("summary.csv");
        fs::write(&path, "seed,\"multi\nline\",t\n1,x,0.5\n").expect("write");
        let header = read_header(&path).expect("read").expect("header");
        assert_eq!(header, vec!["seed", "multi\nline", "t"]);
        fs::write(&path, "").expect("truncate");
        assert!(read_header(&path).expect("read").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"x": 1, "y": {"b": 2, "a": [1, 2]}});
        let b = json!({"y": {"a": [1, 2], "b": 2}, "x": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let root = std::env::temp_dir().join(format!(
            "dso_core_atomic_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("nested").join("config.json");
        atomic_write_json_pretty(&path, &json!({"seed": 1})).expect("first write");
        atomic_write_json_pretty(&path, &json!({"seed": 2})).expect("second write");
        let back: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        assert_eq!(back, json!({"seed": 2}));
        let _ = fs::remove_dir_all(root);
    }
}
