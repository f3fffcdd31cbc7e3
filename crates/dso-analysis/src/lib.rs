//! Post-run analysis over an experiment's log directory.

use anyhow::{anyhow, Context, Result};
use dso_core::{atomic_write_bytes, format_row, parse_table};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SUMMARY_FILE: &str = "summary.csv";
pub const STATS_FILE: &str = "summary_stats.csv";
const RANK_COLUMN: &str = "r_best";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzeOptions {
    pub show_count: usize,
    pub show_hof: bool,
    pub show_pf: bool,
    pub save_plots: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            show_count: 5,
            show_hof: false,
            show_pf: false,
            save_plots: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricStats {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogReport {
    pub log_dir: PathBuf,
    pub runs: usize,
    pub columns: Vec<String>,
    pub stats: Vec<MetricStats>,
    pub top: Vec<Map<String, Value>>,
    pub hof_files: Vec<PathBuf>,
    pub pf_files: Vec<PathBuf>,
    pub stats_path: Option<PathBuf>,
}

impl LogReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "-- ANALYZING LOG START --------------");
        let _ = writeln!(out, "log_dir: {}", self.log_dir.display());
        let _ = writeln!(out, "runs: {}", self.runs);
        for s in &self.stats {
            let _ = writeln!(
                out,
                "{}: mean={:.6} std={:.6} min={:.6} max={:.6} (n={})",
                s.name, s.mean, s.std, s.min, s.max, s.count
            );
        }
        if !self.top.is_empty() {
            let _ = writeln!(out, "top {} runs:", self.top.len());
            for (rank, row) in self.top.iter().enumerate() {
                let cells: Vec<String> = row
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.as_str().unwrap_or_default()))
                    .collect();
                let _ = writeln!(out, "  {}. {}", rank + 1, cells.join(" "));
            }
        }
        for path in &self.hof_files {
            let _ = writeln!(out, "hall of fame: {}", path.display());
        }
        for path in &self.pf_files {
            let _ = writeln!(out, "pareto front: {}", path.display());
        }
        if let Some(path) = &self.stats_path {
            let _ = writeln!(out, "saved: {}", path.display());
        }
        let _ = write!(out, "-- ANALYZING LOG END ----------------");
        out
    }
}

/// A parsed summary file.
#[derive(Debug, Clone, Default)]
pub struct SummaryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SummaryTable {
    pub fn parse(text: &str) -> Self {
        let mut records = parse_table(text).into_iter();
        let columns = records.next().unwrap_or_default();
        Self {
            columns,
            rows: records.collect(),
        }
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of a column when every non-empty cell is numeric.
    pub fn numeric_column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        let mut values = Vec::new();
        for row in &self.rows {
            let cell = row.get(idx).map(|s| s.trim()).unwrap_or_default();
            if cell.is_empty() {
                continue;
            }
            values.push(cell.parse::<f64>().ok()?);
        }
        if values.is_empty() {
            None
        } else {
            Some(values)
        }
    }

    fn row_map(&self, row: &[String]) -> Map<String, Value> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                (
                    c.clone(),
                    Value::String(row.get(i).cloned().unwrap_or_default()),
                )
            })
            .collect()
    }
}

fn describe(name: &str, values: &[f64]) -> MetricStats {
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let std = if count > 1 {
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };
    MetricStats {
        name: name.to_string(),
        count,
        mean,
        std,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

pub struct LogEval {
    log_dir: PathBuf,
    config: Value,
}

impl LogEval {
    pub fn new(config_path: &Path) -> Result<Self> {
        let raw = fs::read(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config: Value = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        let log_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            log_dir,
            config,
        })
    }

    pub fn from_log_dir(log_dir: &Path) -> Result<Self> {
        Self::new(&log_dir.join("config.json"))
    }

    /// Options recorded in the experiment's own config.
    pub fn default_options(&self) -> AnalyzeOptions {
        let c = &self.config;
        AnalyzeOptions {
            show_count: c
                .pointer("/postprocess/show_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(5) as usize,
            show_hof: c
                .pointer("/training/hof")
                .and_then(|v| v.as_i64())
                .map(|h| h > 0)
                .unwrap_or(false),
            show_pf: c
                .pointer("/training/save_pareto_front")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            save_plots: c
                .pointer("/postprocess/save_plots")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }

    pub fn load_summary(&self) -> Result<SummaryTable> {
        let path = self.log_dir.join(SUMMARY_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let table = SummaryTable::parse(&text);
        if table.columns.is_empty() {
            return Err(anyhow!("summary file {} is empty", path.display()));
        }
        Ok(table)
    }

    fn files_with_suffix(&self, suffix: &str) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.log_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.ends_with(suffix))
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    pub fn analyze_log(&self, opts: &AnalyzeOptions) -> Result<LogReport> {
        let table = self.load_summary()?;
        tracing::info!(
            log_dir = %self.log_dir.display(),
            runs = table.rows.len(),
            "analyzing log"
        );

        let stats: Vec<MetricStats> = table
            .columns
            .iter()
            .filter_map(|c| table.numeric_column(c).map(|v| describe(c, &v)))
            .collect();

        let mut ranked: Vec<&Vec<String>> = table.rows.iter().collect();
        if let Some(idx) = table
            .column_index(RANK_COLUMN)
            .filter(|_| table.numeric_column(RANK_COLUMN).is_some())
        {
            let key = |row: &Vec<String>| {
                row.get(idx)
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .unwrap_or(f64::NEG_INFINITY)
            };
            ranked.sort_by(|a, b| key(*b).partial_cmp(&key(*a)).unwrap_or(Ordering::Equal));
        }
        let top = ranked
            .into_iter()
            .take(opts.show_count)
            .map(|row| table.row_map(row))
            .collect();

        let hof_files = if opts.show_hof {
            self.files_with_suffix("_hof.csv")
        } else {
            Vec::new()
        };
        let pf_files = if opts.show_pf {
            self.files_with_suffix("_pf.csv")
        } else {
            Vec::new()
        };

        let stats_path = if opts.save_plots {
            let path = self.log_dir.join(STATS_FILE);
            let mut text = format_row(&["metric", "count", "mean", "std", "min", "max"]);
            for s in &stats {
                text.push_str(&format_row(&[
                    s.name.clone(),
                    s.count.to_string(),
                    s.mean.to_string(),
                    s.std.to_string(),
                    s.min.to_string(),
                    s.max.to_string(),
                ]));
            }
            atomic_write_bytes(&path, text.as_bytes())?;
            Some(path)
        } else {
            None
        };

        Ok(LogReport {
            log_dir: self.log_dir.clone(),
            runs: table.rows.len(),
            columns: table.columns.clone(),
            stats,
            top,
            hof_files,
            pf_files,
            stats_path,
        })
    }
}
