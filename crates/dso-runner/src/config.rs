use crate::error::{Result, RunError};
use serde_json::{json, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_COMMON: &str = r#"{
  "experiment": {
    "logdir": "./log",
    "exp_name": null,
    "seed": 0
  },
  "task": {
    "task_type": "regression"
  },
  "training": {
    "n_samples": 2000000,
    "batch_size": 1000,
    "epsilon": 0.05,
    "baseline": "R_e",
    "n_cores_batch": 1,
    "verbose": true,
    "hof": 100,
    "save_pareto_front": true,
    "save_summary": false
  },
  "postprocess": {
    "show_count": 5,
    "save_plots": true
  },
  "harness": {
    "command": [],
    "env_setup": null
  }
}"#;

const DEFAULT_REGRESSION: &str = r#"{
  "task": {
    "task_type": "regression",
    "dataset": "Nguyen-1",
    "function_set": ["add", "sub", "mul", "div", "sin", "cos", "exp", "log"],
    "metric": "inv_nrmse",
    "threshold": 1e-12
  }
}"#;

const DEFAULT_CONTROL: &str = r#"{
  "task": {
    "task_type": "control",
    "env": "MountainCarContinuous-v0",
    "function_set": ["add", "sub", "mul", "div", "sin", "cos", "exp", "log", 1.0, 5.0, 10.0],
    "action_spec": [null],
    "n_episodes_train": 10,
    "reward_threshold": 99.0
  }
}"#;

const REQUIRED_POINTERS: &[&str] = &[
    "/experiment",
    "/experiment/logdir",
    "/task/task_type",
    "/training/n_cores_batch",
    "/training/verbose",
    "/postprocess/show_count",
    "/postprocess/save_plots",
];

/// The family a task belongs to decides which field a benchmark override
/// targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFamily {
    Regression,
    Control,
    Other(String),
}

impl TaskFamily {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "regression" => TaskFamily::Regression,
            "control" => TaskFamily::Control,
            other => TaskFamily::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskFamily::Regression => "regression",
            TaskFamily::Control => "control",
            TaskFamily::Other(name) => name,
        }
    }

    /// Pointer a `--benchmark` override writes to, if the family has one.
    pub fn benchmark_pointer(&self) -> Option<&'static str> {
        match self {
            TaskFamily::Regression => Some("/task/dataset"),
            TaskFamily::Control => Some("/task/env"),
            TaskFamily::Other(_) => None,
        }
    }
}

impl fmt::Display for TaskFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A materialized experiment configuration. Cloning is a deep copy, so each
/// replicate owns its own tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.root.pointer(pointer)
    }

    pub fn set(&mut self, pointer: &str, value: Value) -> Result<()> {
        set_json_pointer_value(&mut self.root, pointer, value)
    }

    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.pointer(pointer).and_then(|v| v.as_str())
    }

    pub fn task_family(&self) -> Result<TaskFamily> {
        self.str_at("/task/task_type")
            .map(TaskFamily::parse)
            .ok_or_else(|| RunError::config("missing /task/task_type"))
    }

    pub fn seed(&self) -> Option<i64> {
        self.pointer("/experiment/seed").and_then(|v| v.as_i64())
    }

    pub fn verbose(&self) -> bool {
        self.pointer("/training/verbose")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn n_cores_batch(&self) -> i64 {
        self.pointer("/training/n_cores_batch")
            .and_then(|v| v.as_i64())
            .unwrap_or(1)
    }

    /// `-1` asks for every core, so it counts as parallel too.
    pub fn batch_parallelism_enabled(&self) -> bool {
        let n = self.n_cores_batch();
        n > 1 || n == -1
    }

    pub fn env_name(&self) -> Option<&str> {
        self.str_at("/task/env")
    }

    pub fn task_name(&self) -> String {
        match self.task_family() {
            Ok(TaskFamily::Regression) => self
                .str_at("/task/dataset")
                .map(|d| {
                    Path::new(d)
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or(d)
                        .to_string()
                })
                .unwrap_or_else(|| "regression".to_string()),
            Ok(TaskFamily::Control) => self.env_name().unwrap_or("control").to_string(),
            Ok(TaskFamily::Other(name)) => name,
            Err(_) => "task".to_string(),
        }
    }

    /// Experiment directory: `logdir/exp_name`, where the name falls back to
    /// `<task_name>_<timestamp>`.
    pub fn save_path(&self) -> PathBuf {
        let logdir = self.str_at("/experiment/logdir").unwrap_or("./log");
        let exp_name = match self.str_at("/experiment/exp_name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => match self.str_at("/experiment/timestamp") {
                Some(ts) => format!("{}_{}", self.task_name(), ts),
                None => self.task_name(),
            },
        };
        PathBuf::from(logdir).join(exp_name)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.save_path().join("summary.csv")
    }
}

/// Materializes a configuration: common defaults, then the task family's
/// defaults, then the template (if any).
pub fn load_config(template: Option<&Path>) -> Result<Config> {
    let user = match template {
        Some(path) => read_config_file(path)?,
        None => json!({}),
    };
    let task_type = user
        .pointer("/task/task_type")
        .and_then(|v| v.as_str())
        .unwrap_or("regression")
        .to_string();

    let mut root: Value = serde_json::from_str(DEFAULT_COMMON)?;
    match TaskFamily::parse(&task_type) {
        TaskFamily::Regression => merge_json(&mut root, serde_json::from_str(DEFAULT_REGRESSION)?),
        TaskFamily::Control => merge_json(&mut root, serde_json::from_str(DEFAULT_CONTROL)?),
        TaskFamily::Other(_) => {}
    }
    merge_json(&mut root, user);
    validate_required_fields(&root)?;
    tracing::debug!(task_type = %task_type, "materialized configuration");
    Ok(Config::from_value(root))
}

fn read_config_file(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).map_err(|e| {
        RunError::config(format!("cannot read config {}: {}", path.display(), e))
    })?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let value: Value = serde_json::to_value(yaml_value)?;
    if !value.is_object() {
        return Err(RunError::config(format!(
            "config {} must be a mapping at the top level",
            path.display()
        )));
    }
    Ok(value)
}

/// Objects merge key by key; anything else in `overlay` replaces `base`.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_object()
                    && base_map.get(&key).map(Value::is_object).unwrap_or(false);
                if !nested {
                    base_map.insert(key, value);
                } else if let Some(existing) = base_map.get_mut(&key) {
                    merge_json(existing, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

pub fn validate_required_fields(root: &Value) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_POINTERS
        .iter()
        .copied()
        .filter(|p| root.pointer(p).map(|v| v.is_null()).unwrap_or(true))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RunError::config(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn set_json_pointer_value(root: &mut Value, pointer: &str, new_value: Value) -> Result<()> {
    if pointer.is_empty() || pointer == "/" {
        *root = new_value;
        return Ok(());
    }
    if !pointer.starts_with('/') {
        return Err(RunError::config(format!(
            "json_pointer must start with '/': {}",
            pointer
        )));
    }

    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(decode_pointer_token)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut cur = root;
    for token in parents {
        cur = match cur {
            Value::Object(map) => map.entry(token.clone()).or_insert_with(|| json!({})),
            Value::Array(arr) => {
                let idx = array_index(token, arr.len(), pointer)?;
                &mut arr[idx]
            }
            _ => {
                return Err(RunError::config(format!(
                    "json_pointer traversal hit non-container at token '{}' in {}",
                    token, pointer
                )));
            }
        };
    }

    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), new_value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = array_index(last, arr.len(), pointer)?;
            arr[idx] = new_value;
            Ok(())
        }
        _ => Err(RunError::config(format!(
            "json_pointer target is not an object/array for {}",
            pointer
        ))),
    }
}

fn array_index(token: &str, len: usize, pointer: &str) -> Result<usize> {
    let idx: usize = token.parse().map_err(|_| {
        RunError::config(format!(
            "json_pointer token '{}' is not a valid array index in {}",
            token, pointer
        ))
    })?;
    if idx >= len {
        return Err(RunError::config(format!(
            "json_pointer array index {} out of bounds in {}",
            idx, pointer
        )));
    }
    Ok(idx)
}
