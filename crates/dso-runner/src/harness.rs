//! Training routine backed by an external harness process.
//!
//! Each replicate spawns `harness.command` once. The replicate's configuration
//! is written to the child's stdin as JSON and the result record is the last
//! stdout line that parses as a JSON object.

use crate::config::Config;
use crate::error::{Result, RunError};
use crate::executor::{EnvRegistry, ResultRecord, Trainer};
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};

#[derive(Debug, Clone)]
pub struct HarnessTrainer {
    command: Vec<String>,
    env_setup: Option<Vec<String>>,
}

fn command_from_value(value: Option<&Value>, field: &str) -> Result<Option<Vec<String>>> {
    let parts: Vec<String> = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(RunError::config(format!(
                    "{} entries must be strings (got {})",
                    field, other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(RunError::config(format!(
                "{} must be a string or a list of strings (got {})",
                field, other
            )))
        }
    };
    Ok(if parts.is_empty() { None } else { Some(parts) })
}

impl HarnessTrainer {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(RunError::config(
                "harness.command must name the training executable",
            ));
        }
        Ok(Self {
            command,
            env_setup: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let command = command_from_value(config.pointer("/harness/command"), "harness.command")?
            .unwrap_or_default();
        let mut trainer = Self::new(command)?;
        trainer.env_setup =
            command_from_value(config.pointer("/harness/env_setup"), "harness.env_setup")?;
        Ok(trainer)
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Registry whose setup hook runs `harness.env_setup <env_name>`.
    pub fn env_registry(&self) -> EnvRegistry {
        match self.env_setup.clone() {
            None => EnvRegistry::noop(),
            Some(setup) => EnvRegistry::new(move |env_name| {
                let status = Command::new(&setup[0])
                    .args(&setup[1..])
                    .arg(env_name)
                    .stdin(Stdio::null())
                    .status()
                    .with_context(|| format!("failed to spawn env setup {:?}", setup))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "env setup {:?} exited with {}",
                        setup,
                        status_label(status.code())
                    ))
                }
            }),
        }
    }
}

fn status_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn last_json_object(stdout: &str) -> Option<ResultRecord> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|line| {
            serde_json::from_str::<Value>(line)
                .ok()
                .and_then(ResultRecord::from_value)
        })
}

impl Trainer for HarnessTrainer {
    fn train(&self, config: &Config) -> anyhow::Result<ResultRecord> {
        let input = serde_json::to_vec(config.as_value())?;
        let seed = config.seed().unwrap_or_default();
        tracing::debug!(seed, command = ?self.command, "spawning harness");

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .env("DSO_SEED", seed.to_string())
            .env("DSO_SAVE_PATH", config.save_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn harness {:?}", self.command))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&input);
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(anyhow!(
                "harness exited with {}",
                status_label(output.status.code())
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        last_json_object(&stdout)
            .ok_or_else(|| anyhow!("harness exited without printing a JSON result record"))
    }
}
