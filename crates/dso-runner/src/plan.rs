use crate::config::{Config, TaskFamily};
use crate::error::{Result, RunError};
use chrono::Local;
use serde_json::{json, Value};
use std::fmt;

/// `n_cores_task` value meaning "every available core".
pub const ALL_CORES: i64 = -1;

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub runs: usize,
    pub n_cores_task: i64,
    pub seed: Option<i64>,
    pub benchmark: Option<String>,
    pub cmd: String,
    pub timestamp: String,
}

/// A documented correction applied to the base configuration before it is
/// copied per replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjustment {
    SeedOverridden { configured: String, requested: i64 },
    WorkersClamped { requested: usize, runs: usize },
    VerboseDisabled,
    BatchCoresForced { configured: i64 },
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adjustment::SeedOverridden {
                configured,
                requested,
            } => write!(
                f,
                "Overwriting config seed {} with command-line seed {}.",
                configured, requested
            ),
            Adjustment::WorkersClamped { requested, runs } => write!(
                f,
                "Setting 'n_cores_task' to {} (requested {}) because there are only {} replicates.",
                runs, requested, runs
            ),
            Adjustment::VerboseDisabled => {
                write!(f, "Setting 'verbose' to False for parallelized run.")
            }
            Adjustment::BatchCoresForced { configured } => write!(
                f,
                "Setting 'n_cores_batch' to 1 (was {}) to avoid nested child processes.",
                configured
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeedPlan {
    /// Post-adjustment configuration carrying the starting seed.
    pub base: Config,
    /// One configuration per replicate, in submission order.
    pub configs: Vec<Config>,
    pub workers: usize,
    pub adjustments: Vec<Adjustment>,
}

impl SeedPlan {
    pub fn runs(&self) -> usize {
        self.configs.len()
    }

    pub fn starting_seed(&self) -> Option<i64> {
        self.base.seed()
    }
}

pub fn experiment_timestamp() -> String {
    Local::now().format("%Y-%m-%d-%H%M%S").to_string()
}

pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolves a requested task-level worker count against the replicate count.
/// The result is always within `1..=runs`.
pub fn resolve_worker_count(
    requested: i64,
    runs: usize,
    available: usize,
) -> Result<(usize, Option<Adjustment>)> {
    if runs == 0 {
        return Err(RunError::config("runs must be at least 1"));
    }
    let wanted = match requested {
        ALL_CORES => available.max(1),
        n if n >= 1 => usize::try_from(n)
            .map_err(|_| RunError::config(format!("n_cores_task {} is out of range", n)))?,
        n => {
            return Err(RunError::config(format!(
                "n_cores_task must be -1 or a positive integer (got {})",
                n
            )))
        }
    };
    if wanted > runs {
        Ok((
            runs,
            Some(Adjustment::WorkersClamped {
                requested: wanted,
                runs,
            }),
        ))
    } else {
        Ok((wanted, None))
    }
}

fn apply_benchmark(config: &mut Config, family: &TaskFamily, benchmark: &str) -> Result<()> {
    let pointer = family.benchmark_pointer().ok_or_else(|| {
        RunError::config(format!(
            "--benchmark is not supported for task {}",
            family
        ))
    })?;
    config.set(pointer, Value::String(benchmark.to_string()))
}

/// Derives one configuration per replicate from `base`. Every replicate
/// shares the timestamp and command string; seeds are `start + i`.
pub fn build_seed_plan(mut base: Config, request: &PlanRequest, available: usize) -> Result<SeedPlan> {
    if request.runs == 0 {
        return Err(RunError::config("runs must be at least 1"));
    }
    let family = base.task_family()?;
    let mut adjustments = Vec::new();

    if let Some(benchmark) = request.benchmark.as_deref() {
        apply_benchmark(&mut base, &family, benchmark)?;
    }

    let configured_seed = base
        .pointer("/experiment/seed")
        .cloned()
        .unwrap_or(Value::Null);
    match request.seed {
        Some(requested) => {
            if !configured_seed.is_null() {
                let configured = match configured_seed {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                adjustments.push(Adjustment::SeedOverridden {
                    configured,
                    requested,
                });
            }
            base.set("/experiment/seed", json!(requested))?;
        }
        None if !configured_seed.is_null() && !configured_seed.is_i64() => {
            return Err(RunError::config(format!(
                "experiment.seed must be an integer (got {})",
                configured_seed
            )));
        }
        None => {}
    }
    let start = base.seed().ok_or_else(|| {
        RunError::config("no starting seed: set experiment.seed or pass --seed")
    })?;
    let runs = request.runs as i64;
    if start.checked_add(runs - 1).is_none() {
        return Err(RunError::config(format!(
            "seed range {} + {} overflows",
            start, runs
        )));
    }

    base.set("/experiment/starting_seed", json!(start))?;
    base.set("/experiment/cmd", json!(request.cmd))?;
    base.set("/experiment/timestamp", json!(request.timestamp))?;

    let (workers, clamp) = resolve_worker_count(request.n_cores_task, request.runs, available)?;
    adjustments.extend(clamp);
    if workers > 1 {
        if base.verbose() {
            base.set("/training/verbose", json!(false))?;
            adjustments.push(Adjustment::VerboseDisabled);
        }
        let configured = base.n_cores_batch();
        if configured != 1 {
            base.set("/training/n_cores_batch", json!(1))?;
            adjustments.push(Adjustment::BatchCoresForced { configured });
        }
    }
    for adjustment in &adjustments {
        tracing::warn!(%adjustment, "adjusted launch configuration");
    }

    let configs = (0..request.runs)
        .map(|i| {
            let mut config = base.clone();
            config.set("/experiment/seed", json!(start + i as i64))?;
            Ok(config)
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        runs = request.runs,
        workers,
        starting_seed = start,
        task_type = %family,
        "built seed plan"
    );
    Ok(SeedPlan {
        base,
        configs,
        workers,
        adjustments,
    })
}
