//! Multi-seed experiment launcher: builds a seed plan from one
//! configuration, runs the replicates serially or on a bounded worker pool,
//! appends each result to the experiment's summary file and finally analyzes
//! the log directory.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod harness;
pub mod plan;
pub mod pool;
pub mod sink;

pub use config::{load_config, Config, TaskFamily};
pub use coordinator::{run_replicates, Completion};
pub use error::{Result, RunError};
pub use executor::{EnvRegistry, ReplicateExecutor, ReplicateOutput, ResultRecord, Trainer};
pub use harness::HarnessTrainer;
pub use plan::{build_seed_plan, Adjustment, PlanRequest, SeedPlan, ALL_CORES};
pub use pool::{Completions, WorkerPool, WorkerPanic};
pub use sink::SummarySink;

use dso_analysis::{LogEval, LogReport};
use dso_core::{atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub config_template: Option<PathBuf>,
    pub runs: usize,
    pub n_cores_task: i64,
    pub seed: Option<i64>,
    pub benchmark: Option<String>,
    pub cmd: String,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            config_template: None,
            runs: 1,
            n_cores_task: 1,
            seed: None,
            benchmark: None,
            cmd: String::new(),
        }
    }
}

/// Things a caller may want to show while a launch is in progress.
#[derive(Debug)]
pub enum LaunchEvent<'a> {
    Adjusted(&'a Adjustment),
    Started {
        runs: usize,
        workers: usize,
        save_path: &'a Path,
    },
    Progress(&'a Completion),
}

pub struct LaunchReport {
    pub save_path: PathBuf,
    pub config_path: PathBuf,
    pub summary_path: PathBuf,
    pub workers: usize,
    pub adjustments: Vec<Adjustment>,
    pub completions: Vec<Completion>,
    pub analysis: LogReport,
}

/// Loads the configuration and derives the seed plan. The timestamp is taken
/// once here so every replicate shares it.
pub fn prepare_plan(opts: &LaunchOptions) -> Result<SeedPlan> {
    let config = load_config(opts.config_template.as_deref())?;
    let request = PlanRequest {
        runs: opts.runs,
        n_cores_task: opts.n_cores_task,
        seed: opts.seed,
        benchmark: opts.benchmark.clone(),
        cmd: opts.cmd.clone(),
        timestamp: plan::experiment_timestamp(),
    };
    build_seed_plan(config, &request, plan::available_parallelism())
}

fn write_experiment_config(save_path: &Path, base: &Config) -> Result<PathBuf> {
    let config_path = save_path.join("config.json");
    atomic_write_json_pretty(&config_path, base.as_value()).map_err(|e| RunError::Artifact {
        path: config_path.clone(),
        message: format!("{:#}", e),
    })?;
    let digest_path = save_path.join("config.digest");
    atomic_write_bytes(&digest_path, canonical_json_digest(base.as_value()).as_bytes()).map_err(
        |e| RunError::Artifact {
            path: digest_path.clone(),
            message: format!("{:#}", e),
        },
    )?;
    Ok(config_path)
}

/// Runs a prepared plan with the given training routine, then analyzes the
/// experiment directory.
pub fn launch_with_trainer(
    plan: SeedPlan,
    trainer: Arc<dyn Trainer>,
    registry: Arc<EnvRegistry>,
    on_event: &mut dyn FnMut(LaunchEvent<'_>),
) -> Result<LaunchReport> {
    for adjustment in &plan.adjustments {
        on_event(LaunchEvent::Adjusted(adjustment));
    }

    let save_path = plan.base.save_path();
    let summary_path = plan.base.summary_path();
    let config_path = write_experiment_config(&save_path, &plan.base)?;
    on_event(LaunchEvent::Started {
        runs: plan.runs(),
        workers: plan.workers,
        save_path: &save_path,
    });

    let executor = ReplicateExecutor::new(trainer, registry);
    let mut sink = SummarySink::new();
    let completions = run_replicates(plan.configs, plan.workers, &executor, &mut sink, |c| {
        on_event(LaunchEvent::Progress(c))
    })?;

    let analysis = LogEval::new(&config_path)
        .and_then(|eval| eval.analyze_log(&eval.default_options()))
        .map_err(|e| RunError::Analysis(format!("{:#}", e)))?;

    Ok(LaunchReport {
        save_path,
        config_path,
        summary_path,
        workers: plan.workers,
        adjustments: plan.adjustments,
        completions,
        analysis,
    })
}

/// Full launch with the harness-backed training routine named in the config.
pub fn launch(
    opts: &LaunchOptions,
    on_event: &mut dyn FnMut(LaunchEvent<'_>),
) -> Result<LaunchReport> {
    let plan = prepare_plan(opts)?;
    let trainer = HarnessTrainer::from_config(&plan.base)?;
    let registry = Arc::new(trainer.env_registry());
    launch_with_trainer(plan, Arc::new(trainer), registry, on_event)
}
