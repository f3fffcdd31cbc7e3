use anyhow::Result;
use clap::{Parser, Subcommand};
use dso_analysis::{AnalyzeOptions, LogEval, LogReport};
use dso_runner::{Config, HarnessTrainer, LaunchEvent, LaunchOptions, LaunchReport, RunError};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dso", version = "0.3.0", about = "Multi-seed DSO experiment driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment configuration across several seeds.
    Run {
        config_template: Option<PathBuf>,
        #[arg(short = 'r', long, alias = "r", default_value_t = 1)]
        runs: usize,
        #[arg(
            short = 'n',
            long,
            alias = "n",
            default_value_t = 1,
            allow_negative_numbers = true
        )]
        n_cores_task: i64,
        #[arg(short = 's', long, alias = "s", allow_negative_numbers = true)]
        seed: Option<i64>,
        #[arg(short = 'b', long, alias = "b")]
        benchmark: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the materialized configuration without running anything.
    Describe {
        config_template: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize an existing experiment directory from its config.json.
    Analyze {
        config: PathBuf,
        #[arg(long)]
        show_count: Option<usize>,
        #[arg(long)]
        show_hof: bool,
        #[arg(long)]
        show_pf: bool,
        #[arg(long)]
        save_plots: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<RunError>()
                    .map(RunError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config_template,
            runs,
            n_cores_task,
            seed,
            benchmark,
            json,
        } => {
            let opts = LaunchOptions {
                config_template,
                runs,
                n_cores_task,
                seed,
                benchmark,
                cmd: std::env::args().collect::<Vec<_>>().join(" "),
            };
            let mut on_event = |event: LaunchEvent<'_>| {
                if json {
                    return;
                }
                match event {
                    LaunchEvent::Adjusted(adjustment) => println!("WARNING: {}", adjustment),
                    LaunchEvent::Started {
                        runs, save_path, ..
                    } => {
                        println!("Running DSO for {} seeds", runs);
                        println!("Saving results to {}", save_path.display());
                    }
                    LaunchEvent::Progress(completion) => println!("{}", completion.progress_line()),
                }
            };
            let report = dso_runner::launch(&opts, &mut on_event)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": launch_report_to_json(&report)?
                })));
            }
            println!("{}", report.analysis.render());
        }
        Commands::Describe {
            config_template,
            json,
        } => {
            let config = dso_runner::load_config(config_template.as_deref())?;
            let summary = describe_config(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary
                })));
            }
            print_summary(&summary);
        }
        Commands::Analyze {
            config,
            show_count,
            show_hof,
            show_pf,
            save_plots,
            json,
        } => {
            let eval = LogEval::new(&config)?;
            let defaults = eval.default_options();
            let opts = AnalyzeOptions {
                show_count: show_count.unwrap_or(defaults.show_count),
                show_hof: show_hof || defaults.show_hof,
                show_pf: show_pf || defaults.show_pf,
                save_plots: save_plots || defaults.save_plots,
            };
            let report = eval.analyze_log(&opts)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "analyze",
                    "analysis": analysis_to_json(&report)?
                })));
            }
            println!("{}", report.render());
        }
    }
    Ok(None)
}

fn describe_config(config: &Config) -> Result<Value> {
    let family = config.task_family()?;
    let harness = HarnessTrainer::from_config(config)
        .map(|h| h.command().to_vec())
        .unwrap_or_default();
    Ok(json!({
        "task_type": family.as_str(),
        "task_name": config.task_name(),
        "seed": config.seed(),
        "n_cores_batch": config.n_cores_batch(),
        "verbose": config.verbose(),
        "save_path": config.save_path().display().to_string(),
        "summary_path": config.summary_path().display().to_string(),
        "harness_command": harness
    }))
}

fn print_summary(summary: &Value) {
    let fields = [
        ("task type", "task_type"),
        ("task name", "task_name"),
        ("seed", "seed"),
        ("n_cores_batch", "n_cores_batch"),
        ("verbose", "verbose"),
        ("save path", "save_path"),
        ("summary", "summary_path"),
        ("harness", "harness_command"),
    ];
    for (label, key) in fields {
        let rendered = match summary.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) if items.is_empty() => "(not configured)".to_string(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>()
                .join(" "),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        println!("{}: {}", label, rendered);
    }
}

fn launch_report_to_json(report: &LaunchReport) -> Result<Value> {
    Ok(json!({
        "save_path": report.save_path.display().to_string(),
        "config_path": report.config_path.display().to_string(),
        "summary_path": report.summary_path.display().to_string(),
        "workers": report.workers,
        "adjustments": report
            .adjustments
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>(),
        "completions": serde_json::to_value(&report.completions)?,
        "analysis": analysis_to_json(&report.analysis)?
    }))
}

fn analysis_to_json(report: &LogReport) -> Result<Value> {
    Ok(serde_json::to_value(report)?)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Analyze { json, .. } => *json,
    }
}
