use chrono::Utc;
use dso_core::parse_table;
use dso_runner::{
    launch_with_trainer, prepare_plan, Config, EnvRegistry, LaunchEvent, LaunchOptions,
    ResultRecord, RunError, Trainer,
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "dso_launch_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("temp root");
    root
}

fn write_template(root: &Path, extra: &str) -> PathBuf {
    let path = root.join("config.yaml");
    let body = format!(
        "experiment:\n  logdir: {}\n  exp_name: trial\n{}",
        root.join("log").display(),
        extra
    );
    fs::write(&path, body).expect("template");
    path
}

fn options(template: PathBuf, runs: usize, n_cores_task: i64, seed: Option<i64>) -> LaunchOptions {
    LaunchOptions {
        config_template: Some(template),
        runs,
        n_cores_task,
        seed,
        benchmark: None,
        cmd: "dso run config.yaml".to_string(),
    }
}

/// Deterministic stand-in for a training run.
#[derive(Default)]
struct FakeTrainer {
    slow_seed: Option<(i64, u64)>,
    failing_seed: Option<i64>,
    seen: Mutex<Vec<(i64, bool, i64)>>,
}

impl Trainer for FakeTrainer {
    fn train(&self, config: &Config) -> anyhow::Result<ResultRecord> {
        let seed = config.seed().unwrap_or(-1);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((seed, config.verbose(), config.n_cores_batch()));
        }
        let delay = match self.slow_seed {
            Some((slow, ms)) if slow == seed => ms,
            _ => 20,
        };
        thread::sleep(Duration::from_millis(delay));
        if self.failing_seed == Some(seed) {
            anyhow::bail!("diverged at seed {}", seed);
        }
        Ok(ResultRecord::new()
            .with("seed", json!(seed))
            .with("r_best", json!(seed as f64 / 100.0))
            .with("expression", json!("mul(x1, x1)"))
            .with("program", json!({"tokens": [1, 2, 3]})))
    }
}

fn summary_rows(path: &Path) -> Vec<Vec<String>> {
    parse_table(&fs::read_to_string(path).expect("summary"))
}

#[test]
fn serial_run_writes_rows_in_seed_order() {
    let root = temp_root("serial");
    let template = write_template(&root, "");
    let plan = prepare_plan(&options(template, 3, 1, Some(100))).expect("plan");
    assert_eq!(plan.workers, 1);

    let trainer = Arc::new(FakeTrainer::default());
    let mut progress = Vec::new();
    let report = launch_with_trainer(
        plan,
        trainer.clone(),
        Arc::new(EnvRegistry::noop()),
        &mut |event| {
            if let LaunchEvent::Progress(c) = event {
                progress.push(c.progress_line());
            }
        },
    )
    .expect("launch");

    let rows = summary_rows(&report.summary_path);
    assert_eq!(rows.len(), 4, "one header and three rows");
    assert_eq!(rows[0], vec!["seed", "r_best", "expression", "t"]);
    let seeds: Vec<&str> = rows[1..].iter().map(|r| r[0].as_str()).collect();
    assert_eq!(seeds, vec!["100", "101", "102"]);
    assert_eq!(progress.len(), 3);
    assert!(progress[0].starts_with("Completed 1 of 3 in"));
    assert!(report.config_path.exists());
    assert!(report.save_path.join("config.digest").exists());
    assert_eq!(report.analysis.runs, 3);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn parallel_rows_follow_completion_order() {
    let root = temp_root("parallel");
    let template = write_template(&root, "");
    let plan = prepare_plan(&options(template, 4, 2, Some(0))).expect("plan");
    assert_eq!(plan.workers, 2);

    let trainer = Arc::new(FakeTrainer {
        slow_seed: Some((0, 400)),
        ..FakeTrainer::default()
    });
    let report = launch_with_trainer(
        plan,
        trainer.clone(),
        Arc::new(EnvRegistry::noop()),
        &mut |_| {},
    )
    .expect("launch");

    let rows = summary_rows(&report.summary_path);
    assert_eq!(rows.len(), 5);
    let position = |seed: &str| {
        rows.iter()
            .position(|r| r[0] == seed)
            .expect("seed row present")
    };
    assert!(position("1") < position("0"));

    let mut seeds: Vec<i64> = report.completions.iter().map(|c| c.seed).collect();
    seeds.sort();
    assert_eq!(seeds, vec![0, 1, 2, 3], "each replicate aggregated once");
    let indices: Vec<usize> = report.completions.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn parallel_replicates_run_quiet_with_single_core_batches() {
    let root = temp_root("quiet");
    let template = write_template(&root, "training:\n  verbose: true\n  n_cores_batch: 4\n");
    let plan = prepare_plan(&options(template, 3, 3, None)).expect("plan");
    assert_eq!(plan.adjustments.len(), 2);

    let trainer = Arc::new(FakeTrainer::default());
    let mut warnings = Vec::new();
    launch_with_trainer(
        plan,
        trainer.clone(),
        Arc::new(EnvRegistry::noop()),
        &mut |event| {
            if let LaunchEvent::Adjusted(a) = event {
                warnings.push(a.to_string());
            }
        },
    )
    .expect("launch");

    assert_eq!(warnings.len(), 2);
    let seen = trainer.seen.lock().expect("seen");
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(_, verbose, batch)| !verbose && *batch == 1));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn failing_replicate_aborts_and_keeps_earlier_rows() {
    let root = temp_root("failing");
    let template = write_template(&root, "");
    let plan = prepare_plan(&options(template, 4, 1, Some(10))).expect("plan");
    let summary = plan.base.summary_path();

    let trainer = Arc::new(FakeTrainer {
        failing_seed: Some(12),
        ..FakeTrainer::default()
    });
    let err = match launch_with_trainer(
        plan,
        trainer.clone(),
        Arc::new(EnvRegistry::noop()),
        &mut |_| {},
    ) {
        Ok(_) => panic!("seed 12 should abort the run"),
        Err(err) => err,
    };
    assert!(matches!(err, RunError::Replicate { seed: 12, .. }), "{}", err);

    let rows = summary_rows(&summary);
    assert_eq!(rows.len(), 3, "header plus seeds 10 and 11");
    // the last seed is never started
    let seen = trainer.seen.lock().expect("seen");
    assert!(seen.iter().all(|(seed, _, _)| *seed != 13));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn parallel_failure_aborts_and_keeps_only_reported_rows() {
    let root = temp_root("parallel_failing");
    let template = write_template(&root, "");
    let plan = prepare_plan(&options(template, 6, 3, Some(0))).expect("plan");
    assert_eq!(plan.workers, 3);
    let summary = plan.base.summary_path();

    let trainer = Arc::new(FakeTrainer {
        slow_seed: Some((2, 200)),
        failing_seed: Some(2),
        ..FakeTrainer::default()
    });
    let mut reported = Vec::new();
    let result = launch_with_trainer(
        plan,
        trainer.clone(),
        Arc::new(EnvRegistry::noop()),
        &mut |event| {
            if let LaunchEvent::Progress(c) = event {
                reported.push(c.seed.to_string());
            }
        },
    );
    let err = match result {
        Ok(_) => panic!("seed 2 should abort the parallel run"),
        Err(err) => err,
    };
    assert!(matches!(err, RunError::Replicate { seed: 2, .. }), "{}", err);

    let rows = summary_rows(&summary);
    let written: Vec<String> = rows.iter().skip(1).map(|r| r[0].clone()).collect();
    assert_eq!(written, reported, "rows match completions reported before the failure");
    assert!(!written.iter().any(|s| s == "2"));
    // the fast early seeds finish long before seed 2 gives up
    assert!(written.iter().any(|s| s == "0") && written.iter().any(|s| s == "1"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn control_task_registers_environment_once_for_parallel_batches() {
    let root = temp_root("control");
    let template = write_template(
        &root,
        "task:\n  task_type: control\n  env: Pendulum-v0\ntraining:\n  n_cores_batch: -1\n",
    );
    let plan = prepare_plan(&options(template, 3, 1, Some(0))).expect("plan");

    let calls = Arc::new(Mutex::new(Vec::new()));
    let hook_calls = calls.clone();
    let registry = Arc::new(EnvRegistry::new(move |env| {
        hook_calls.lock().expect("calls").push(env.to_string());
        Ok(())
    }));
    launch_with_trainer(
        plan,
        Arc::new(FakeTrainer::default()),
        registry.clone(),
        &mut |_| {},
    )
    .expect("launch");

    assert!(registry.is_registered("Pendulum-v0"));
    assert_eq!(*calls.lock().expect("calls"), vec!["Pendulum-v0".to_string()]);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn second_invocation_appends_under_the_same_header() {
    let root = temp_root("rerun");
    let template = write_template(&root, "");
    for seed in [0, 50] {
        let plan = prepare_plan(&options(template.clone(), 2, 1, Some(seed))).expect("plan");
        launch_with_trainer(
            plan,
            Arc::new(FakeTrainer::default()),
            Arc::new(EnvRegistry::noop()),
            &mut |_| {},
        )
        .expect("launch");
    }
    let rows = summary_rows(&root.join("log").join("trial").join("summary.csv"));
    assert_eq!(rows.len(), 5);
    assert_eq!(rows.iter().filter(|r| r[0] == "seed").count(), 1);
    let _ = fs::remove_dir_all(root);
}
