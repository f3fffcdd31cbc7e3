use crate::config::{Config, TaskFamily};
use crate::error::{Result, RunError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Wall-clock seconds spent in the training call.
pub const TIME_ELAPSED_KEY: &str = "t";
/// Bulky payload stripped before a result leaves the executor.
pub const PROGRAM_KEY: &str = "program";

/// Metric name to value, in the order the training routine produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRecord {
    fields: Map<String, Value>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.get(TIME_ELAPSED_KEY)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }
}

/// The training routine. Implementations must be callable from any worker.
pub trait Trainer: Send + Sync {
    fn train(&self, config: &Config) -> anyhow::Result<ResultRecord>;
}

type SetupFn = dyn Fn(&str) -> anyhow::Result<()> + Send + Sync;

/// Process-local set of environments that have already been prepared.
pub struct EnvRegistry {
    registered: Mutex<BTreeSet<String>>,
    setup: Box<SetupFn>,
}

impl EnvRegistry {
    pub fn new<F>(setup: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            registered: Mutex::new(BTreeSet::new()),
            setup: Box::new(setup),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| Ok(()))
    }

    /// Runs the setup hook for `env_name` at most once. A failed setup leaves
    /// the name unregistered.
    pub fn ensure_registered(&self, env_name: &str) -> anyhow::Result<()> {
        let mut registered = self
            .registered
            .lock()
            .map_err(|_| anyhow::anyhow!("environment registry lock poisoned"))?;
        if registered.contains(env_name) {
            return Ok(());
        }
        tracing::info!(env = env_name, "registering environment");
        (self.setup)(env_name)?;
        registered.insert(env_name.to_string());
        Ok(())
    }

    pub fn is_registered(&self, env_name: &str) -> bool {
        self.registered
            .lock()
            .map(|set| set.contains(env_name))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicateOutput {
    pub seed: i64,
    pub record: ResultRecord,
    pub sink_path: PathBuf,
}

/// Runs exactly one replicate.
#[derive(Clone)]
pub struct ReplicateExecutor {
    trainer: Arc<dyn Trainer>,
    registry: Arc<EnvRegistry>,
}

impl ReplicateExecutor {
    pub fn new(trainer: Arc<dyn Trainer>, registry: Arc<EnvRegistry>) -> Self {
        Self { trainer, registry }
    }

    pub fn execute(&self, config: Config) -> Result<ReplicateOutput> {
        let seed = config.seed().unwrap_or_default();
        if config.task_family()? == TaskFamily::Control && config.batch_parallelism_enabled() {
            let env = config
                .env_name()
                .ok_or_else(|| RunError::config("control task is missing task.env"))?;
            self.registry
                .ensure_registered(env)
                .map_err(|e| RunError::Replicate {
                    seed,
                    message: format!("environment setup for {} failed: {:#}", env, e),
                })?;
        }

        tracing::info!(seed, "starting replicate");
        let started = Instant::now();
        let mut record = self
            .trainer
            .train(&config)
            .map_err(|e| RunError::Replicate {
                seed,
                message: format!("{:#}", e),
            })?;
        let elapsed = started.elapsed().as_secs_f64();
        record.insert(TIME_ELAPSED_KEY, json!(elapsed));
        record.remove(PROGRAM_KEY);

        Ok(ReplicateOutput {
            seed,
            record,
            sink_path: config.summary_path(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTrainer;

    impl Trainer for EchoTrainer {
        fn train(&self, config: &Config) -> anyhow::Result<ResultRecord> {
            Ok(ResultRecord::new()
                .with("seed", json!(config.seed()))
                .with("r_best", json!(0.75))
                .with(PROGRAM_KEY, json!({"tokens": ["add", "x1", "x1"]})))
        }
    }

    struct FailingTrainer;

    impl Trainer for FailingTrainer {
        fn train(&self, _config: &Config) -> anyhow::Result<ResultRecord> {
            Err(anyhow::anyhow!("reward diverged"))
        }
    }

    fn config(task_type: &str, n_cores_batch: i64) -> Config {
        Config::from_value(json!({
            "experiment": {"logdir": "log", "exp_name": "exp", "seed": 11},
            "task": {"task_type": task_type, "env": "Pendulum-v0", "dataset": "Nguyen-1"},
            "training": {"n_cores_batch": n_cores_batch, "verbose": false}
        }))
    }

    fn counting_registry() -> (Arc<EnvRegistry>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = EnvRegistry::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (Arc::new(registry), calls)
    }

    #[test]
    fn execute_strips_program_and_records_elapsed_time() {
        let executor = ReplicateExecutor::new(Arc::new(EchoTrainer), Arc::new(EnvRegistry::noop()));
        let out = executor.execute(config("regression", 1)).expect("replicate");
        assert_eq!(out.seed, 11);
        assert!(!out.record.contains(PROGRAM_KEY));
        assert!(out.record.contains(TIME_ELAPSED_KEY));
        assert!(out.record.elapsed_secs() >= 0.0);
        assert_eq!(out.record.field_names(), vec!["seed", "r_best", "t"]);
        assert_eq!(out.sink_path, PathBuf::from("log").join("exp").join("summary.csv"));
    }

    #[test]
    fn control_with_batch_parallelism_registers_env_once() {
        let (registry, calls) = counting_registry();
        let executor = ReplicateExecutor::new(Arc::new(EchoTrainer), registry.clone());
        executor.execute(config("control", 4)).expect("first");
        executor.execute(config("control", 4)).expect("second");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_registered("Pendulum-v0"));
    }

    #[test]
    fn registration_skipped_without_batch_parallelism() {
        let (registry, calls) = counting_registry();
        let executor = ReplicateExecutor::new(Arc::new(EchoTrainer), registry.clone());
        executor.execute(config("control", 1)).expect("serial batch");
        executor.execute(config("regression", 4)).expect("regression");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!registry.is_registered("Pendulum-v0"));
    }

    #[test]
    fn failed_setup_is_retried_on_next_call() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let registry = EnvRegistry::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow::anyhow!("simulator not installed"))
            } else {
                Ok(())
            }
        });
        assert!(registry.ensure_registered("CartPole-v1").is_err());
        assert!(!registry.is_registered("CartPole-v1"));
        registry.ensure_registered("CartPole-v1").expect("second attempt");
        assert!(registry.is_registered("CartPole-v1"));
    }

    #[test]
    fn trainer_failure_carries_seed() {
        let executor =
            ReplicateExecutor::new(Arc::new(FailingTrainer), Arc::new(EnvRegistry::noop()));
        match executor.execute(config("regression", 1)) {
            Err(RunError::Replicate { seed, message }) => {
                assert_eq!(seed, 11);
                assert!(message.contains("reward diverged"), "{}", message);
            }
            other => panic!("expected replicate failure, got {:?}", other.map(|o| o.seed)),
        }
    }
}
