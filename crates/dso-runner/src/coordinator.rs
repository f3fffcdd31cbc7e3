use crate::config::Config;
use crate::error::{Result, RunError};
use crate::executor::{ReplicateExecutor, ReplicateOutput};
use crate::pool::WorkerPool;
use crate::sink::SummarySink;
use serde::Serialize;
use std::path::PathBuf;

/// One aggregated replicate, reported in completion order.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    /// 1-based position in completion order.
    pub index: usize,
    pub total: usize,
    /// 0-based position in submission order.
    pub replicate: usize,
    pub seed: i64,
    pub elapsed_secs: f64,
    pub sink_path: PathBuf,
}

impl Completion {
    pub fn progress_line(&self) -> String {
        format!(
            "Completed {} of {} in {:.0} s",
            self.index, self.total, self.elapsed_secs
        )
    }
}

fn aggregate(
    output: ReplicateOutput,
    replicate: usize,
    done: &mut Vec<Completion>,
    total: usize,
    sink: &mut SummarySink,
) -> Result<Completion> {
    sink.append(&output.record, &output.sink_path)?;
    let completion = Completion {
        index: done.len() + 1,
        total,
        replicate,
        seed: output.seed,
        elapsed_secs: output.record.elapsed_secs(),
        sink_path: output.sink_path,
    };
    tracing::info!(
        index = completion.index,
        total,
        seed = completion.seed,
        elapsed_secs = completion.elapsed_secs,
        "replicate completed"
    );
    done.push(completion.clone());
    Ok(completion)
}

/// Runs every configuration once and appends each result to its sink as soon
/// as it arrives. With one worker replicates run in order on this thread;
/// otherwise they run on a pool and are aggregated in completion order. The
/// first failure stops dispatch and is returned.
pub fn run_replicates<P>(
    configs: Vec<Config>,
    workers: usize,
    executor: &ReplicateExecutor,
    sink: &mut SummarySink,
    mut on_progress: P,
) -> Result<Vec<Completion>>
where
    P: FnMut(&Completion),
{
    let total = configs.len();
    let mut done = Vec::with_capacity(total);

    if workers <= 1 {
        for (replicate, config) in configs.into_iter().enumerate() {
            let output = executor.execute(config)?;
            let completion = aggregate(output, replicate, &mut done, total, sink)?;
            on_progress(&completion);
        }
        return Ok(done);
    }

    let pool = WorkerPool::new(workers.min(total.max(1)));
    tracing::info!(workers = pool.size(), total, "dispatching replicates");
    let job_executor = executor.clone();
    let mut completions = pool.imap_unordered(configs, move |config| job_executor.execute(config));

    while let Some((replicate, outcome)) = completions.next() {
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                let skipped = completions.stop();
                tracing::error!(replicate, skipped, error = %err, "replicate failed; aborting run");
                return Err(err);
            }
            Err(panic) => {
                let skipped = completions.stop();
                tracing::error!(replicate, skipped, message = %panic.message, "worker panicked; aborting run");
                return Err(RunError::WorkerPanic {
                    replicate,
                    message: panic.message,
                });
            }
        };
        let completion = aggregate(output, replicate, &mut done, total, sink)?;
        on_progress(&completion);
    }

    if done.len() != total {
        return Err(RunError::WorkerPanic {
            replicate: done.len(),
            message: format!(
                "worker pool finished after {} of {} replicates",
                done.len(),
                total
            ),
        });
    }
    Ok(done)
}
