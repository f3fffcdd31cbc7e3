//! Fixed-size worker pool that hands results back in completion order.

use crossbeam_channel::{bounded, unbounded, Receiver};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A job that panicked instead of returning.
#[derive(Debug, Clone)]
pub struct WorkerPanic {
    pub message: String,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `work` over `jobs` on at most `size` threads. The iterator yields
    /// `(submission_index, result)` as each job finishes.
    pub fn imap_unordered<T, R, F>(&self, jobs: Vec<T>, work: F) -> Completions<T, R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let (job_tx, job_rx) = unbounded::<(usize, T)>();
        for job in jobs.into_iter().enumerate() {
            let _ = job_tx.send(job);
        }
        // no further jobs: workers exit once the queue is empty
        drop(job_tx);

        let work = Arc::new(work);
        let (result_tx, result_rx) = bounded(self.size);

        let handles = (0..self.size)
            .map(|worker_id| {
                let jobs = job_rx.clone();
                let work = work.clone();
                let results = result_tx.clone();
                thread::Builder::new()
                    .name(format!("dso-worker-{}", worker_id))
                    .spawn(move || {
                        for (index, job) in jobs.iter() {
                            let outcome = catch_unwind(AssertUnwindSafe(|| (work.as_ref())(job)))
                                .map_err(|p| WorkerPanic {
                                    message: panic_message(p),
                                });
                            if results.send((index, outcome)).is_err() {
                                break;
                            }
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn pool worker");
                    None
                }
            })
            .collect::<Vec<_>>();
        drop(result_tx);

        Completions {
            jobs: job_rx,
            results: Some(result_rx),
            handles,
        }
    }
}

/// Arrival-order results of an [`WorkerPool::imap_unordered`] call. Dropping
/// it stops dispatch and joins every worker.
pub struct Completions<T, R> {
    jobs: Receiver<(usize, T)>,
    results: Option<Receiver<(usize, Result<R, WorkerPanic>)>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T, R> Completions<T, R> {
    /// Discards every job not yet picked up. Jobs already running still
    /// finish. Returns how many were discarded.
    pub fn stop(&self) -> usize {
        self.jobs.try_iter().count()
    }
}

impl<T, R> Iterator for Completions<T, R> {
    type Item = (usize, Result<R, WorkerPanic>);

    fn next(&mut self) -> Option<Self::Item> {
        self.results.as_ref().and_then(|rx| rx.recv().ok())
    }
}

impl<T, R> Drop for Completions<T, R> {
    fn drop(&mut self) {
        self.stop();
        // disconnect first so workers blocked on a full channel wake up
        self.results.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
