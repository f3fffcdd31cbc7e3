use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// Fails before any replicate is launched.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("replicate with seed {seed} failed: {message}")]
    Replicate { seed: i64, message: String },

    #[error("worker panicked while running replicate {replicate}: {message}")]
    WorkerPanic { replicate: usize, message: String },

    #[error("summary sink {} failed: {source}", path.display())]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {message}", path.display())]
    Artifact { path: PathBuf, message: String },

    #[error("post-run analysis failed: {0}")]
    Analysis(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl RunError {
    pub fn config(message: impl Into<String>) -> Self {
        RunError::Config(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunError::Config(_) => "config_error",
            RunError::Replicate { .. } => "replicate_failed",
            RunError::WorkerPanic { .. } => "worker_panic",
            RunError::Sink { .. } => "sink_io_error",
            RunError::Artifact { .. } => "artifact_write_failed",
            RunError::Analysis(_) => "analysis_failed",
            RunError::Io(_) | RunError::Json(_) | RunError::Yaml(_) => "io_error",
        }
    }
}

pub type Result<T, E = RunError> = std::result::Result<T, E>;
