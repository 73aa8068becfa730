//! Engine error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while declaring, submitting or executing jobs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid job {job}: {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("the job {0} has already been defined; job names must be unique")]
    DuplicateJob(String),

    #[error("the run {0} is already submitted (lock file present)")]
    AlreadySubmitted(String),

    #[error("the run {0} has already produced its output and cannot be resubmitted")]
    AlreadyFinished(String),

    #[error("merge layer {0} has already been submitted")]
    MergeAlreadySubmitted(String),

    #[error("nothing to merge for {0}")]
    NothingToMerge(String),

    #[error("nothing has been scheduled")]
    NothingScheduled,

    #[error("script not found: {0}")]
    MissingScript(PathBuf),

    #[error("no partition accepts a run time of {0}")]
    NoPartition(String),

    #[error("could not establish dependency of {job} on {dependency}")]
    UnresolvedDependency { job: String, dependency: String },

    #[error("failed to launch `{command}`: {source}")]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("no valid grid credentials: {0}")]
    CredentialsExpired(String),

    #[error("unexpected scheduler output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("config error: {0}")]
    Config(#[from] batchgrid_core::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<batchgrid_core::graph::DuplicateJob> for EngineError {
    fn from(err: batchgrid_core::graph::DuplicateJob) -> Self {
        EngineError::DuplicateJob(err.0)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
