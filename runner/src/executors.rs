pub mod local;

use crate::{catalog::JobDescriptor, config::WorkerConfig};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to prepare output directory {0:?}")]
    OutputDir(PathBuf, #[source] std::io::Error),
    #[error("Failed to spawn {0:?}")]
    Spawn(PathBuf, #[source] std::io::Error),
    #[error("Failed to wait for a child proccess")]
    Wait(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
/// container for information observed while running a job
/// the exit status is reported for logging only, it is never interpreted
pub struct RunOutput {
    pub runtime: Duration,
    pub status: Option<i32>,
}

/// Runs a single job to completion on the current thread
pub trait JobExecutor: Send + Sync {
    fn execute(
        &self,
        descriptor: &JobDescriptor,
        output_dir: &Path,
    ) -> Result<RunOutput, ExecutorError>;
}

#[derive(Clone, Debug)]
pub enum Executors {
    Local(local::LocalExecutor),
}

impl Executors {
    pub fn load(config: &WorkerConfig) -> Self {
        Self::Local(local::LocalExecutor::load(config))
    }
}

impl JobExecutor for Executors {
    fn execute(
        &self,
        descriptor: &JobDescriptor,
        output_dir: &Path,
    ) -> Result<RunOutput, ExecutorError> {
        match self {
            Self::Local(executor) => executor.execute(descriptor, output_dir),
        }
    }
}
