use super::{ExecutorError, JobExecutor, RunOutput};
use crate::{catalog::JobDescriptor, config::WorkerConfig};
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Instant,
};
use tracing::{debug, instrument};

/// Executor spawning the simulation program as a child process
///
/// The child is called positionally with `instance setting config output_dir seed`,
/// optionally behind a launcher such as a VM runtime. No timeout is enforced here,
/// stalled jobs are reclaimed by the coordinator.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    exec: PathBuf,
    launcher: Option<PathBuf>,
    instance_dir: PathBuf,
}

impl LocalExecutor {
    pub fn new(exec: PathBuf, launcher: Option<PathBuf>, instance_dir: PathBuf) -> Self {
        Self {
            exec,
            launcher,
            instance_dir,
        }
    }

    pub fn load(config: &WorkerConfig) -> Self {
        Self::new(
            config.exec.clone(),
            config.launcher.clone(),
            config.instance_dir.clone(),
        )
    }

    /// build the call for a job, references are resolved against the instance directory
    pub fn command(&self, descriptor: &JobDescriptor, output_dir: &Path) -> Command {
        let mut command = match &self.launcher {
            Some(launcher) => {
                let mut command = Command::new(launcher);
                command.arg(&self.exec);
                command
            }
            None => Command::new(&self.exec),
        };

        command
            .arg(self.instance_dir.join(&descriptor.instance))
            .arg(self.instance_dir.join(&descriptor.setting))
            .arg(self.instance_dir.join(&descriptor.config))
            .arg(output_dir)
            .arg(descriptor.seed.to_string())
            .stdin(Stdio::null());

        command
    }
}

impl JobExecutor for LocalExecutor {
    #[instrument(skip(self), level = "debug")]
    fn execute(
        &self,
        descriptor: &JobDescriptor,
        output_dir: &Path,
    ) -> Result<RunOutput, ExecutorError> {
        fs::create_dir_all(output_dir)
            .map_err(|error| ExecutorError::OutputDir(output_dir.to_path_buf(), error))?;

        let mut command = self.command(descriptor, output_dir);
        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|error| ExecutorError::Spawn(self.exec.clone(), error))?;

        debug!("Started job: {command:?}");
        let status = child.wait()?;
        let runtime = start.elapsed();

        debug!(
            "Finished in {} ms | status: {}",
            runtime.as_millis(),
            status
        );

        Ok(RunOutput {
            runtime,
            status: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            instance: "warehouse.xinst".to_owned(),
            setting: "default.xsett".to_owned(),
            config: "greedy.xconf".to_owned(),
            seed: 42,
        }
    }

    #[test]
    fn passes_resolved_paths_positionally() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("record.sh");
        fs::write(&script, "echo \"$@\" > \"$4/args.txt\"\nexit 3\n").unwrap();

        let executor = LocalExecutor::new(
            script,
            Some(PathBuf::from("sh")),
            PathBuf::from("/data/instances"),
        );
        let output_dir = dir.path().join("out").join("worker0");
        let output = executor.execute(&descriptor(), &output_dir).unwrap();

        // the exit status is reported, but a failing job is still a finished job
        assert_eq!(output.status, Some(3));

        let recorded = fs::read_to_string(output_dir.join("args.txt")).unwrap();
        assert_eq!(
            recorded.trim(),
            format!(
                "/data/instances/warehouse.xinst /data/instances/default.xsett /data/instances/greedy.xconf {} 42",
                output_dir.display()
            )
        );
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(
            dir.path().join("does-not-exist"),
            None,
            dir.path().to_path_buf(),
        );

        assert!(matches!(
            executor.execute(&descriptor(), &dir.path().join("out")),
            Err(ExecutorError::Spawn(..))
        ));
    }
}
