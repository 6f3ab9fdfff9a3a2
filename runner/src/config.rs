use crate::{
    catalog::{
        assign_idents, build_jobs, CatalogError, IdentGenerator, JobDescriptor, JobIdent,
        RandomIdents, SequentialIdents, DEFAULT_IDENT_SPACE,
    },
    collector::Collector,
};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Error},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to parse config")]
    Parse(#[from] serde_yaml::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to access file")]
    Io(#[from] Error),
    #[error("Failed to build job catalog")]
    Catalog(#[from] CatalogError),
    #[error("Failed to initialize logging")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
    #[error("Input {0:?} was found under more than one root")]
    DuplicateReference(String),
    #[error("Preflight checks failed")]
    Preflight,
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigErrors> {
    if !path.is_file() {
        return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
    }

    Ok(serde_yaml::from_reader(BufReader::new(File::open(path)?))?)
}

/// A set of input files, e.g. all instances, found by walking `paths` and keeping the
/// files whose name matches `glob`
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct InputSet {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    pub path: Option<PathBuf>,
    pub glob: Glob,
    #[serde(default)]
    pub recursive: bool,
}

impl InputSet {
    /// all configured roots, `path` is treated as a member of `paths`
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots = self.paths.clone();
        if let Some(path) = &self.path {
            if !roots.contains(path) {
                roots.push(path.clone());
            }
        }

        roots
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct SeedRange {
    #[serde(default)]
    pub first: u64,
    pub count: u64,
}

impl SeedRange {
    pub fn seeds(&self) -> std::ops::Range<u64> {
        self.first..self.first.saturating_add(self.count)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentStrategy {
    #[default]
    Random,
    Sequential,
}

/// How input files are referenced by the generated jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum References {
    /// paths relative to the input root, resolved by every worker against its own
    /// instance directory
    RelativePaths,
    /// absolute paths as found by the coordinator
    AbsolutePaths,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub instances: InputSet,
    pub settings: InputSet,
    pub configs: InputSet,
    pub seeds: SeedRange,
    // initial timeout per job, raised whenever a job is observed to take longer
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_monitor_period")]
    pub monitor_period_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_shuffle_seed")]
    pub shuffle_seed: u64,
    #[serde(default)]
    pub ident_strategy: IdentStrategy,
    #[serde(default = "default_ident_space")]
    pub ident_space: u64,
    pub job_list: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl CoordinatorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        load_yaml(path)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_secs(self.monitor_period_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn ident_generator(&self) -> Box<dyn IdentGenerator> {
        match self.ident_strategy {
            IdentStrategy::Random => {
                Box::new(RandomIdents::new(self.shuffle_seed, self.ident_space))
            }
            IdentStrategy::Sequential => Box::new(SequentialIdents::default()),
        }
    }

    /// Discover all inputs and build the shuffled job list
    pub fn collect_jobs(&self, references: References) -> Result<Vec<JobDescriptor>, ConfigErrors> {
        let resolve = |set: &InputSet| -> Result<Vec<String>, ConfigErrors> {
            let collector = Collector::load(set)?;

            match references {
                References::RelativePaths => {
                    let duplicates = collector.duplicate_references();
                    if let Some(duplicate) = duplicates.into_iter().next() {
                        return Err(ConfigErrors::DuplicateReference(duplicate));
                    }

                    Ok(collector.relative_paths())
                }
                References::AbsolutePaths => collector.absolute_paths(),
            }
        };

        let instances = resolve(&self.instances)?;
        let settings = resolve(&self.settings)?;
        let configs = resolve(&self.configs)?;

        Ok(build_jobs(
            &instances,
            &settings,
            &configs,
            self.seeds.seeds(),
            self.shuffle_seed,
        ))
    }

    /// Discover all inputs and assign an ident to every job
    pub fn catalog(&self) -> Result<Vec<(JobIdent, JobDescriptor)>, ConfigErrors> {
        let jobs = self.collect_jobs(References::RelativePaths)?;

        Ok(assign_idents(jobs, self.ident_generator().as_mut())?)
    }

    /// Returns true if any problem was found, every problem is logged
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        for (name, set) in [
            ("instances", &self.instances),
            ("settings", &self.settings),
            ("configs", &self.configs),
        ] {
            let roots = set.roots();

            if roots.is_empty() {
                error!("{name} contains neither 'path' nor 'paths', no inputs can be found");
                contains_error = true;
            }

            let mut roots_exist = true;
            for root in roots {
                if !root.is_dir() {
                    error!("{name} path {} is not a directory", root.to_string_lossy());
                    contains_error = true;
                    roots_exist = false;
                }
            }

            // workers only see the path below the root, it has to be unique within a set
            if roots_exist {
                match Collector::load(set) {
                    Ok(collector) => {
                        for duplicate in collector.duplicate_references() {
                            error!("{name} contains {duplicate} under more than one root");
                            contains_error = true;
                        }
                    }
                    Err(e) => {
                        error!("Failed to search {name}: {e}");
                        contains_error = true;
                    }
                }
            }
        }

        if self.seeds.count == 0 {
            error!("seeds.count cannot be 0, no jobs would be generated");
            contains_error = true;
        }

        if self.job_timeout_secs == 0 {
            error!("job_timeout_secs cannot be 0, every job would time out immediately");
            contains_error = true;
        }

        if self.monitor_period_secs == 0 {
            error!("monitor_period_secs cannot be 0");
            contains_error = true;
        }

        if self.read_timeout_secs == 0 {
            warn!("read_timeout_secs is 0, falling back to blocking reads");
        }

        if self.ident_strategy == IdentStrategy::Random && self.ident_space < 2 {
            error!("ident_space must be at least 2 for random idents");
            contains_error = true;
        }

        contains_error
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    // coordinator address as host:port
    pub server: String,
    // simulation program, called with instance setting config output_dir seed
    pub exec: PathBuf,
    // optional runtime placed in front of exec
    pub launcher: Option<PathBuf>,
    pub instance_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_sleep")]
    pub sleep_secs: u64,
    #[serde(default = "default_pause")]
    pub pause_secs: u64,
    #[serde(default = "default_stagger")]
    pub stagger_secs: u64,
    pub log_file: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        load_yaml(path)
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    /// Returns true if any problem was found, every problem is logged
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.threads == 0 {
            error!("threads cannot be 0, no worker would be started");
            contains_error = true;
        }

        if self.server.is_empty() {
            error!("server must be set to the coordinator address");
            contains_error = true;
        }

        if !self.instance_dir.is_dir() {
            error!(
                "instance_dir {} is not a directory",
                self.instance_dir.to_string_lossy()
            );
            contains_error = true;
        }

        // with a launcher, exec is an argument of the launcher and needs not be executable
        if self.launcher.is_none() {
            match check_executable(&self.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "exec {} is not executable, this might cause problems",
                        self.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if exec ({}) is an executable: {e}",
                        self.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        } else if !self.exec.is_file() {
            error!(
                "Failed to find exec. Either not a file or not found at {}",
                self.exec.to_string_lossy()
            );
            contains_error = true;
        }

        contains_error
    }
}

fn default_listen() -> String {
    "0.0.0.0:31353".to_owned()
}

fn default_job_timeout() -> u64 {
    60 * 60
}

fn default_monitor_period() -> u64 {
    60
}

fn default_read_timeout() -> u64 {
    30
}

fn default_shuffle_seed() -> u64 {
    1
}

fn default_ident_space() -> u64 {
    DEFAULT_IDENT_SPACE
}

fn default_threads() -> usize {
    1
}

fn default_sleep() -> u64 {
    120
}

fn default_pause() -> u64 {
    5
}

fn default_stagger() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};

    const COORDINATOR: &str = r#"
instances:
  path: inputs
  glob: "*.{xinst,xlayo}"
settings:
  paths: [inputs]
  glob: "*.xsett"
configs:
  paths: [inputs]
  glob: "*.xconf"
seeds:
  first: 1
  count: 3
"#;

    #[test]
    fn coordinator_defaults() {
        let config: CoordinatorConfig = serde_yaml::from_str(COORDINATOR).unwrap();

        assert_eq!(config.listen, "0.0.0.0:31353");
        assert_eq!(config.job_timeout(), Duration::from_secs(3600));
        assert_eq!(config.monitor_period(), Duration::from_secs(60));
        assert_eq!(config.ident_strategy, IdentStrategy::Random);
        assert_eq!(config.seeds.seeds(), 1..4);
        assert_eq!(config.instances.roots(), vec![PathBuf::from("inputs")]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = format!("{COORDINATOR}timeout_hours: 2\n");
        assert!(serde_yaml::from_str::<CoordinatorConfig>(&raw).is_err());
    }

    #[test]
    fn catalog_from_discovered_inputs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.xinst", "b.xlayo", "s.xsett", "c.xconf", "notes.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let config = config_over(vec![dir.path().to_path_buf()], false);
        assert!(!config.preflight_checks());

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 6);
        assert!(catalog
            .iter()
            .all(|(_, job)| job.setting == "s.xsett" && job.config == "c.xconf"));
        assert!(catalog
            .iter()
            .any(|(_, job)| job.instance == "b.xlayo"));

        let absolute = config.collect_jobs(References::AbsolutePaths).unwrap();
        assert!(absolute
            .iter()
            .all(|job| Path::new(&job.instance).is_absolute()));
    }

    fn config_over(roots: Vec<PathBuf>, recursive: bool) -> CoordinatorConfig {
        let mut config: CoordinatorConfig = serde_yaml::from_str(COORDINATOR).unwrap();
        for set in [
            &mut config.instances,
            &mut config.settings,
            &mut config.configs,
        ] {
            set.path = None;
            set.paths = roots.clone();
            set.recursive = recursive;
        }

        config
    }

    #[test]
    fn nested_inputs_are_referenced_below_their_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("warehouses")).unwrap();
        for name in ["warehouses/a.xinst", "s.xsett", "c.xconf"] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let config = config_over(vec![dir.path().to_path_buf()], true);
        assert!(!config.preflight_checks());

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 3);
        for (_, job) in catalog.iter() {
            assert_eq!(job.instance, "warehouses/a.xinst");
            // a worker with the same instance directory finds the file
            assert!(dir.path().join(&job.instance).is_file());
        }
    }

    #[test]
    fn same_name_in_two_roots_is_rejected() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for dir in [&first, &second] {
            for name in ["x.xinst", "s.xsett", "c.xconf"] {
                fs::write(dir.path().join(name), "").unwrap();
            }
        }

        let config = config_over(
            vec![first.path().to_path_buf(), second.path().to_path_buf()],
            false,
        );

        assert!(config.preflight_checks());
        assert!(matches!(
            config.catalog(),
            Err(ConfigErrors::DuplicateReference(reference)) if reference == "x.xinst"
        ));

        // the flat job list still names every file
        let absolute = config.collect_jobs(References::AbsolutePaths).unwrap();
        let instances = absolute
            .iter()
            .map(|job| job.instance.as_str())
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(instances.len(), 2);
    }

    #[test]
    fn worker_preflight_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let exec = dir.path().join("simulate");
        fs::write(&exec, "#!/bin/sh\n").unwrap();

        let mut config: WorkerConfig = serde_yaml::from_str(&format!(
            "server: 127.0.0.1:31353\nexec: {}\ninstance_dir: {}\noutput_dir: out\n",
            exec.display(),
            dir.path().display()
        ))
        .unwrap();
        assert_eq!(config.threads, 1);
        assert_eq!(config.sleep(), Duration::from_secs(120));

        // not executable yet
        assert!(config.preflight_checks());

        fs::set_permissions(&exec, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(!config.preflight_checks());

        config.threads = 0;
        assert!(config.preflight_checks());
    }
}
