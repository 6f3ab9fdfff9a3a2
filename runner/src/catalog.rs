use itertools::{iproduct, Itertools};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{self, Display},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, info};

/// delimiter of the flat job list consumed by batch submission helpers
pub const JOB_LIST_DELIMITER: char = ';';

/// default size of the job ident space, idents are drawn from `0..=DEFAULT_IDENT_SPACE`
pub const DEFAULT_IDENT_SPACE: u64 = 1_000_000;

/// request idents are minted on every dispatch and need more room than job idents
pub const REQUEST_IDENT_SPACE: u64 = u32::MAX as u64;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Ident space of {space} is too small for {existing} existing idents")]
    IdentSpaceExhausted { existing: usize, space: u64 },
    #[error("Field {0:?} contains the job list delimiter or a line break")]
    Delimiter(String),
    #[error("Failed to write job list")]
    Io(#[from] std::io::Error),
}

/// Identifies one job over its whole lifecycle, independent of how often it is dispatched
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct JobIdent(pub u64);

/// Identifies a single dispatch attempt of a job
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RequestIdent(pub u64);

impl Display for JobIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for RequestIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work: an instance simulated under a setting and config with a fixed seed
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    pub instance: String,
    pub setting: String,
    pub config: String,
    pub seed: u64,
}

impl Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {} | seed {}",
            self.instance, self.setting, self.config, self.seed
        )
    }
}

/// Build the cross product instance x setting x config x seed and shuffle it with
/// `shuffle_seed`, the same inputs and seed always yield the same order
pub fn build_jobs<S: AsRef<str>>(
    instances: &[S],
    settings: &[S],
    configs: &[S],
    seeds: impl IntoIterator<Item = u64>,
    shuffle_seed: u64,
) -> Vec<JobDescriptor> {
    let seeds = seeds.into_iter().collect_vec();
    let mut jobs = iproduct!(instances, settings, configs, seeds.iter())
        .map(|(instance, setting, config, seed)| JobDescriptor {
            instance: AsRef::<str>::as_ref(instance).to_owned(),
            setting: AsRef::<str>::as_ref(setting).to_owned(),
            config: AsRef::<str>::as_ref(config).to_owned(),
            seed: *seed,
        })
        .collect_vec();

    jobs.shuffle(&mut StdRng::seed_from_u64(shuffle_seed));

    info!(
        "Found {} jobs for {} instances {} settings {} configs and {} seeds",
        jobs.len(),
        instances.len(),
        settings.len(),
        configs.len(),
        seeds.len()
    );

    jobs
}

/// Strategy for minting unique integer idents
pub trait IdentGenerator: Send + fmt::Debug {
    /// return a value not contained in `existing`
    fn generate(&mut self, existing: &HashSet<u64>) -> Result<u64, CatalogError>;
}

/// Rejection sampling from `0..=space`
///
/// Sampling only terminates quickly while the number of taken idents stays far below the
/// size of the space, so generation is refused once half of the space is in use.
#[derive(Debug, Clone)]
pub struct RandomIdents {
    rng: StdRng,
    space: u64,
}

impl RandomIdents {
    pub fn new(seed: u64, space: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            space,
        }
    }
}

impl IdentGenerator for RandomIdents {
    fn generate(&mut self, existing: &HashSet<u64>) -> Result<u64, CatalogError> {
        if existing.len() as u64 >= self.space / 2 {
            return Err(CatalogError::IdentSpaceExhausted {
                existing: existing.len(),
                space: self.space,
            });
        }

        loop {
            let ident = self.rng.gen_range(0..=self.space);

            if !existing.contains(&ident) {
                return Ok(ident);
            }
        }
    }
}

/// Monotonic counter, skipping values that are already taken
#[derive(Debug, Clone, Default)]
pub struct SequentialIdents {
    next: u64,
}

impl IdentGenerator for SequentialIdents {
    fn generate(&mut self, existing: &HashSet<u64>) -> Result<u64, CatalogError> {
        while existing.contains(&self.next) {
            self.next += 1;
        }

        let ident = self.next;
        self.next += 1;

        Ok(ident)
    }
}

/// Assign a unique `JobIdent` to every job
pub fn assign_idents(
    jobs: Vec<JobDescriptor>,
    generator: &mut dyn IdentGenerator,
) -> Result<Vec<(JobIdent, JobDescriptor)>, CatalogError> {
    let mut taken = HashSet::with_capacity(jobs.len());

    jobs.into_iter()
        .map(|job| {
            let ident = generator.generate(&taken)?;
            taken.insert(ident);

            Ok((JobIdent(ident), job))
        })
        .collect()
}

fn check_field(field: &str) -> Result<&str, CatalogError> {
    if field.contains(JOB_LIST_DELIMITER) || field.contains('\n') || field.contains('\r') {
        Err(CatalogError::Delimiter(field.to_owned()))
    } else {
        Ok(field)
    }
}

/// Write the flat job list, one `<jobID>;<instance>;<setting>;<config>;<seed>` per line
/// with job IDs counting up from 0. Returns the number of written jobs.
pub fn write_job_list(path: &Path, jobs: &[JobDescriptor]) -> Result<usize, CatalogError> {
    // validate everything first so a rejected list never leaves a partial file behind
    for job in jobs {
        check_field(&job.instance)?;
        check_field(&job.setting)?;
        check_field(&job.config)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);

    for (id, job) in jobs.iter().enumerate() {
        writeln!(
            writer,
            "{id}{d}{}{d}{}{d}{}{d}{}",
            job.instance,
            job.setting,
            job.config,
            job.seed,
            d = JOB_LIST_DELIMITER
        )?;
    }

    writer.flush()?;
    debug!(path = ?path, "Wrote job list with {} entries", jobs.len());

    Ok(jobs.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_jobs(shuffle_seed: u64) -> Vec<JobDescriptor> {
        build_jobs(
            &["a.xinst", "b.xlayo"],
            &["default.xsett"],
            &["greedy.xconf"],
            1..4,
            shuffle_seed,
        )
    }

    #[test]
    fn cross_product_covers_every_combination() {
        let jobs = scenario_jobs(1);

        assert_eq!(jobs.len(), 6);
        assert_eq!(jobs.iter().collect::<HashSet<_>>().len(), 6);
        for instance in ["a.xinst", "b.xlayo"] {
            for seed in 1..4 {
                assert!(jobs
                    .iter()
                    .any(|job| job.instance == instance && job.seed == seed));
            }
        }
    }

    #[test]
    fn shuffle_is_reproducible() {
        assert_eq!(scenario_jobs(7), scenario_jobs(7));
    }

    #[test]
    fn empty_dimension_yields_no_jobs() {
        let empty: [&str; 0] = [];
        assert!(build_jobs(&empty, &["s"], &["c"], 0..10, 1).is_empty());
    }

    #[test]
    fn random_idents_are_unique() {
        let jobs = build_jobs(&["i"; 1], &["s"], &["c"], 0..2000, 1);
        let mut generator = RandomIdents::new(1, DEFAULT_IDENT_SPACE);
        let idents = assign_idents(jobs, &mut generator).unwrap();

        let unique = idents.iter().map(|(ident, _)| *ident).collect::<HashSet<_>>();
        assert_eq!(unique.len(), 2000);
        assert!(unique.iter().all(|ident| ident.0 <= DEFAULT_IDENT_SPACE));
    }

    #[test]
    fn random_idents_refuse_crowded_space() {
        let mut generator = RandomIdents::new(1, 10);
        let existing = (0..5).collect::<HashSet<u64>>();

        assert!(matches!(
            generator.generate(&existing),
            Err(CatalogError::IdentSpaceExhausted { existing: 5, space: 10 })
        ));
    }

    #[test]
    fn sequential_idents_skip_taken_values() {
        let mut generator = SequentialIdents::default();
        let existing = HashSet::from([0, 1, 3]);

        assert_eq!(generator.generate(&existing).unwrap(), 2);
        assert_eq!(generator.generate(&existing).unwrap(), 4);
    }

    #[test]
    fn job_list_has_one_line_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("joblist.csv");
        let jobs = scenario_jobs(1);

        assert_eq!(write_job_list(&path, &jobs).unwrap(), 6);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines = content.lines().collect_vec();
        assert_eq!(lines.len(), 6);
        assert_eq!(
            lines[0],
            format!(
                "0;{};{};{};{}",
                jobs[0].instance, jobs[0].setting, jobs[0].config, jobs[0].seed
            )
        );
    }

    #[test]
    fn job_list_rejects_delimiter_in_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("joblist.csv");
        let jobs = build_jobs(&["bad;name"], &["s"], &["c"], 0..1, 1);

        assert!(matches!(
            write_job_list(&path, &jobs),
            Err(CatalogError::Delimiter(_))
        ));
        assert!(!path.exists());
    }
}
