use crate::{
    catalog::{
        CatalogError, IdentGenerator, JobDescriptor, JobIdent, RandomIdents, RequestIdent,
        REQUEST_IDENT_SPACE,
    },
    protocol::Assignment,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Display},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

/// Partition a job currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Todo,
    InProgress,
    Done,
}

/// Result of processing a submitted result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// the latest dispatch of an in progress job finished
    Completed,
    /// an older dispatch of a job finished while a newer dispatch is still running
    Stale,
    /// the job finished after it was reclaimed and before it was dispatched again
    AfterTimeout,
    /// the job was already done, nothing changed
    AlreadyDone,
    /// unknown job, or request that does not belong to the job, nothing changed
    Rejected,
}

impl Completion {
    /// whether the completion hints at a job being executed more than once
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Stale | Self::AfterTimeout | Self::AlreadyDone)
    }
}

/// Snapshot of the partition sizes and the two remaining time estimates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub done: usize,
    pub in_progress: usize,
    pub todo: usize,
    /// mean observed duration x remaining todo jobs
    pub eta_mean: Option<Duration>,
    /// (elapsed since start / done jobs) x remaining todo jobs
    pub eta_throughput: Option<Duration>,
}

fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => format!("{:.0}s", eta.as_secs_f64()),
        None => "n/a".to_owned(),
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} (done/inprogress/todo) todo-ETA (mean): {} todo-ETA (real): {}",
            self.done,
            self.in_progress,
            self.todo,
            format_eta(self.eta_mean),
            format_eta(self.eta_throughput)
        )
    }
}

/// Counters reported when the coordinator shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    pub total: usize,
    pub done: usize,
    pub dispatches: usize,
    pub reclaims: usize,
    pub duplicates: usize,
    pub elapsed: Duration,
}

/// Authoritative job state of the coordinator
///
/// Every job ident lives in exactly one of `todo`, `in_progress` and `done`. The store
/// itself is not synchronized, see `SharedStore` for the locked handle shared by the
/// dispatch server and the timeout monitor.
#[derive(Debug)]
pub struct JobStateStore {
    todo: BTreeMap<JobIdent, JobDescriptor>,
    in_progress: BTreeMap<JobIdent, JobDescriptor>,
    done: BTreeMap<JobIdent, JobDescriptor>,
    // start of every outstanding dispatch, together with the job it belongs to
    request_start: HashMap<RequestIdent, (JobIdent, Instant)>,
    latest_request: HashMap<JobIdent, RequestIdent>,
    issued_requests: HashSet<u64>,
    durations: Vec<Duration>,
    timeout: Duration,
    started: Instant,
    total: usize,
    rng: StdRng,
    request_idents: Box<dyn IdentGenerator>,
    dispatches: usize,
    reclaims: usize,
    duplicates: usize,
}

impl JobStateStore {
    /// Put all jobs into todo. `seed` drives the random job choice and request idents.
    pub fn new(jobs: Vec<(JobIdent, JobDescriptor)>, timeout: Duration, seed: u64) -> Self {
        Self::with_request_idents(
            jobs,
            timeout,
            seed,
            Box::new(RandomIdents::new(seed, REQUEST_IDENT_SPACE)),
        )
    }

    pub fn with_request_idents(
        jobs: Vec<(JobIdent, JobDescriptor)>,
        timeout: Duration,
        seed: u64,
        request_idents: Box<dyn IdentGenerator>,
    ) -> Self {
        let generated = jobs.len();
        let todo: BTreeMap<_, _> = jobs.into_iter().collect();

        if todo.len() != generated {
            error!(
                "{} duplicate job idents were merged",
                generated - todo.len()
            );
        }

        info!("Generated {} job idents", todo.len());

        Self {
            total: todo.len(),
            todo,
            in_progress: BTreeMap::new(),
            done: BTreeMap::new(),
            request_start: HashMap::new(),
            latest_request: HashMap::new(),
            issued_requests: HashSet::new(),
            durations: Vec::new(),
            timeout,
            started: Instant::now(),
            rng: StdRng::seed_from_u64(seed),
            request_idents,
            dispatches: 0,
            reclaims: 0,
            duplicates: 0,
        }
    }

    /// Move a uniformly chosen todo job to in progress under a fresh request ident.
    /// Returns `None` while todo is empty.
    pub fn dispatch(&mut self, now: Instant) -> Result<Option<Assignment>, CatalogError> {
        if self.todo.is_empty() {
            return Ok(None);
        }

        let request = RequestIdent(self.request_idents.generate(&self.issued_requests)?);
        let index = self.rng.gen_range(0..self.todo.len());
        let job = match self.todo.keys().nth(index) {
            Some(job) => *job,
            None => return Ok(None),
        };
        let Some(descriptor) = self.todo.remove(&job) else {
            return Ok(None);
        };

        self.issued_requests.insert(request.0);
        self.latest_request.insert(job, request);
        self.request_start.insert(request, (job, now));
        self.in_progress.insert(job, descriptor.clone());
        self.dispatches += 1;

        debug!(job = %job, request = %request, "Dispatching {descriptor}");

        let progress = self.progress(now);

        Ok(Some(Assignment {
            request,
            job,
            descriptor,
            eta_secs: progress.eta_mean.map(|eta| eta.as_secs_f64()),
            eta_throughput_secs: progress.eta_throughput.map(|eta| eta.as_secs_f64()),
        }))
    }

    /// Record a finished dispatch. Late and repeated results never duplicate a job in done.
    pub fn complete(&mut self, request: RequestIdent, job: JobIdent, now: Instant) -> Completion {
        let started = match self.request_start.get(&request) {
            Some((owner, _)) if *owner != job => {
                warn!(
                    job = %job,
                    request = %request,
                    owner = %owner,
                    "Rejected result, the request belongs to another job"
                );
                return Completion::Rejected;
            }
            Some((_, started)) => Some(*started),
            None => None,
        };

        let completion = if self.in_progress.contains_key(&job) {
            if self.latest_request.get(&job) == Some(&request) {
                Completion::Completed
            } else {
                Completion::Stale
            }
        } else if self.todo.contains_key(&job) {
            Completion::AfterTimeout
        } else if self.done.contains_key(&job) {
            Completion::AlreadyDone
        } else {
            warn!(job = %job, request = %request, "Rejected result for unknown job");
            return Completion::Rejected;
        };

        // a result for an outstanding job always comes with its outstanding request
        if started.is_none() && completion != Completion::AlreadyDone {
            warn!(job = %job, request = %request, "Rejected result for unknown request");
            return Completion::Rejected;
        }

        if let Some(started) = started {
            self.request_start.remove(&request);
            self.observe_duration(now.saturating_duration_since(started));
        }

        let descriptor = match completion {
            Completion::Completed | Completion::Stale => self.in_progress.remove(&job),
            Completion::AfterTimeout => self.todo.remove(&job),
            Completion::AlreadyDone | Completion::Rejected => None,
        };
        if let Some(descriptor) = descriptor {
            self.done.insert(job, descriptor);
        }

        match completion {
            Completion::Completed => info!(job = %job, "Finished job"),
            Completion::Stale | Completion::AfterTimeout => {
                info!(job = %job, "Finished job after timeout");
            }
            Completion::AlreadyDone | Completion::Rejected => {}
        }

        if completion.is_duplicate() {
            self.duplicates += 1;
            warn!(
                job = %job,
                request = %request,
                "Warning! Following job was executed more than once: {}",
                self.describe(job)
            );
        }

        completion
    }

    /// Move every in progress job whose latest dispatch is older than the timeout back
    /// to todo. Returns the reclaimed jobs.
    pub fn reclaim_expired(&mut self, now: Instant) -> Vec<JobIdent> {
        let expired: Vec<JobIdent> = self
            .in_progress
            .keys()
            .filter(|job| {
                match self
                    .latest_request
                    .get(*job)
                    .and_then(|request| self.request_start.get(request))
                {
                    Some((_, started)) => now.saturating_duration_since(*started) > self.timeout,
                    None => {
                        error!(job = %job, "In progress job without a dispatch time");
                        true
                    }
                }
            })
            .copied()
            .collect();

        for job in expired.iter() {
            if let Some(descriptor) = self.in_progress.remove(job) {
                info!(job = %job, "Job timed out: {descriptor}");
                self.todo.insert(*job, descriptor);
                self.reclaims += 1;
            }
        }

        expired
    }

    /// raise the timeout whenever a job took longer than the current threshold
    fn observe_duration(&mut self, duration: Duration) {
        self.durations.push(duration);

        if duration > self.timeout {
            info!(
                "Set new timeout to {:.0}s (was {:.0}s)",
                duration.as_secs_f64(),
                self.timeout.as_secs_f64()
            );
            self.timeout = duration;
        }
    }

    fn describe(&self, job: JobIdent) -> String {
        self.descriptor(job)
            .map(ToString::to_string)
            .unwrap_or_else(|| job.to_string())
    }

    pub fn progress(&self, now: Instant) -> Progress {
        let todo = self.todo.len() as f64;
        let eta_mean = (!self.durations.is_empty()).then(|| {
            let sum: Duration = self.durations.iter().sum();
            Duration::from_secs_f64(sum.as_secs_f64() / self.durations.len() as f64 * todo)
        });
        let eta_throughput = (!self.done.is_empty()).then(|| {
            let elapsed = now.saturating_duration_since(self.started);
            Duration::from_secs_f64(elapsed.as_secs_f64() / self.done.len() as f64 * todo)
        });

        Progress {
            done: self.done.len(),
            in_progress: self.in_progress.len(),
            todo: self.todo.len(),
            eta_mean,
            eta_throughput,
        }
    }

    /// true once no job is left to dispatch or waiting for a result
    pub fn is_finished(&self) -> bool {
        self.todo.is_empty() && self.in_progress.is_empty()
    }

    /// check that the partitions are disjoint and cover every generated job
    pub fn partition_holds(&self) -> bool {
        let disjoint = self.todo.keys().all(|job| {
            !self.in_progress.contains_key(job) && !self.done.contains_key(job)
        }) && self
            .in_progress
            .keys()
            .all(|job| !self.done.contains_key(job));

        disjoint && self.todo.len() + self.in_progress.len() + self.done.len() == self.total
    }

    pub fn state(&self, job: JobIdent) -> Option<JobState> {
        if self.todo.contains_key(&job) {
            Some(JobState::Todo)
        } else if self.in_progress.contains_key(&job) {
            Some(JobState::InProgress)
        } else if self.done.contains_key(&job) {
            Some(JobState::Done)
        } else {
            None
        }
    }

    pub fn descriptor(&self, job: JobIdent) -> Option<&JobDescriptor> {
        self.todo
            .get(&job)
            .or_else(|| self.in_progress.get(&job))
            .or_else(|| self.done.get(&job))
    }

    pub fn latest_request(&self, job: JobIdent) -> Option<RequestIdent> {
        self.latest_request.get(&job).copied()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn durations(&self) -> &[Duration] {
        &self.durations
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn todo_len(&self) -> usize {
        self.todo.len()
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn done_len(&self) -> usize {
        self.done.len()
    }

    pub fn summary(&self, now: Instant) -> Summary {
        Summary {
            total: self.total,
            done: self.done.len(),
            dispatches: self.dispatches,
            reclaims: self.reclaims,
            duplicates: self.duplicates,
            elapsed: now.saturating_duration_since(self.started),
        }
    }
}
