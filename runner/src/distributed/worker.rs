use super::util::{worker_label, worker_output_dir};
use crate::{
    executors::JobExecutor,
    protocol::{read_message, write_message, Assignment, Message, ProtocolError},
};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use std::{
    io::BufReader,
    net::TcpStream,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to connect to the coordinator")]
    Connect(#[source] std::io::Error),
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Failed to build worker thread pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl WorkerError {
    /// connectivity failures end a worker on the request path, anything else is retried
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Protocol(ProtocolError::Io(_) | ProtocolError::Empty)
        )
    }
}

/// States of a single worker loop
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    RequestingJob,
    Sleeping,
    Executing(Assignment),
    SubmittingResult(Assignment),
    Terminated,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// coordinator address as host:port
    pub server: String,
    pub output_dir: PathBuf,
    /// backoff after the coordinator had no job to hand out
    pub sleep: Duration,
    /// pause after each executed job before contacting the coordinator again
    pub pause: Duration,
}

/// What a worker loop did before it terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerReport {
    pub executed: usize,
    pub submitted: usize,
    pub discarded: usize,
    pub failed: usize,
}

/// A single pull loop: request a job, run it, report it, until the coordinator is gone
#[derive(Debug)]
pub struct WorkerAgent<E: JobExecutor> {
    id: usize,
    label: String,
    options: WorkerOptions,
    output_dir: PathBuf,
    executor: Arc<E>,
    report: WorkerReport,
}

impl<E: JobExecutor> WorkerAgent<E> {
    pub fn new(id: usize, options: WorkerOptions, executor: Arc<E>) -> Self {
        Self {
            id,
            label: worker_label(id),
            output_dir: worker_output_dir(&options.output_dir, id),
            options,
            executor,
            report: WorkerReport::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Loop until the coordinator refuses connections
    pub fn run(mut self) -> WorkerReport {
        let mut state = WorkerState::RequestingJob;

        while state != WorkerState::Terminated {
            state = self.step(state);
        }

        info!(worker = %self.label, "Worker terminated: {:?}", self.report);
        self.report
    }

    /// Perform the work of one state and return the next one
    pub fn step(&mut self, state: WorkerState) -> WorkerState {
        match state {
            WorkerState::RequestingJob => {
                debug!(worker = %self.label, "Contacting coordinator at {} for another job ...", self.options.server);

                match self.request_job() {
                    Ok(Message::Sleep) => WorkerState::Sleeping,
                    Ok(Message::Execute(assignment)) => WorkerState::Executing(assignment),
                    Ok(other) => {
                        warn!(worker = %self.label, "Unknown message received: {other:?}");
                        thread::sleep(self.options.pause);
                        WorkerState::RequestingJob
                    }
                    Err(error) if error.is_connectivity() => {
                        info!(
                            worker = %self.label,
                            "We seem to be done here - coordinator seems to be offline ({error})"
                        );
                        WorkerState::Terminated
                    }
                    Err(error) => {
                        warn!(worker = %self.label, "Unknown message received: {error}");
                        thread::sleep(self.options.pause);
                        WorkerState::RequestingJob
                    }
                }
            }
            WorkerState::Sleeping => {
                info!(worker = %self.label, "Out of jobs - sleep for a while and try again ...");
                thread::sleep(self.options.sleep);
                WorkerState::RequestingJob
            }
            WorkerState::Executing(assignment) => {
                info!(
                    worker = %self.label,
                    job = %assignment.job,
                    request = %assignment.request,
                    "Received job: {}",
                    assignment.descriptor
                );
                if let (Some(mean), Some(real)) =
                    (assignment.eta_secs, assignment.eta_throughput_secs)
                {
                    debug!(
                        worker = %self.label,
                        "Coordinator estimates {mean:.0}s (mean) / {real:.0}s (real) of work left"
                    );
                } else if let Some(mean) = assignment.eta_secs {
                    debug!(worker = %self.label, "Coordinator estimates {mean:.0}s of work left");
                }

                match self
                    .executor
                    .execute(&assignment.descriptor, &self.output_dir)
                {
                    Ok(output) => {
                        self.report.executed += 1;
                        debug!(
                            worker = %self.label,
                            job = %assignment.job,
                            status = ?output.status,
                            "Job ran for {:.1}s",
                            output.runtime.as_secs_f64()
                        );
                        WorkerState::SubmittingResult(assignment)
                    }
                    Err(error) => {
                        // never reported, the coordinator reclaims the job after its timeout
                        self.report.failed += 1;
                        error!(worker = %self.label, job = %assignment.job, "Failed to run job: {error}");
                        thread::sleep(self.options.pause);
                        WorkerState::RequestingJob
                    }
                }
            }
            WorkerState::SubmittingResult(assignment) => {
                debug!(worker = %self.label, job = %assignment.job, "Signaling job finished to coordinator ...");

                match self.submit(&assignment) {
                    Ok(()) => self.report.submitted += 1,
                    Err(error) => {
                        self.report.discarded += 1;
                        warn!(
                            worker = %self.label,
                            job = %assignment.job,
                            "Coordinator unreachable for result submission - discarding it ({error})"
                        );
                    }
                }

                // wait a bit before annoying the coordinator again
                thread::sleep(self.options.pause);
                WorkerState::RequestingJob
            }
            WorkerState::Terminated => WorkerState::Terminated,
        }
    }

    fn request_job(&self) -> Result<Message, WorkerError> {
        let stream = TcpStream::connect(&self.options.server).map_err(WorkerError::Connect)?;
        write_message(&stream, &Message::RequestJob)?;

        Ok(read_message(BufReader::new(&stream))?)
    }

    fn submit(&self, assignment: &Assignment) -> Result<(), WorkerError> {
        let stream = TcpStream::connect(&self.options.server).map_err(WorkerError::Connect)?;
        write_message(
            &stream,
            &Message::SubmitFinished {
                request: assignment.request,
                job: assignment.job,
            },
        )?;

        Ok(())
    }
}

/// Run `threads` independent worker loops, started `stagger` apart, until all of them
/// terminated
pub fn run_workers<E: JobExecutor + 'static>(
    options: WorkerOptions,
    threads: usize,
    stagger: Duration,
    executor: Arc<E>,
) -> Result<Vec<WorkerReport>, WorkerError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|index| format!("worker{index}"))
        .build()?;
    let reports = Mutex::new(Vec::with_capacity(threads));

    debug!("Starting thread pool with {threads} threads");

    pool.scope(|scope| {
        for id in 0..threads {
            let agent = WorkerAgent::new(id, options.clone(), executor.clone());
            let reports = &reports;

            scope.spawn(move |_| {
                thread::sleep(stagger * id as u32);
                info!("Starting worker thread: {id}");

                let report = agent.run();
                reports.lock().push(report);
            });
        }
    });

    info!("All workers returned");

    Ok(reports.into_inner())
}
