use super::SharedStore;
use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct StopSignal {
    requested: Mutex<bool>,
    wake: Condvar,
}

/// Background task moving stalled in progress jobs back to todo
#[derive(Debug)]
pub struct TimeoutMonitor {
    store: SharedStore,
    period: Duration,
    stop: Arc<StopSignal>,
}

/// Handle to a running `TimeoutMonitor`, stopping it is cooperative
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<StopSignal>,
    thread: JoinHandle<usize>,
}

impl TimeoutMonitor {
    /// Start checking the store every `period` on a dedicated thread
    pub fn spawn(store: SharedStore, period: Duration) -> std::io::Result<MonitorHandle> {
        let stop = Arc::new(StopSignal::default());
        let monitor = Self {
            store,
            period,
            stop: stop.clone(),
        };

        let thread = thread::Builder::new()
            .name("timeout-monitor".to_owned())
            .spawn(move || monitor.run())?;

        Ok(MonitorHandle { stop, thread })
    }

    /// returns the number of reclaimed jobs
    fn run(self) -> usize {
        debug!("Timeout monitor checks every {:?}", self.period);
        let mut reclaimed = 0;

        loop {
            reclaimed += self.store.lock().reclaim_expired(Instant::now()).len();

            let mut requested = self.stop.requested.lock();
            if !*requested {
                self.stop.wake.wait_for(&mut requested, self.period);
            }
            if *requested {
                break;
            }
        }

        debug!("Timeout monitor stopped after reclaiming {reclaimed} jobs");
        reclaimed
    }
}

impl MonitorHandle {
    /// Request the monitor to stop and wait for it. Returns the number of reclaimed jobs.
    pub fn stop(self) -> usize {
        *self.stop.requested.lock() = true;
        self.stop.wake.notify_all();

        match self.thread.join() {
            Ok(reclaimed) => {
                info!("Timeout monitor terminated");
                reclaimed
            }
            Err(_) => {
                error!("Timeout monitor panicked");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{JobDescriptor, JobIdent},
        sync::store::{JobState, JobStateStore},
    };

    fn store(timeout: Duration) -> SharedStore {
        let job = JobDescriptor {
            instance: "i.xinst".to_owned(),
            setting: "s.xsett".to_owned(),
            config: "c.xconf".to_owned(),
            seed: 1,
        };

        SharedStore::new(JobStateStore::new(vec![(JobIdent(1), job)], timeout, 1))
    }

    #[test]
    fn reclaims_stalled_job_and_stops_promptly() {
        let store = store(Duration::from_millis(20));
        let assignment = store.lock().dispatch(Instant::now()).unwrap().unwrap();

        let handle = TimeoutMonitor::spawn(store.clone(), Duration::from_millis(10)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.lock().state(assignment.job) != Some(JobState::Todo) {
            assert!(Instant::now() < deadline, "job was never reclaimed");
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(handle.stop(), 1);
        assert!(store.lock().partition_holds());
    }

    #[test]
    fn stop_interrupts_a_long_period() {
        let store = store(Duration::from_secs(3600));
        let handle = TimeoutMonitor::spawn(store, Duration::from_secs(3600)).unwrap();

        let started = Instant::now();
        assert_eq!(handle.stop(), 0);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
