use crate::{
    protocol::{read_message, write_message, Message},
    sync::{monitor::TimeoutMonitor, store::Summary, SharedStore},
};
use std::{
    io::BufReader,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind listener")]
    Bind(#[source] std::io::Error),
    #[error("Failed to start timeout monitor")]
    Monitor(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// how often the timeout monitor looks for stalled jobs
    pub monitor_period: Duration,
    /// read timeout per connection, `None` blocks until the peer sends or closes
    pub read_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            monitor_period: Duration::from_secs(60),
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Coordinator accepting one connection at a time
///
/// Every connection carries a single request. All state transitions happen while
/// holding the store lock, which is shared with the timeout monitor.
#[derive(Debug)]
pub struct DispatchServer {
    listener: TcpListener,
    store: SharedStore,
    options: ServerOptions,
}

impl DispatchServer {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        store: SharedStore,
        options: ServerOptions,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).map_err(ServerError::Bind)?;

        Ok(Self {
            listener,
            store,
            options,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Serve workers until no job is left in todo or in progress, then stop the
    /// timeout monitor and wait for it
    pub fn run(self) -> Result<Summary, ServerError> {
        let monitor = TimeoutMonitor::spawn(self.store.clone(), self.options.monitor_period)
            .map_err(ServerError::Monitor)?;

        info!(
            "Waiting for clients on {} ...",
            self.local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown address".to_owned())
        );

        // keep responding to workers as long as there are jobs todo or running
        while !self.store.lock().is_finished() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.handle(stream, peer),
                Err(error) => warn!(error = ?error, "Failed to accept connection: {error}"),
            }
        }

        // refuse further connections before waiting, workers take this as the end
        let Self { listener, store, .. } = self;
        drop(listener);

        info!("Waiting for threads to terminate ...");
        let reclaimed = monitor.stop();
        let summary = store.lock().summary(Instant::now());

        info!(
            done = summary.done,
            dispatches = summary.dispatches,
            reclaims = summary.reclaims,
            duplicates = summary.duplicates,
            "All {} jobs finished after {:.0}s, the monitor reclaimed {reclaimed}",
            summary.total,
            summary.elapsed.as_secs_f64()
        );

        Ok(summary)
    }

    /// Handle one connection completely. Malformed input is logged and dropped.
    fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(error) = stream.set_read_timeout(self.options.read_timeout) {
            warn!(peer = %peer, error = ?error, "Failed to set read timeout: {error}");
        }

        let message = match read_message(BufReader::new(&stream)) {
            Ok(message) => message,
            Err(error) => {
                warn!(peer = %peer, "Warning! Unknown message received: {error}");
                return;
            }
        };

        debug!(peer = %peer, "rcvd: {message:?}");

        let reply = {
            let mut store = self.store.lock();
            let now = Instant::now();

            let reply = match message {
                Message::RequestJob => match store.dispatch(now) {
                    Ok(Some(assignment)) => {
                        info!(
                            peer = %peer,
                            job = %assignment.job,
                            request = %assignment.request,
                            "Sending job: {}",
                            assignment.descriptor
                        );
                        Some(Message::Execute(assignment))
                    }
                    Ok(None) => {
                        info!(peer = %peer, "No more jobs to send - setting worker to sleep ...");
                        Some(Message::Sleep)
                    }
                    Err(error) => {
                        error!(peer = %peer, "Failed to mint a request ident: {error}");
                        Some(Message::Sleep)
                    }
                },
                Message::SubmitFinished { request, job } => {
                    let completion = store.complete(request, job, now);
                    debug!(peer = %peer, job = %job, "Result processed as {completion:?}");
                    None
                }
                other => {
                    warn!(
                        peer = %peer,
                        "Warning! Unexpected {:?} signal from a worker",
                        other.signal()
                    );
                    return;
                }
            };

            debug_assert!(store.partition_holds());
            info!("Job status: {}", store.progress(now));

            reply
        };

        if let Some(reply) = reply {
            if let Err(error) = write_message(&stream, &reply) {
                // a lost execute reply is recovered by the timeout monitor
                warn!(peer = %peer, "Failed to reply: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{JobDescriptor, JobIdent},
        sync::store::JobStateStore,
    };
    use std::{io::Write, thread};

    fn server() -> DispatchServer {
        let job = JobDescriptor {
            instance: "i.xinst".to_owned(),
            setting: "s.xsett".to_owned(),
            config: "c.xconf".to_owned(),
            seed: 1,
        };
        let store = JobStateStore::new(vec![(JobIdent(7), job)], Duration::from_secs(3600), 1);

        DispatchServer::bind(
            "127.0.0.1:0",
            SharedStore::new(store),
            ServerOptions {
                monitor_period: Duration::from_millis(50),
                read_timeout: Some(Duration::from_millis(500)),
            },
        )
        .unwrap()
    }

    fn exchange(addr: SocketAddr, message: &Message) -> Option<Message> {
        let stream = TcpStream::connect(addr).unwrap();
        write_message(&stream, message).unwrap();
        read_message(BufReader::new(&stream)).ok()
    }

    #[test]
    fn serves_until_every_job_is_done() {
        let server = server();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || server.run().unwrap());

        let Some(Message::Execute(assignment)) = exchange(addr, &Message::RequestJob) else {
            panic!("expected a job");
        };
        assert_eq!(assignment.job, JobIdent(7));

        // in progress but nothing left to hand out
        assert_eq!(exchange(addr, &Message::RequestJob), Some(Message::Sleep));

        exchange(
            addr,
            &Message::SubmitFinished {
                request: assignment.request,
                job: assignment.job,
            },
        );

        let summary = handle.join().unwrap();
        assert_eq!(summary.done, 1);
        assert_eq!(summary.dispatches, 1);
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn returns_immediately_without_jobs() {
        let store = JobStateStore::new(Vec::new(), Duration::from_secs(3600), 1);
        let server = DispatchServer::bind(
            "127.0.0.1:0",
            SharedStore::new(store),
            ServerOptions::default(),
        )
        .unwrap();

        let summary = server.run().unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.dispatches, 0);
    }

    #[test]
    fn garbage_is_dropped_without_state_change() {
        let server = server();
        let addr = server.local_addr().unwrap();
        let store = server.store();
        let handle = thread::spawn(move || server.run().unwrap());

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"7;13;17\n").unwrap();
        assert!(read_message(BufReader::new(&stream)).is_err());

        // a worker must never send a sleep signal
        assert_eq!(exchange(addr, &Message::Sleep), None);
        {
            let store = store.lock();
            assert_eq!(store.todo_len(), 1);
            assert_eq!(store.in_progress_len(), 0);
        }

        let Some(Message::Execute(assignment)) = exchange(addr, &Message::RequestJob) else {
            panic!("server should still serve jobs");
        };
        exchange(
            addr,
            &Message::SubmitFinished {
                request: assignment.request,
                job: assignment.job,
            },
        );

        assert_eq!(handle.join().unwrap().done, 1);
    }
}
