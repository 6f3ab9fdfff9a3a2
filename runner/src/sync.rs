pub mod monitor;
pub mod store;

use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use std::sync::Arc;
use store::JobStateStore;

#[derive(Debug, Clone)]
/// Transparent, thread safe handle to the `JobStateStore`
///
/// This is the single lock of the coordinator: the dispatch server and the timeout
/// monitor both mutate the store only while holding it.
pub struct SharedStore(Arc<FairMutex<JobStateStore>>);

impl SharedStore {
    pub fn new(store: JobStateStore) -> Self {
        Self(Arc::new(FairMutex::new(store)))
    }

    pub fn lock(&self) -> ArcMutexGuard<RawFairMutex, JobStateStore> {
        self.0.lock_arc()
    }
}
