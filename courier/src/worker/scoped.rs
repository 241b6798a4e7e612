use std::ops::Deref;

use courier_api::errors::WorkerThreadError;
use courier_api::Mode;

use super::{WorkerThread, WorkerThreadConfig};

/// A worker that finishes its queued work and joins its threads when it
/// goes out of scope.
pub struct ScopedWorker<R: Send + 'static = ()> {
    worker: WorkerThread<R>,
}

impl<R: Send + 'static> ScopedWorker<R> {
    pub fn new(config: WorkerThreadConfig) -> Result<Self, WorkerThreadError> {
        WorkerThread::new(config).map(|worker| Self { worker })
    }
}

impl<R: Send + 'static> Deref for ScopedWorker<R> {
    type Target = WorkerThread<R>;

    fn deref(&self) -> &Self::Target {
        &self.worker
    }
}

impl<R: Send + 'static> Drop for ScopedWorker<R> {
    fn drop(&mut self) {
        if matches!(self.worker.mode(), Mode::MessageQueue | Mode::MessageQueueMt) {
            let _ = self.worker.dispatch();
            self.worker.wait();
        }
        self.worker.stop_async();
        self.worker.join();
    }
}

/// Creates a [`ScopedWorker`] running `()` tasks.
pub fn create_scoped_thread(config: WorkerThreadConfig) -> Result<ScopedWorker<()>, WorkerThreadError> {
    ScopedWorker::new(config)
}
