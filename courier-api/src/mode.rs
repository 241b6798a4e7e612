//! Worker run modes and thread ownership policies.

/// How a worker thread executes its queued tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Tasks run when the owner calls `update`, or on a backing thread driven by a runnable.
    #[default]
    UpdateCallback,
    /// A single dedicated thread drains the queue as tasks arrive.
    MessageQueue,
    /// A pool of transient threads drains the queue concurrently.
    MessageQueueMt,
    /// A dedicated thread processes one message per dispatch.
    MessageLoop,
    /// The first queued task runs once on a fresh thread, then the worker terminates.
    RunOneTime,
}

impl Mode {
    /// Whether `wait` can block until queued work drains in this mode.
    pub fn is_waitable(&self) -> bool {
        !matches!(self, Mode::UpdateCallback | Mode::RunOneTime)
    }

    /// Whether the mode owns a long-lived dedicated thread.
    pub fn has_dedicated_thread(&self) -> bool {
        matches!(self, Mode::MessageQueue | Mode::MessageLoop)
    }
}

/// What happens to the worker's OS threads when the worker is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadExecutionMode {
    /// Threads are joined on drop.
    #[default]
    Join,
    /// Threads are detached and left to finish on their own.
    Detach,
    /// Threads come from the transient pool and are joined as they finish.
    ThreadPool,
    /// No thread is ever created.
    None,
}
