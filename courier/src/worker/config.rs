use std::time::Duration;

use courier_api::{Mode, ThreadExecutionMode, MAX_SIZE, UPDATE_INTERVAL};

pub const DEFAULT_WORKER_NAME: &str = "Worker Thread";

/// How long an idle dedicated thread sleeps before re-checking its state.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Construction parameters for a [`WorkerThread`](super::WorkerThread).
#[derive(Clone, Debug)]
pub struct WorkerThreadConfig {
    /// Name given to every OS thread the worker spawns.
    pub name: String,

    /// Initial run mode.
    pub mode: Mode,

    /// Maximum number of pending messages.
    pub max_queue: usize,

    /// Number of pool threads used in `MessageQueueMt` mode.
    pub pool_size: usize,

    /// What happens to the worker's threads when it is dropped.
    pub execution: ThreadExecutionMode,

    /// Sleep between two ticks of an update-callback backing thread.
    pub update_interval: Duration,

    /// Upper bound on how long an idle dedicated thread sleeps.
    pub idle_timeout: Duration,

    /// Whether lifecycle events are traced. Disabled for the log worker itself.
    pub trace_events: bool,
}

impl Default for WorkerThreadConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_WORKER_NAME.to_string(),
            mode: Mode::UpdateCallback,
            max_queue: MAX_SIZE,
            pool_size: num_cpus::get(),
            execution: ThreadExecutionMode::Join,
            update_interval: UPDATE_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            trace_events: true,
        }
    }
}

impl WorkerThreadConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Clamped to at least one thread.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_execution(mut self, execution: ThreadExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_trace_events(mut self, enabled: bool) -> Self {
        self.trace_events = enabled;
        self
    }
}
