//! # Worker Threads
//!
//! A [`WorkerThread`] owns a bounded queue of tasks and runs them according
//! to its [`Mode`]:
//!
//! - `UpdateCallback`: the owner drives execution by calling
//!   [`update`](WorkerThread::update), or hands a [`WorkerRunnable`] to a
//!   backing thread with [`create_worker_thread`](WorkerThread::create_worker_thread)
//! - `MessageQueue`: one dedicated thread runs tasks as they arrive
//! - `MessageQueueMt`: [`dispatch`](WorkerThread::dispatch) tops up a pool of
//!   transient threads that drain the queue concurrently
//! - `MessageLoop`: one dedicated thread runs one task per dispatch
//! - `RunOneTime`: the first queued task runs once on a fresh thread
//!
//! Every submitted task yields a [`MessageHandle`]. Tasks are taken from the
//! front of the queue; raising a pending task's priority to `Asap` or
//! `Immediately` moves it to the front once.
//!
//! Task panics are caught. The panic message is broadcast on
//! [`sig_error_throw`](WorkerThread::sig_error_throw) and the handle reports
//! the task as completed without a value.
//!
//! ## Example
//!
//! ```rust
//! use courier::worker::{WorkerThread, WorkerThreadConfig};
//! use courier_api::Mode;
//!
//! let worker = WorkerThread::new(WorkerThreadConfig::new(Mode::MessageQueue)).unwrap();
//! let handle = worker.push_callback(|| 6 * 7);
//! assert_eq!(handle.get_result().unwrap(), 42);
//! ```

mod config;
mod handle;
mod runner;
mod scoped;
mod shared;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use courier_api::errors::WorkerThreadError;
use courier_api::{Mode, ThreadExecutionMode};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::signal::SignalMt;
use shared::{OneTimeState, WorkerShared};

pub use config::{WorkerThreadConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_WORKER_NAME};
pub use shared::PauseReason;
pub use handle::{HandlerWrapper, MessageHandle, PackagedMessage, WaitStatus};
pub use runner::WorkerRunnable;
pub use scoped::{create_scoped_thread, ScopedWorker};

crate::signal_key!(
    /// Emission key for the signals a worker raises about itself.
    pub WorkerKey
);

#[derive(Default)]
struct ThreadSet {
    dedicated: Option<JoinHandle<()>>,
    pool: HashMap<usize, JoinHandle<()>>,
    next_pool_slot: usize,
}

/// A task queue with a configurable execution strategy.
pub struct WorkerThread<R: Send + 'static = ()> {
    shared: Arc<WorkerShared<R>>,
    threads: Mutex<ThreadSet>,
    execution: ThreadExecutionMode,
}

impl<R: Send + 'static> WorkerThread<R> {
    /// Creates the worker and, for `MessageQueue` and `MessageLoop`, starts
    /// its dedicated thread.
    pub fn new(config: WorkerThreadConfig) -> Result<Self, WorkerThreadError> {
        let worker = Self {
            shared: Arc::new(WorkerShared::new(&config)),
            threads: Mutex::new(ThreadSet::default()),
            execution: config.execution,
        };
        if config.mode.has_dedicated_thread() {
            worker.start_dedicated()?;
        }
        if worker.shared.trace {
            crate::log_worker!(&config.name, "created", id = %worker.shared.id, mode = ?config.mode);
        }
        Ok(worker)
    }

    pub fn make_shared(config: WorkerThreadConfig) -> Result<Arc<Self>, WorkerThreadError> {
        Self::new(config).map(Arc::new)
    }

    /// Creates a worker that lives for the rest of the process.
    ///
    /// Only detached workers can be leaked, since nothing will ever join them.
    pub fn make_leaked(config: WorkerThreadConfig) -> Result<&'static Self, WorkerThreadError> {
        if config.execution != ThreadExecutionMode::Detach {
            return Err(WorkerThreadError::ThisModeCanNotBeUsed(config.mode));
        }
        Self::new(config).map(|worker| &*Box::leak(Box::new(worker)))
    }

    /// Enqueues `task` and returns its handle.
    ///
    /// Fails through the handle with [`WorkerThreadError::PushExceed`] when the
    /// queue is full and [`WorkerThreadError::EnqueueWhileStopping`] once the
    /// worker is stopping. In `MessageQueueMt` and `MessageLoop` mode the
    /// task waits for the next [`dispatch`](Self::dispatch).
    pub fn push_callback<F>(&self, task: F) -> MessageHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
    {
        self.shared.push(Box::new(task))
    }

    /// Starts processing according to the current mode.
    pub fn dispatch(&self) -> Result<(), WorkerThreadError> {
        let mode = {
            let state = self.shared.state.lock();
            if state.mode == Mode::RunOneTime && state.one_time != OneTimeState::NotStarted {
                return Err(WorkerThreadError::IsAlreadyCreated);
            }
            if state.terminated || !state.alive {
                return Err(WorkerThreadError::Terminated);
            }
            state.mode
        };

        match mode {
            Mode::UpdateCallback => {
                if self.has_update_thread() {
                    self.shared.work.notify_all();
                    Ok(())
                } else {
                    Err(WorkerThreadError::UpdateCallback)
                }
            }
            Mode::MessageQueue => {
                self.start_dedicated()?;
                self.shared.work.notify_all();
                Ok(())
            }
            Mode::MessageLoop => {
                self.start_dedicated()?;
                self.shared.state.lock().loop_wakes += 1;
                self.shared.work.notify_all();
                Ok(())
            }
            Mode::MessageQueueMt => self.spawn_pool_threads(),
            Mode::RunOneTime => self.run_one_time(false),
        }
    }

    /// Runs every message queued before the call on the calling thread.
    ///
    /// Only valid in `UpdateCallback` mode. Returns the number of messages
    /// processed; a paused worker processes none.
    pub fn update(&self) -> Result<usize, WorkerThreadError> {
        let limit = {
            let state = self.shared.state.lock();
            if state.mode != Mode::UpdateCallback {
                return Err(WorkerThreadError::ThisModeCanNotBeUsed(state.mode));
            }
            if state.pause.is_some() {
                return Ok(0);
            }
            state.queue.len()
        };
        Ok(self.shared.drain(limit))
    }

    /// Removes the next runnable message without running it.
    pub fn pop(&self) -> Result<PackagedMessage<R>, WorkerThreadError> {
        self.blocking_pop(false)
    }

    /// Like [`pop`](Self::pop); with `wait` it blocks until a message
    /// arrives or the worker stops.
    pub fn blocking_pop(&self, wait: bool) -> Result<PackagedMessage<R>, WorkerThreadError> {
        self.shared.blocking_pop(wait)
    }

    /// Runs a popped message on the calling thread.
    pub fn call(&self, message: PackagedMessage<R>) -> Result<(), WorkerThreadError> {
        self.shared.state.lock().in_flight += 1;
        self.shared.call(message, true)
    }

    /// Switches the run mode and queue capacity.
    ///
    /// Dequeuing is paused for the duration of the switch. A dedicated
    /// thread of the old mode is joined before the new one starts.
    pub fn change_mode(&self, mode: Mode, max_queue: usize) -> Result<(), WorkerThreadError> {
        let previous = {
            let mut state = self.shared.state.lock();
            let current = state.mode;
            if mode == current {
                return Err(WorkerThreadError::SamePreviousMode);
            }
            if current == Mode::UpdateCallback && state.update_thread {
                return Err(WorkerThreadError::ChangeModeUpdateCallback);
            }
            if mode == Mode::RunOneTime && state.has_run {
                return Err(WorkerThreadError::ThisModeCanNotBeUsed(mode));
            }
            if current == Mode::RunOneTime && state.one_time != OneTimeState::NotStarted {
                return Err(WorkerThreadError::ThisModeCanNotBeUsed(mode));
            }
            if state.terminated || !state.alive {
                return Err(WorkerThreadError::Terminated);
            }
            if state.pause.is_none() {
                state.pause = Some(PauseReason::Automatic);
            }
            state.epoch += 1;
            state.mode = mode;
            state.max_queue = max_queue;
            state.loop_wakes = 0;
            current
        };
        self.shared.wake_all();

        let retired = self.threads.lock().dedicated.take();
        if let Some(handle) = retired {
            join_quietly(handle, &self.shared.name);
        }

        let started = if mode.has_dedicated_thread() {
            self.start_dedicated()
        } else {
            Ok(())
        };

        {
            let mut state = self.shared.state.lock();
            if state.pause == Some(PauseReason::Automatic) {
                state.pause = None;
            }
        }
        self.shared.work.notify_all();

        if self.shared.trace {
            crate::log_worker!(&self.shared.name, "mode_changed", from = ?previous, to = ?mode, max_queue);
        }
        started
    }

    /// Suspends or resumes dequeuing. Running tasks are not interrupted.
    pub fn pause(&self, pause: bool) {
        {
            let mut state = self.shared.state.lock();
            state.pause = pause.then_some(PauseReason::Manual);
        }
        if !pause {
            self.shared.work.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().pause.is_some()
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.shared.state.lock().pause
    }

    /// Parks the worker's threads at the next message boundary.
    pub fn suspend(&self) {
        self.shared.state.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().suspended = false;
        self.shared.resume.notify_all();
        self.shared.work.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    /// Asks every thread to exit at its next check and refuses new tasks.
    pub fn stop_async(&self) {
        self.shared.state.lock().terminated = true;
        self.shared.wake_all();
        if self.shared.trace {
            crate::log_worker!(&self.shared.name, "stop_requested", id = %self.shared.id);
        }
    }

    /// Joins every thread the worker started.
    ///
    /// Dedicated threads only exit after [`stop_async`](Self::stop_async) or a
    /// mode change, so call one of those first.
    pub fn join(&self) {
        let (dedicated, pool) = {
            let mut threads = self.threads.lock();
            let pool: Vec<_> = threads.pool.drain().map(|(_, handle)| handle).collect();
            (threads.dedicated.take(), pool)
        };
        for handle in dedicated.into_iter().chain(pool) {
            join_quietly(handle, &self.shared.name);
        }
        while self.shared.finished_pool.pop().is_some() {}
    }

    /// Lets the worker's threads run on without being joined.
    pub fn detach(&self) -> Result<(), WorkerThreadError> {
        if self.execution != ThreadExecutionMode::Detach {
            return Err(WorkerThreadError::ThisModeCanNotBeUsed(self.mode()));
        }
        let mut threads = self.threads.lock();
        threads.dedicated.take();
        threads.pool.clear();
        Ok(())
    }

    pub fn joinable(&self) -> bool {
        let threads = self.threads.lock();
        threads.dedicated.is_some() || !threads.pool.is_empty()
    }

    /// Blocks until the queue drains and nothing is executing.
    ///
    /// Returns `false` immediately in modes whose execution is not driven by
    /// the worker itself (`UpdateCallback`, `RunOneTime`). Also returns
    /// `false` once the remaining messages need another
    /// [`dispatch`](Self::dispatch) to run: a `MessageLoop` worker with no
    /// pending wake, or a `MessageQueueMt` worker whose pool threads have all
    /// exited.
    pub fn wait(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.mode.is_waitable() {
            return false;
        }
        loop {
            if state.is_drained() || state.terminated || !state.alive {
                return true;
            }
            if state.in_flight == 0 && state.needs_dispatch() {
                return false;
            }
            self.shared
                .idle
                .wait_for(&mut state, self.shared.idle_timeout);
        }
    }

    /// Cancels every pending message.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut state = self.shared.state.lock();
            let drained: Vec<_> = state.queue.drain(..).collect();
            for message in &drained {
                let _ = message.handler().cancel();
                WorkerShared::retire_locked(&mut state, message.handler());
            }
            drained
        };
        drop(drained);
        self.shared.idle.notify_all();
    }

    /// Starts a backing thread that calls `runnable` and then processes the
    /// queue on every tick. Only valid in `UpdateCallback` mode.
    pub fn create_worker_thread<W>(&self, runnable: W) -> Result<(), WorkerThreadError>
    where
        W: WorkerRunnable + 'static,
    {
        let epoch = {
            let mut state = self.shared.state.lock();
            if state.mode != Mode::UpdateCallback {
                return Err(WorkerThreadError::ThisModeCanNotBeUsed(state.mode));
            }
            if state.update_thread {
                return Err(WorkerThreadError::IsAlreadyCreated);
            }
            if state.terminated || !state.alive {
                return Err(WorkerThreadError::Terminated);
            }
            state.update_thread = true;
            state.has_run = true;
            state.epoch
        };

        let shared = Arc::clone(&self.shared);
        let runnable: Box<dyn WorkerRunnable> = Box::new(runnable);
        match self.spawn_thread("update", move || runner::update_loop(shared, runnable, epoch)) {
            Ok(handle) => {
                self.threads.lock().dedicated = Some(handle);
                Ok(())
            }
            Err(_) => {
                self.shared.state.lock().update_thread = false;
                Err(WorkerThreadError::RunnableCreateFailed)
            }
        }
    }

    /// Runs the first queued message on a new thread. Only valid once, in
    /// `RunOneTime` mode. With `wait` the call returns after the thread
    /// finished.
    pub fn run_one_time(&self, wait: bool) -> Result<(), WorkerThreadError> {
        {
            let mut state = self.shared.state.lock();
            if state.mode != Mode::RunOneTime {
                return Err(WorkerThreadError::ThisModeCanNotBeUsed(state.mode));
            }
            if state.one_time != OneTimeState::NotStarted {
                return Err(WorkerThreadError::IsAlreadyCreated);
            }
            state.one_time = OneTimeState::Running;
            state.has_run = true;
        }

        let shared = Arc::clone(&self.shared);
        let handle = match self.spawn_thread("once", move || runner::run_once(shared)) {
            Ok(handle) => handle,
            Err(error) => {
                self.shared.state.lock().one_time = OneTimeState::NotStarted;
                return Err(error);
            }
        };

        if wait {
            join_quietly(handle, &self.shared.name);
        } else {
            self.threads.lock().dedicated = Some(handle);
        }
        Ok(())
    }

    /// Enqueues `task` and immediately starts the one-shot thread for it.
    pub fn create_one_time<F>(&self, task: F) -> MessageHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let handle = self.push_callback(task);
        if handle.is_error() {
            return handle;
        }
        match self.run_one_time(false) {
            Ok(()) => handle,
            Err(error) => {
                let _ = handle.cancel();
                MessageHandle::from_error(error)
            }
        }
    }

    pub fn mode(&self) -> Mode {
        self.shared.state.lock().mode
    }

    pub fn execution(&self) -> ThreadExecutionMode {
        self.execution
    }

    pub fn max_queue(&self) -> usize {
        self.shared.state.lock().max_queue
    }

    pub fn pool_size(&self) -> usize {
        self.shared.state.lock().pool_size
    }

    /// Number of pending messages, canceled ones included until they are skipped.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }

    /// Whether the one-shot thread of `RunOneTime` mode has been started.
    pub fn is_one_time_run(&self) -> bool {
        self.shared.state.lock().one_time != OneTimeState::NotStarted
    }

    pub fn has_update_thread(&self) -> bool {
        self.shared.state.lock().update_thread
    }

    /// Whether the queue is drained and nothing is executing.
    pub fn is_process_done(&self) -> bool {
        self.shared.state.lock().is_drained()
    }

    /// Whether every pool thread has exited.
    pub fn has_all_mt_process_done(&self) -> bool {
        self.shared.state.lock().pool_threads == 0
    }

    /// Number of finished messages whose handles are still alive.
    pub fn cached_len(&self) -> usize {
        self.shared.state.lock().cache.len()
    }

    /// Emitted each time one of the worker's threads finishes its run.
    pub fn sig_on_run_finished(&self) -> &SignalMt<(), WorkerKey> {
        &self.shared.sig_on_run_finished
    }

    /// Emitted with a description whenever a task panics or a dispatch fails.
    pub fn sig_error_throw(&self) -> &SignalMt<String, WorkerKey> {
        &self.shared.sig_error_throw
    }

    fn start_dedicated(&self) -> Result<(), WorkerThreadError> {
        let mut threads = self.threads.lock();
        if threads.dedicated.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        if let Some(finished) = threads.dedicated.take() {
            join_quietly(finished, &self.shared.name);
        }

        let (mode, epoch) = {
            let mut state = self.shared.state.lock();
            state.has_run = true;
            (state.mode, state.epoch)
        };
        let entry: fn(Arc<WorkerShared<R>>, u64) = match mode {
            Mode::MessageQueue => runner::message_queue_loop::<R>,
            Mode::MessageLoop => runner::message_loop::<R>,
            _ => return Ok(()),
        };

        let shared = Arc::clone(&self.shared);
        let handle = self.spawn_thread("dedicated", move || entry(shared, epoch))?;
        threads.dedicated = Some(handle);
        Ok(())
    }

    fn spawn_pool_threads(&self) -> Result<(), WorkerThreadError> {
        let mut threads = self.threads.lock();
        while let Some(slot) = self.shared.finished_pool.pop() {
            if let Some(handle) = threads.pool.remove(&slot) {
                join_quietly(handle, &self.shared.name);
                if self.shared.trace {
                    tracing::trace!(worker = %self.shared.name, slot, "reaped pool thread");
                }
            }
        }

        let wanted = {
            let mut state = self.shared.state.lock();
            let wanted = state
                .pool_size
                .min(state.queue.len())
                .saturating_sub(state.pool_threads);
            state.pool_threads += wanted;
            if wanted > 0 {
                state.has_run = true;
            }
            wanted
        };

        for spawned in 0..wanted {
            let slot = threads.next_pool_slot;
            threads.next_pool_slot += 1;
            let shared = Arc::clone(&self.shared);
            match self.spawn_thread(&format!("pool-{slot}"), move || runner::pool_worker(shared, slot)) {
                Ok(handle) => {
                    threads.pool.insert(slot, handle);
                }
                Err(error) => {
                    let mut state = self.shared.state.lock();
                    state.pool_threads = state.pool_threads.saturating_sub(wanted - spawned);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn spawn_thread<F>(&self, role: &str, body: F) -> Result<JoinHandle<()>, WorkerThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.execution == ThreadExecutionMode::None {
            return Err(WorkerThreadError::CreateThreadFailed(
                "thread creation is disabled for this worker".to_string(),
            ));
        }
        let spawned = thread::Builder::new()
            .name(format!("{}:{}", self.shared.name, role))
            .spawn(body);
        if spawned.is_ok() && self.shared.trace {
            crate::log_worker!(&self.shared.name, "thread_spawned", role);
        }
        spawned.map_err(|error| {
            if self.shared.trace {
                tracing::error!(worker = %self.shared.name, role, error = %error, "failed to spawn thread");
            }
            WorkerThreadError::CreateThreadFailed(error.to_string())
        })
    }
}

impl<R: Send + 'static> Drop for WorkerThread<R> {
    fn drop(&mut self) {
        let (pending, cached) = {
            let mut state = self.shared.state.lock();
            state.terminated = true;
            state.alive = false;
            state.epoch += 1;
            let pending: Vec<_> = state.queue.drain(..).collect();
            let cached: Vec<_> = state.cache.drain().map(|(_, handler)| handler).collect();
            (pending, cached)
        };
        self.shared.wake_all();

        for message in &pending {
            let _ = message.handler().cancel();
            message.handler().on_message_canceled();
        }
        drop(pending);
        for handler in &cached {
            handler.on_message_canceled();
        }
        drop(cached);

        self.shared.sig_error_throw.close();
        self.shared.sig_on_run_finished.close();

        if self.execution == ThreadExecutionMode::Detach {
            let _ = self.detach();
        } else {
            self.join();
        }

        if self.shared.trace {
            crate::log_worker!(&self.shared.name, "destroyed", id = %self.shared.id);
        }
    }
}

impl<R: Send + 'static> fmt::Debug for WorkerThread<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .field("mode", &self.mode())
            .field("execution", &self.execution)
            .field("pending", &self.len())
            .finish()
    }
}

fn join_quietly(handle: JoinHandle<()>, worker: &str) {
    // a worker dropped from one of its own tasks cannot join itself
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        tracing::error!(worker, "worker thread panicked");
    }
}

/// Sleeps the calling thread.
pub fn sleep(duration: Duration) {
    thread::sleep(duration);
}

pub fn current_thread_id() -> ThreadId {
    thread::current().id()
}
