//! State shared between a [`WorkerThread`](super::WorkerThread) and the OS
//! threads it runs.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use courier_api::errors::WorkerThreadError;
use courier_api::{MessageStatus, Mode};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use super::config::WorkerThreadConfig;
use super::handle::{Completion, HandlerWrapper, MessageHandle, PackagedMessage, Task};
use super::WorkerKey;
use crate::signal::SignalMt;

/// Why a worker stopped taking messages off its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Requested through [`WorkerThread::pause`](super::WorkerThread::pause).
    Manual,
    /// Held internally while the worker switches modes.
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OneTimeState {
    NotStarted,
    Running,
    Finished,
}

/// Hands out the smallest free message id.
#[derive(Debug, Default)]
pub(crate) struct IdRecycler {
    next: usize,
    free: BTreeSet<usize>,
}

impl IdRecycler {
    pub(crate) fn acquire(&mut self) -> usize {
        self.free.pop_first().unwrap_or_else(|| {
            let id = self.next;
            self.next += 1;
            id
        })
    }

    pub(crate) fn release(&mut self, id: usize) {
        if id < self.next {
            self.free.insert(id);
        }
    }
}

pub(crate) struct WorkerState<R> {
    pub(crate) mode: Mode,
    pub(crate) max_queue: usize,
    pub(crate) pool_size: usize,
    pub(crate) queue: VecDeque<PackagedMessage<R>>,
    pub(crate) ids: IdRecycler,
    // finished or canceled messages whose handle is still alive
    pub(crate) cache: HashMap<usize, Arc<HandlerWrapper<R>>>,
    pub(crate) pause: Option<PauseReason>,
    pub(crate) suspended: bool,
    pub(crate) terminated: bool,
    pub(crate) alive: bool,
    pub(crate) in_flight: usize,
    pub(crate) loop_wakes: usize,
    // bumped on every mode change; dedicated threads from an older epoch exit
    pub(crate) epoch: u64,
    pub(crate) pool_threads: usize,
    pub(crate) update_thread: bool,
    pub(crate) one_time: OneTimeState,
    pub(crate) has_run: bool,
}

impl<R> WorkerState<R> {
    /// No runnable message is queued and nothing is executing.
    pub(crate) fn is_drained(&self) -> bool {
        self.in_flight == 0 && self.queue.iter().all(PackagedMessage::is_canceled)
    }

    /// Queued work that no running thread will pick up before the next dispatch.
    pub(crate) fn needs_dispatch(&self) -> bool {
        match self.mode {
            Mode::MessageLoop => self.loop_wakes == 0,
            Mode::MessageQueueMt => self.pool_threads == 0,
            _ => false,
        }
    }

    pub(crate) fn should_exit(&self, epoch: u64) -> bool {
        self.terminated || !self.alive || self.epoch != epoch
    }
}

pub(crate) struct WorkerShared<R> {
    pub(crate) name: String,
    pub(crate) id: Uuid,
    pub(crate) trace: bool,
    pub(crate) update_interval: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) state: Mutex<WorkerState<R>>,
    /// Wakes threads waiting for messages.
    pub(crate) work: Condvar,
    /// Signaled whenever in-flight work completes.
    pub(crate) idle: Condvar,
    pub(crate) resume: Condvar,
    /// Slots of pool threads that have exited and can be joined.
    pub(crate) finished_pool: SegQueue<usize>,
    pub(crate) sig_on_run_finished: SignalMt<(), WorkerKey>,
    pub(crate) sig_error_throw: SignalMt<String, WorkerKey>,
}

impl<R: Send + 'static> WorkerShared<R> {
    pub(crate) fn new(config: &WorkerThreadConfig) -> Self {
        Self {
            name: config.name.clone(),
            id: Uuid::new_v4(),
            trace: config.trace_events,
            update_interval: config.update_interval,
            idle_timeout: config.idle_timeout,
            state: Mutex::new(WorkerState {
                mode: config.mode,
                max_queue: config.max_queue,
                pool_size: config.pool_size.max(1),
                queue: VecDeque::new(),
                ids: IdRecycler::default(),
                cache: HashMap::new(),
                pause: None,
                suspended: false,
                terminated: false,
                alive: true,
                in_flight: 0,
                loop_wakes: 0,
                epoch: 0,
                pool_threads: 0,
                update_thread: false,
                one_time: OneTimeState::NotStarted,
                has_run: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
            resume: Condvar::new(),
            finished_pool: SegQueue::new(),
            sig_on_run_finished: SignalMt::new(),
            sig_error_throw: SignalMt::new(),
        }
    }

    pub(crate) fn push(self: &Arc<Self>, task: Task<R>) -> MessageHandle<R> {
        let mut state = self.state.lock();
        if state.terminated || !state.alive {
            return MessageHandle::from_error(WorkerThreadError::EnqueueWhileStopping);
        }
        if state.queue.len() >= state.max_queue {
            let capacity = state.max_queue;
            drop(state);
            if self.trace {
                tracing::warn!(worker = %self.name, capacity, "message queue is full");
            }
            return MessageHandle::from_error(WorkerThreadError::PushExceed { capacity });
        }

        let id = state.ids.acquire();
        let handler = Arc::new(HandlerWrapper::new(id));

        let shared = Arc::downgrade(self);
        handler.register_priority_changed_callback(Arc::new(move |id: usize| {
            if let Some(shared) = shared.upgrade() {
                shared.promote(id);
            }
        }));

        let shared = Arc::downgrade(self);
        let handle = MessageHandle::new(
            &handler,
            Box::new(move |handler: Arc<HandlerWrapper<R>>| {
                if let Some(shared) = shared.upgrade() {
                    shared.release_handle(handler);
                }
            }),
        );

        state.queue.push_back(PackagedMessage::new(handler, task));
        drop(state);
        self.work.notify_all();
        handle
    }

    /// Moves a pending message to the front of the queue.
    fn promote(&self, id: usize) {
        let mut state = self.state.lock();
        if let Some(pos) = state.queue.iter().position(|m| m.message_id() == id) {
            if let Some(message) = state.queue.remove(pos) {
                state.queue.push_front(message);
            }
        }
    }

    /// Called when the last handle to a message goes away.
    fn release_handle(&self, handler: Arc<HandlerWrapper<R>>) {
        let released = {
            let mut state = self.state.lock();
            handler.set_observed(false);
            let id = handler.message_id();
            let cached = state.cache.remove(&id);
            if cached.is_some() {
                state.ids.release(id);
            }
            cached
        };
        drop(released);
    }

    /// Keeps a settled message around for its handle, or frees its id.
    pub(crate) fn retire_locked(state: &mut WorkerState<R>, handler: &Arc<HandlerWrapper<R>>) {
        if handler.is_observed() {
            state.cache.insert(handler.message_id(), Arc::clone(handler));
        } else {
            state.ids.release(handler.message_id());
        }
    }

    /// Takes the next runnable message, discarding canceled ones.
    ///
    /// With `reserve` the message counts as in flight until
    /// [`call`](Self::call) finishes it.
    pub(crate) fn pop_locked(
        state: &mut WorkerState<R>,
        reserve: bool,
    ) -> Result<PackagedMessage<R>, WorkerThreadError> {
        if state.pause.is_some() {
            return Err(WorkerThreadError::Paused);
        }
        while let Some(message) = state.queue.pop_front() {
            if message.is_canceled() {
                Self::retire_locked(state, message.handler());
                continue;
            }
            if reserve {
                state.in_flight += 1;
            }
            return Ok(message);
        }
        Err(WorkerThreadError::QueueEmpty)
    }

    /// Pops a message for the caller to run. Dropping it unrun cancels it
    /// and settles it like any other canceled message.
    pub(crate) fn blocking_pop(self: &Arc<Self>, wait: bool) -> Result<PackagedMessage<R>, WorkerThreadError> {
        let mut state = self.state.lock();
        loop {
            match Self::pop_locked(&mut state, false) {
                Ok(mut message) => {
                    let shared = Arc::downgrade(self);
                    message.set_abandon_hook(Box::new(move |handler: &Arc<HandlerWrapper<R>>| {
                        if let Some(shared) = shared.upgrade() {
                            let mut state = shared.state.lock();
                            if state.alive {
                                Self::retire_locked(&mut state, handler);
                            }
                        }
                    }));
                    return Ok(message);
                }
                Err(error) if !wait => return Err(error),
                Err(_) if state.terminated || !state.alive => {
                    return Err(WorkerThreadError::Terminated);
                }
                Err(_) => self.work.wait(&mut state),
            }
        }
    }

    /// Runs one message on the calling thread.
    pub(crate) fn call(
        &self,
        mut message: PackagedMessage<R>,
        reserved: bool,
    ) -> Result<(), WorkerThreadError> {
        let _in_flight = reserved.then(|| InFlight { shared: self });
        let handler = Arc::clone(message.handler());

        if let Err(status) = handler.begin_dispatch() {
            if status == MessageStatus::Canceled {
                Self::retire_locked(&mut self.state.lock(), &handler);
                return Ok(());
            }
            let error = WorkerThreadError::DoubleDispatch(status);
            self.emit_error(format!("Dispatching message failed due to: {error}"));
            return Err(error);
        }

        if self.trace {
            tracing::trace!(worker = %self.name, message_id = handler.message_id(), "dispatching message");
        }

        let Some(task) = message.take_task() else {
            handler.finish(Completion::Cancelled);
            self.emit_error(WorkerThreadError::CallbackNull.to_string());
            return Err(WorkerThreadError::CallbackNull);
        };
        drop(message);

        let completion = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(value) => Completion::Value(value),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                if self.trace {
                    tracing::error!(
                        worker = %self.name,
                        message_id = handler.message_id(),
                        reason = %reason,
                        "task panicked"
                    );
                }
                self.emit_error(reason.clone());
                Completion::Panicked(reason)
            }
        };
        handler.finish(completion);

        let mut state = self.state.lock();
        if state.alive {
            Self::retire_locked(&mut state, &handler);
        } else {
            drop(state);
            handler.on_message_canceled();
        }
        Ok(())
    }

    /// Runs up to `limit` queued messages on the calling thread.
    pub(crate) fn drain(&self, limit: usize) -> usize {
        let mut processed = 0;
        while processed < limit {
            let next = Self::pop_locked(&mut self.state.lock(), true);
            let Ok(message) = next else {
                break;
            };
            let _ = self.call(message, true);
            processed += 1;
        }
        processed
    }

    pub(crate) fn emit_error(&self, reason: String) {
        let _ = self.sig_error_throw.emit(WorkerKey::new(), reason);
    }

    pub(crate) fn emit_run_finished(&self) {
        if self.trace {
            crate::log_worker!(&self.name, "run_finished", id = %self.id);
        }
        let _ = self.sig_on_run_finished.emit(WorkerKey::new(), ());
    }

    pub(crate) fn wake_all(&self) {
        self.work.notify_all();
        self.idle.notify_all();
        self.resume.notify_all();
    }
}

/// Marks a reserved message as finished when dropped.
struct InFlight<'a, R> {
    shared: &'a WorkerShared<R>,
}

impl<R> Drop for InFlight<'_, R> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.shared.idle.notify_all();
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}
