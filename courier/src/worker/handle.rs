//! Per-message bookkeeping and the caller-side future.
//!
//! Every queued task is wrapped in a [`HandlerWrapper`] that owns its
//! status, priority and result slot. The caller gets a [`MessageHandle`]
//! that references the wrapper weakly: the worker owns the wrapper while the
//! task is pending, and keeps it in its dispatched cache afterwards only if a
//! handle is still around to read the result.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use courier_api::errors::{MessageHandleError, WorkerThreadError};
use courier_api::{MessagePriority, MessageStatus};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

pub(crate) type Task<R> = Box<dyn FnOnce() -> R + Send + 'static>;
pub(crate) type PriorityCallback = Arc<dyn Fn(usize) + Send + Sync>;
pub(crate) type CleanupCallback<R> = Box<dyn FnOnce(Arc<HandlerWrapper<R>>) + Send + Sync>;
type CancelCallback = Box<dyn FnOnce() + Send>;

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    Timeout,
}

pub(crate) enum Completion<R> {
    Value(R),
    Cancelled,
    Panicked(String),
}

enum PromiseState<R> {
    Pending,
    Ready(Completion<R>),
    Taken,
}

/// One-shot result slot with blocking and async waiters.
struct Promise<R> {
    state: Mutex<PromiseState<R>>,
    ready: Condvar,
    notify: Notify,
}

impl<R> Promise<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(PromiseState::Pending),
            ready: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn fulfill(&self, completion: Completion<R>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, PromiseState::Pending) {
            return false;
        }
        *state = PromiseState::Ready(completion);
        drop(state);
        self.ready.notify_all();
        self.notify.notify_waiters();
        true
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), PromiseState::Pending)
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while matches!(*state, PromiseState::Pending) {
            self.ready.wait(&mut state);
        }
    }

    fn wait_until(&self, deadline: Instant) -> WaitStatus {
        let mut state = self.state.lock();
        while matches!(*state, PromiseState::Pending) {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return match *state {
                    PromiseState::Pending => WaitStatus::Timeout,
                    _ => WaitStatus::Ready,
                };
            }
        }
        WaitStatus::Ready
    }

    async fn wait_async(&self) {
        loop {
            // registered before the check so a concurrent fulfill cannot be missed
            let notified = self.notify.notified();
            if !self.is_pending() {
                return;
            }
            notified.await;
        }
    }

    /// Maps a settled promise to what `wait` reports. A panicked task still
    /// counts as completed; only reading its value fails.
    fn settled(&self) -> Result<(), MessageHandleError> {
        match &*self.state.lock() {
            PromiseState::Ready(Completion::Cancelled) => Err(MessageHandleError::Cancelled),
            _ => Ok(()),
        }
    }

    fn take(&self) -> Option<Completion<R>> {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, PromiseState::Taken) {
            PromiseState::Ready(completion) => Some(completion),
            other => {
                *state = other;
                None
            }
        }
    }
}

/// Status, priority and result slot of one queued task.
pub struct HandlerWrapper<R> {
    message_id: usize,
    status: AtomicU8,
    priority: AtomicU8,
    observed: AtomicBool,
    priority_thread: Mutex<Option<ThreadId>>,
    on_priority_changed: Mutex<Option<PriorityCallback>>,
    on_canceled: Mutex<Option<CancelCallback>>,
    promise: Promise<R>,
}

impl<R> HandlerWrapper<R> {
    pub(crate) fn new(message_id: usize) -> Self {
        Self {
            message_id,
            status: AtomicU8::new(MessageStatus::BeingDispatched as u8),
            priority: AtomicU8::new(MessagePriority::NormalAsync as u8),
            observed: AtomicBool::new(false),
            priority_thread: Mutex::new(None),
            on_priority_changed: Mutex::new(None),
            on_canceled: Mutex::new(None),
            promise: Promise::new(),
        }
    }

    pub fn message_id(&self) -> usize {
        self.message_id
    }

    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn priority(&self) -> MessagePriority {
        MessagePriority::from_u8(self.priority.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn is_cancel(&self) -> bool {
        self.status() == MessageStatus::Canceled
    }

    /// Cancels the task if it has not started.
    ///
    /// Returns `Ok(false)` when the task is already running or done, and
    /// [`MessageHandleError::Cancelled`] when it was canceled before.
    pub fn cancel(&self) -> Result<bool, MessageHandleError> {
        match self.status.compare_exchange(
            MessageStatus::BeingDispatched as u8,
            MessageStatus::Canceled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.on_priority_changed.lock().take();
                self.promise.fulfill(Completion::Cancelled);
                Ok(true)
            }
            Err(actual) if actual == MessageStatus::Canceled as u8 => Err(MessageHandleError::Cancelled),
            Err(_) => Ok(false),
        }
    }

    /// Changes the priority of a task that has not started yet.
    ///
    /// Only the first change is honored. A second attempt fails with
    /// [`MessageHandleError::PriorityAlreadySet`] from the same thread or
    /// [`MessageHandleError::PriorityForeignThread`] from any other.
    pub fn set_priority(&self, priority: MessagePriority) -> Result<(), MessageHandleError> {
        if self.status() != MessageStatus::BeingDispatched {
            return Ok(());
        }

        let current = thread::current().id();
        {
            let mut owner = self.priority_thread.lock();
            match *owner {
                Some(id) if id == current => return Err(MessageHandleError::PriorityAlreadySet),
                Some(_) => return Err(MessageHandleError::PriorityForeignThread),
                None => *owner = Some(current),
            }
        }

        self.priority.store(priority as u8, Ordering::Release);
        if priority.is_urgent() {
            let callback = self.on_priority_changed.lock().clone();
            if let Some(callback) = callback {
                callback(self.message_id);
            }
        }
        Ok(())
    }

    pub(crate) fn register_priority_changed_callback(&self, callback: PriorityCallback) {
        *self.on_priority_changed.lock() = Some(callback);
    }

    pub(crate) fn register_cancel_callback(&self, callback: CancelCallback) {
        *self.on_canceled.lock() = Some(callback);
    }

    /// Tells the attached handle that the worker is gone.
    pub(crate) fn on_message_canceled(&self) {
        let callback = self.on_canceled.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Claims the task for execution.
    pub(crate) fn begin_dispatch(&self) -> Result<(), MessageStatus> {
        self.status
            .compare_exchange(
                MessageStatus::BeingDispatched as u8,
                MessageStatus::Dispatching as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|actual| MessageStatus::from_u8(actual).unwrap_or_default())
    }

    pub(crate) fn finish(&self, completion: Completion<R>) {
        self.on_priority_changed.lock().take();
        self.status
            .store(MessageStatus::Dispatched as u8, Ordering::Release);
        self.promise.fulfill(completion);
    }

    pub(crate) fn is_observed(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    pub(crate) fn set_observed(&self, observed: bool) {
        self.observed.store(observed, Ordering::Release);
    }
}

impl<R> Drop for HandlerWrapper<R> {
    fn drop(&mut self) {
        let _ = self.status.compare_exchange(
            MessageStatus::BeingDispatched as u8,
            MessageStatus::Canceled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.on_message_canceled();
    }
}

impl<R> fmt::Debug for HandlerWrapper<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerWrapper")
            .field("message_id", &self.message_id)
            .field("status", &self.status())
            .field("priority", &self.priority())
            .finish()
    }
}

/// A queued task together with its wrapper, as handed out by `pop`.
///
/// Dropping a message that never ran cancels it, so no waiter is left
/// blocked on a task that will not execute.
pub struct PackagedMessage<R> {
    handler: Arc<HandlerWrapper<R>>,
    task: Option<Task<R>>,
    on_abandon: Option<AbandonHook<R>>,
}

/// Runs when a message handed out by `pop` is dropped without being called.
pub(crate) type AbandonHook<R> = Box<dyn FnOnce(&Arc<HandlerWrapper<R>>) + Send>;

impl<R> PackagedMessage<R> {
    pub(crate) fn new(handler: Arc<HandlerWrapper<R>>, task: Task<R>) -> Self {
        Self {
            handler,
            task: Some(task),
            on_abandon: None,
        }
    }

    pub(crate) fn set_abandon_hook(&mut self, hook: AbandonHook<R>) {
        self.on_abandon = Some(hook);
    }

    pub fn message_id(&self) -> usize {
        self.handler.message_id()
    }

    pub fn status(&self) -> MessageStatus {
        self.handler.status()
    }

    pub fn priority(&self) -> MessagePriority {
        self.handler.priority()
    }

    pub fn is_canceled(&self) -> bool {
        self.handler.is_cancel()
    }

    pub(crate) fn handler(&self) -> &Arc<HandlerWrapper<R>> {
        &self.handler
    }

    pub(crate) fn take_task(&mut self) -> Option<Task<R>> {
        self.task.take()
    }
}

impl<R> Drop for PackagedMessage<R> {
    fn drop(&mut self) {
        if self.task.is_none() {
            return;
        }
        let canceled = matches!(self.handler.cancel(), Ok(true));
        if let Some(hook) = self.on_abandon.take() {
            if canceled {
                hook(&self.handler);
            }
        }
    }
}

impl<R> fmt::Debug for PackagedMessage<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackagedMessage")
            .field("handler", &self.handler)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct HandleLink {
    detached: AtomicBool,
}

impl HandleLink {
    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// Caller-side view of a submitted task.
///
/// A handle created from a failed submission carries the submission error
/// and reports [`MessageHandleError::InvalidHandler`] from every wait. The
/// same happens once the owning worker is torn down.
pub struct MessageHandle<R> {
    handler: Weak<HandlerWrapper<R>>,
    message_id: Option<usize>,
    error: Option<WorkerThreadError>,
    link: Arc<HandleLink>,
    cleanup: Option<CleanupCallback<R>>,
}

impl<R> MessageHandle<R> {
    pub(crate) fn new(handler: &Arc<HandlerWrapper<R>>, cleanup: CleanupCallback<R>) -> Self {
        let link = Arc::new(HandleLink::default());
        let detached = Arc::clone(&link);
        handler.register_cancel_callback(Box::new(move || detached.detach()));
        handler.set_observed(true);

        Self {
            handler: Arc::downgrade(handler),
            message_id: Some(handler.message_id()),
            error: None,
            link,
            cleanup: Some(cleanup),
        }
    }

    pub(crate) fn from_error(error: WorkerThreadError) -> Self {
        let link = Arc::new(HandleLink::default());
        link.detach();
        Self {
            handler: Weak::new(),
            message_id: None,
            error: Some(error),
            link,
            cleanup: None,
        }
    }

    fn attached(&self) -> Result<Arc<HandlerWrapper<R>>, MessageHandleError> {
        if self.link.is_detached() {
            return Err(MessageHandleError::InvalidHandler);
        }
        self.handler
            .upgrade()
            .ok_or(MessageHandleError::InvalidHandler)
    }

    fn live(&self) -> Result<Arc<HandlerWrapper<R>>, MessageHandleError> {
        let handler = self.attached()?;
        if handler.is_cancel() {
            return Err(MessageHandleError::Cancelled);
        }
        Ok(handler)
    }

    /// Blocks until the task finished.
    pub fn wait(&self) -> Result<(), MessageHandleError> {
        let handler = self.live()?;
        handler.promise.wait();
        handler.promise.settled()
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<WaitStatus, MessageHandleError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => self.wait().map(|_| WaitStatus::Ready),
        }
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<WaitStatus, MessageHandleError> {
        let handler = self.live()?;
        match handler.promise.wait_until(deadline) {
            WaitStatus::Timeout => Ok(WaitStatus::Timeout),
            WaitStatus::Ready => handler.promise.settled().map(|_| WaitStatus::Ready),
        }
    }

    /// Awaits completion without blocking the executor thread.
    pub async fn wait_async(&self) -> Result<(), MessageHandleError> {
        let handler = self.live()?;
        handler.promise.wait_async().await;
        handler.promise.settled()
    }

    /// Blocks until the task finished and moves its value out.
    ///
    /// A second call returns [`MessageHandleError::Void`].
    pub fn get_result(&self) -> Result<R, MessageHandleError> {
        let handler = self.live()?;
        handler.promise.wait();
        match handler.promise.take() {
            Some(Completion::Value(value)) => Ok(value),
            Some(Completion::Cancelled) => Err(MessageHandleError::Cancelled),
            Some(Completion::Panicked(message)) => Err(MessageHandleError::Panicked(message)),
            None => Err(MessageHandleError::Void),
        }
    }

    /// See [`HandlerWrapper::cancel`].
    pub fn cancel(&self) -> Result<bool, MessageHandleError> {
        self.live()?.cancel()
    }

    /// See [`HandlerWrapper::set_priority`].
    pub fn set_priority(&self, priority: MessagePriority) -> Result<(), MessageHandleError> {
        self.live()?.set_priority(priority)
    }

    pub fn status(&self) -> Option<MessageStatus> {
        self.attached().ok().map(|handler| handler.status())
    }

    pub fn priority(&self) -> Option<MessagePriority> {
        self.attached().ok().map(|handler| handler.priority())
    }

    pub fn message_id(&self) -> Option<usize> {
        self.message_id
    }

    pub fn is_valid(&self) -> bool {
        self.attached().is_ok()
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn is_success(&self) -> bool {
        !self.is_error()
    }

    /// The submission error, or [`WorkerThreadError::MessageCanceled`] once
    /// the worker has dropped the task.
    pub fn error(&self) -> Option<WorkerThreadError> {
        match &self.error {
            Some(error) => Some(error.clone()),
            None if self.link.is_detached() => Some(WorkerThreadError::MessageCanceled),
            None => None,
        }
    }
}

impl<R> Drop for MessageHandle<R> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if let Some(handler) = self.handler.upgrade() {
                cleanup(handler);
            }
        }
    }
}

impl<R> fmt::Debug for MessageHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandle")
            .field("message_id", &self.message_id)
            .field("status", &self.status())
            .field("error", &self.error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_handle(handler: &Arc<HandlerWrapper<u32>>) -> MessageHandle<u32> {
        MessageHandle::new(handler, Box::new(|_: Arc<HandlerWrapper<u32>>| {}))
    }

    #[test]
    fn test_cancel_before_start() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        let handle = detached_handle(&handler);

        assert_eq!(handle.cancel(), Ok(true));
        assert_eq!(handle.wait(), Err(MessageHandleError::Cancelled));
        assert_eq!(handler.cancel(), Err(MessageHandleError::Cancelled));
    }

    #[test]
    fn test_cancel_after_start_is_refused() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        handler.begin_dispatch().unwrap();
        assert_eq!(handler.cancel(), Ok(false));
        assert_eq!(handler.status(), MessageStatus::Dispatching);
    }

    #[test]
    fn test_result_is_taken_once() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        let handle = detached_handle(&handler);
        handler.begin_dispatch().unwrap();
        handler.finish(Completion::Value(7));

        assert_eq!(handle.get_result(), Ok(7));
        assert_eq!(handle.get_result(), Err(MessageHandleError::Void));
        assert_eq!(handle.status(), Some(MessageStatus::Dispatched));
    }

    #[test]
    fn test_wait_for_times_out() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        let handle = detached_handle(&handler);
        assert_eq!(
            handle.wait_for(Duration::from_millis(10)),
            Ok(WaitStatus::Timeout)
        );
    }

    #[test]
    fn test_priority_set_once_per_message() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        assert_eq!(handler.set_priority(MessagePriority::Asap), Ok(()));
        assert_eq!(handler.priority(), MessagePriority::Asap);
        assert_eq!(
            handler.set_priority(MessagePriority::Immediately),
            Err(MessageHandleError::PriorityAlreadySet)
        );

        let remote = Arc::clone(&handler);
        let result = thread::spawn(move || remote.set_priority(MessagePriority::Immediately))
            .join()
            .unwrap();
        assert_eq!(result, Err(MessageHandleError::PriorityForeignThread));
    }

    #[test]
    fn test_priority_callback_only_for_urgent() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let normal = HandlerWrapper::<u32>::new(1);
        let sink = Arc::clone(&counter);
        normal.register_priority_changed_callback(Arc::new(move |_: usize| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        normal.set_priority(MessagePriority::NormalAsync).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let urgent = HandlerWrapper::<u32>::new(2);
        urgent.register_priority_changed_callback(Arc::new(move |id: usize| {
            assert_eq!(id, 2);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        urgent.set_priority(MessagePriority::Immediately).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_priority_ignored_once_started() {
        let handler = HandlerWrapper::<u32>::new(0);
        handler.begin_dispatch().unwrap();
        assert_eq!(handler.set_priority(MessagePriority::Immediately), Ok(()));
        assert_eq!(handler.priority(), MessagePriority::NormalAsync);
    }

    #[test]
    fn test_dropping_wrapper_invalidates_handle() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        let handle = detached_handle(&handler);
        drop(handler);

        assert!(!handle.is_valid());
        assert_eq!(handle.wait(), Err(MessageHandleError::InvalidHandler));
        assert_eq!(handle.error(), Some(WorkerThreadError::MessageCanceled));
    }

    #[test]
    fn test_error_handle() {
        let handle = MessageHandle::<u32>::from_error(WorkerThreadError::PushExceed { capacity: 1 });
        assert!(handle.is_error());
        assert_eq!(handle.message_id(), None);
        assert_eq!(handle.get_result(), Err(MessageHandleError::InvalidHandler));
    }

    #[test]
    fn test_dropping_unrun_message_cancels() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        let message = PackagedMessage::new(Arc::clone(&handler), Box::new(|| 1));
        drop(message);
        assert!(handler.is_cancel());
    }

    #[tokio::test]
    async fn test_wait_async_wakes_on_finish() {
        let handler = Arc::new(HandlerWrapper::<u32>::new(0));
        let handle = detached_handle(&handler);

        let remote = Arc::clone(&handler);
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.begin_dispatch().unwrap();
            remote.finish(Completion::Value(3));
        });

        handle.wait_async().await.unwrap();
        finisher.join().unwrap();
        assert_eq!(handle.get_result(), Ok(3));
    }
}
