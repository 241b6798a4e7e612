//! # Message Queue
//!
//! An ordered, capacity-bounded registry of callbacks ("slots") that can be
//! broadcast to synchronously, or asynchronously on an attached
//! [`WorkerThread`].
//!
//! Two kinds of slots share the table:
//!
//! - message slots receive every broadcast unless they are locked
//! - destroy-handler slots are never broadcast to; they run once when the
//!   queue is torn down, receiving the last broadcast arguments
//!
//! The thread model `M` decides how the table is locked. Broadcasts take a
//! snapshot of the eligible callbacks and invoke them with the lock
//! released, so slots may connect or disconnect while a broadcast runs. A
//! slot that broadcasts on its own queue gets [`MessageQueueError::Blocking`]
//! instead of recursing.
//!
//! ## Example
//!
//! ```rust
//! use courier::queue::MessageQueueSt;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let queue: MessageQueueSt<u32> = MessageQueueSt::new(8);
//! let total = Arc::new(AtomicUsize::new(0));
//! let sink = Arc::clone(&total);
//! queue.add_slot(move |value: &u32| {
//!     sink.fetch_add(*value as usize, Ordering::SeqCst);
//! }).unwrap();
//!
//! assert_eq!(queue.dispatch(5).unwrap(), 1);
//! assert_eq!(total.load(Ordering::SeqCst), 5);
//! ```

mod connection;
mod slot;

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use courier_api::errors::{MessageQueueError, WorkerThreadError};
use courier_api::MAX_SIZE;

use crate::threading::{ModelLock, MultiThreaded, SingleThreaded, SingleThreadedDeferredAccess, ThreadCheck, ThreadModel};
use crate::worker::{MessageHandle, WorkerThread};

pub use connection::{Connection, LocalConnection};
pub use slot::{Callback, DestroyHandler, SlotId};

pub(crate) use slot::{SlotCallback, SlotTable};

pub type MessageQueueSt<A> = MessageQueue<SingleThreaded, A>;
pub type MessageQueueStDa<A> = MessageQueue<SingleThreadedDeferredAccess, A>;
pub type MessageQueueMt<A> = MessageQueue<MultiThreaded, A>;

/// Slot table plus its thread guard. Connections hold this weakly.
pub(crate) struct QueueCore<M: ThreadModel, A: 'static> {
    table: M::Lock<SlotTable<A>>,
    checker: M::Checker,
}

impl<M: ThreadModel, A: 'static> QueueCore<M, A> {
    fn new(max_slots: usize) -> Self {
        Self {
            table: ModelLock::new(SlotTable::new(max_slots)),
            checker: M::Checker::default(),
        }
    }

    pub(crate) fn insert(&self, callback: SlotCallback<A>) -> Result<SlotId, MessageQueueError> {
        self.checker.check_thread_id();
        self.table.with(|table| {
            let capacity = table.capacity();
            table
                .insert(callback)
                .ok_or(MessageQueueError::ExceedCapacity { capacity })
        })
    }

    pub(crate) fn remove(&self, id: SlotId) -> Result<(), MessageQueueError> {
        self.checker.check_thread_id();
        // the slot is dropped after the table is released
        let removed = self.table.with(|table| table.remove(id));
        match removed {
            Some(_) => {
                crate::log_queue!("slot_removed", slot = %id);
                Ok(())
            }
            None => Err(MessageQueueError::CallbackNull),
        }
    }

    pub(crate) fn set_locked(&self, id: SlotId, locked: bool) -> Result<(), MessageQueueError> {
        self.checker.check_thread_id();
        self.table.with(|table| match table.get_mut(id) {
            Some(slot) => {
                slot.locked = locked;
                Ok(())
            }
            None => Err(MessageQueueError::CallbackNull),
        })
    }

    pub(crate) fn is_locked(&self, id: SlotId) -> Option<bool> {
        self.checker.check_thread_id();
        self.table.with(|table| table.get_mut(id).map(|slot| slot.locked))
    }

    pub(crate) fn contains(&self, id: SlotId) -> bool {
        self.checker.check_thread_id();
        self.table.with(|table| table.contains(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.table.with(|table| table.len())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.table.with(|table| table.capacity())
    }

    pub(crate) fn message_slot_count(&self) -> usize {
        self.table.with(|table| table.message_slot_count())
    }

    /// Invokes up to `max` unlocked message slots in registration order.
    pub(crate) fn broadcast(&self, args: &A, max: usize) -> Result<usize, MessageQueueError>
    where
        A: Clone,
    {
        self.checker.check_thread_id();
        let current = thread::current().id();
        let (callbacks, previous) = self.table.with(|table| {
            if table.dispatching.contains(&current) {
                return Err(MessageQueueError::Blocking);
            }
            let previous = table.last_args.replace(args.clone());
            table.dispatching.push(current);
            Ok((table.message_callbacks(max), previous))
        })?;
        drop(previous);

        let _guard = DispatchGuard {
            core: self,
            thread: current,
        };
        for callback in &callbacks {
            callback(args);
        }
        Ok(callbacks.len())
    }

    /// Removes a destroy-handler slot, handing it back with the last broadcast arguments.
    pub(crate) fn take_destroy_handler(&self, id: SlotId) -> Option<(DestroyHandler<A>, Option<A>)>
    where
        A: Clone,
    {
        self.checker.check_thread_id();
        // as in `remove`, a dropped slot is released outside the table
        let (removed, last_args) = self.table.with(|table| (table.remove(id), table.last_args.clone()));
        match removed?.callback {
            SlotCallback::DestroyHandler(handler) => Some((handler, last_args)),
            SlotCallback::Message(_) => None,
        }
    }

    /// Runs every destroy handler once, then releases all slots.
    pub(crate) fn close(&self) {
        let (handlers, last_args) = self
            .table
            .with(|table| (table.destroy_handlers(), table.last_args.take()));
        for handler in &handlers {
            handler(last_args.as_ref());
        }
        let released = self.table.with(|table| table.clear());
        drop(released);
    }

    pub(crate) fn set_thread_id(&self, id: ThreadId) {
        self.checker.set_thread_id(id);
    }
}

struct DispatchGuard<'a, M: ThreadModel, A: 'static> {
    core: &'a QueueCore<M, A>,
    thread: ThreadId,
}

impl<M: ThreadModel, A: 'static> Drop for DispatchGuard<'_, M, A> {
    fn drop(&mut self) {
        self.core.table.with(|table| {
            if let Some(pos) = table.dispatching.iter().position(|id| *id == self.thread) {
                table.dispatching.swap_remove(pos);
            }
        });
    }
}

/// Ordered slot registry with optional asynchronous broadcast.
pub struct MessageQueue<M: ThreadModel, A: 'static> {
    core: Arc<QueueCore<M, A>>,
    worker: Option<Arc<WorkerThread<()>>>,
}

impl<M: ThreadModel, A: 'static> MessageQueue<M, A> {
    /// Creates a queue that accepts at most `max_slots` slots of either kind.
    pub fn new(max_slots: usize) -> Self {
        Self {
            core: Arc::new(QueueCore::new(max_slots)),
            worker: None,
        }
    }

    pub fn add_slot<F>(&self, callback: F) -> Result<SlotId, MessageQueueError>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = self.core.insert(SlotCallback::Message(Arc::new(callback)))?;
        crate::log_queue!("slot_added", slot = %id);
        Ok(id)
    }

    /// Registers a callback that runs once when the queue is torn down.
    pub fn add_destroy_handler<F>(&self, handler: F) -> Result<SlotId, MessageQueueError>
    where
        F: Fn(Option<&A>) + Send + Sync + 'static,
    {
        self.core
            .insert(SlotCallback::DestroyHandler(Arc::new(handler)))
    }

    /// Removes a slot. Fails with [`MessageQueueError::CallbackNull`] for unknown or stale ids.
    pub fn disconnect_slot(&self, id: SlotId) -> Result<(), MessageQueueError> {
        self.core.remove(id)
    }

    /// Locked slots stay registered but are skipped by broadcasts.
    pub fn lock_slot(&self, id: SlotId, locked: bool) -> Result<(), MessageQueueError> {
        self.core.set_locked(id, locked)
    }

    pub fn is_slot_locked(&self, id: SlotId) -> Option<bool> {
        self.core.is_locked(id)
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.core.contains(id)
    }

    /// Number of registered slots, destroy handlers included.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    /// Whether any slot would receive a broadcast if it were unlocked.
    pub fn has_slots(&self) -> bool {
        self.core.message_slot_count() > 0
    }

    pub fn slot_count(&self) -> usize {
        self.core.message_slot_count()
    }

    /// Rebinds a single-threaded queue to another thread. No-op for the
    /// multi-threaded model.
    pub fn set_thread_id(&self, id: ThreadId) {
        self.core.set_thread_id(id);
    }

    pub fn worker(&self) -> Option<&Arc<WorkerThread<()>>> {
        self.worker.as_ref()
    }

    pub(crate) fn close(&self) {
        self.core.close();
    }
}

impl<M: ThreadModel, A: Clone + 'static> MessageQueue<M, A> {
    /// Broadcasts `args` to every unlocked message slot on the calling
    /// thread. Returns the number of slots invoked.
    pub fn dispatch(&self, args: A) -> Result<usize, MessageQueueError> {
        self.core.broadcast(&args, usize::MAX)
    }

    /// Like [`dispatch`](Self::dispatch) but stops after `max` slots.
    pub fn dispatch_limited(&self, max: usize, args: A) -> Result<usize, MessageQueueError> {
        self.core.broadcast(&args, max)
    }
}

impl<A: Clone + 'static> MessageQueue<SingleThreaded, A> {
    /// Registers a message slot and returns a handle that disconnects it when dropped.
    pub fn connect<F>(&self, callback: F) -> Result<LocalConnection, MessageQueueError>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        LocalConnection::connect(&self.core, Arc::new(callback))
    }
}

impl<A: Clone + Send + 'static> MessageQueue<SingleThreadedDeferredAccess, A> {
    /// Registers a message slot and returns a handle that disconnects it when dropped.
    ///
    /// The handle may travel with the queue, but disconnecting it from a
    /// thread other than the bound one panics like any other foreign access.
    pub fn connect<F>(&self, callback: F) -> Result<Connection, MessageQueueError>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        Connection::connect(&self.core, Arc::new(callback))
    }
}

impl<A: Clone + Send + 'static> MessageQueue<MultiThreaded, A> {
    /// Registers a message slot and returns a handle that disconnects it when
    /// dropped, from any thread.
    pub fn connect<F>(&self, callback: F) -> Result<Connection, MessageQueueError>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        Connection::connect(&self.core, Arc::new(callback))
    }

    /// Creates a queue whose asynchronous broadcasts run on `worker`.
    pub fn with_worker(max_slots: usize, worker: Arc<WorkerThread<()>>) -> Self {
        Self {
            core: Arc::new(QueueCore::new(max_slots)),
            worker: Some(worker),
        }
    }

    pub fn set_worker(&mut self, worker: Option<Arc<WorkerThread<()>>>) {
        self.worker = worker;
    }

    /// Schedules a broadcast of `args` on the attached worker.
    ///
    /// The returned handle completes once every slot has run. Without a
    /// worker this fails with [`MessageQueueError::UpdateCallback`].
    pub fn dispatch_async(&self, args: A) -> Result<MessageHandle<()>, MessageQueueError> {
        self.dispatch_async_if(args, || true)
    }

    /// Schedules a broadcast that only happens if `alive` still holds when the worker picks it up.
    pub(crate) fn dispatch_async_if<F>(&self, args: A, alive: F) -> Result<MessageHandle<()>, MessageQueueError>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let worker = self.worker.as_ref().ok_or(MessageQueueError::UpdateCallback)?;
        let core = Arc::clone(&self.core);
        let handle = worker.push_callback(move || {
            if !alive() {
                return;
            }
            if let Err(error) = core.broadcast(&args, usize::MAX) {
                tracing::warn!(component = "queue", error = %error, "asynchronous broadcast failed");
            }
        });
        if let Some(error) = handle.error() {
            return Err(queue_error(error));
        }
        match worker.dispatch() {
            // an update-callback worker runs it on the owner's next update
            Ok(()) | Err(WorkerThreadError::UpdateCallback) => Ok(handle),
            Err(error) => Err(queue_error(error)),
        }
    }
}

fn queue_error(error: WorkerThreadError) -> MessageQueueError {
    match error {
        WorkerThreadError::PushExceed { capacity } => MessageQueueError::ExceedCapacity { capacity },
        _ => MessageQueueError::UpdateCallback,
    }
}

impl<M: ThreadModel, A: 'static> Default for MessageQueue<M, A> {
    fn default() -> Self {
        Self::new(MAX_SIZE)
    }
}

impl<M: ThreadModel, A: 'static> Drop for MessageQueue<M, A> {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<M: ThreadModel, A: 'static> fmt::Debug for MessageQueue<M, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("model", &M::NAME)
            .field("slots", &self.core.len())
            .field("capacity", &self.core.capacity())
            .field("has_worker", &self.worker.is_some())
            .finish()
    }
}
