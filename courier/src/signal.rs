//! # Signals
//!
//! A [`Signal`] is a [`MessageQueue`] whose emission is gated by a key type.
//! Anyone can connect to a signal, but only code that can construct the key
//! can emit it. Keys are usually declared with [`signal_key!`](crate::signal_key),
//! which gives them a constructor private to the declaring module.
//!
//! A signal can also be tied to an [`ObjectLifeIndicator`]. Once that
//! indicator reports its owner dead, emission silently does nothing,
//! including asynchronous emissions already queued on a worker.
//!
//! ```rust
//! use courier::signal::SignalSt;
//! use courier::signal_key;
//!
//! signal_key!(ButtonKey);
//!
//! struct Button {
//!     clicked: SignalSt<u32, ButtonKey>,
//! }
//!
//! let button = Button { clicked: SignalSt::new() };
//! let _conn = button.clicked.connect(|count| println!("clicked {count} times")).unwrap();
//! assert_eq!(button.clicked.emit(ButtonKey::new(), 1).unwrap(), 1);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use courier_api::errors::MessageQueueError;
use courier_api::MAX_SIZE;

use crate::queue::{Connection, LocalConnection, MessageQueue};
use crate::threading::{MultiThreaded, SingleThreaded, SingleThreadedDeferredAccess, ThreadModel};
use crate::worker::{MessageHandle, WorkerThread};

pub type SignalSt<A, K> = Signal<SingleThreaded, A, K>;
pub type SignalStDa<A, K> = Signal<SingleThreadedDeferredAccess, A, K>;
pub type SignalMt<A, K> = Signal<MultiThreaded, A, K>;

/// Declares a zero-sized signal key whose constructor is private to the
/// declaring module.
///
/// ```rust
/// mod door {
///     courier::signal_key!(pub OpenKey);
///
///     pub fn open_key() -> OpenKey {
///         OpenKey::new()
///     }
/// }
///
/// let _key = door::open_key();
/// ```
#[macro_export]
macro_rules! signal_key {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name(());

        impl $name {
            #[allow(dead_code)]
            fn new() -> Self {
                $name(())
            }
        }
    };
}

/// Shared liveness flag. The owner holds the indicator, observers hold
/// [`LifeToken`]s.
#[derive(Debug)]
pub struct ObjectLifeIndicator {
    alive: Arc<AtomicBool>,
}

impl ObjectLifeIndicator {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_object_still_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn token(&self) -> LifeToken {
        LifeToken {
            alive: Arc::clone(&self.alive),
        }
    }

    /// Marks the owner dead ahead of drop.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl Default for ObjectLifeIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ObjectLifeIndicator {
    fn drop(&mut self) {
        self.mark_dead();
    }
}

#[derive(Debug, Clone)]
pub struct LifeToken {
    alive: Arc<AtomicBool>,
}

impl LifeToken {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// A capability-gated broadcast point.
///
/// `K` is the key type that must be presented to emit. `A` is the argument
/// type handed to every connected callback.
pub struct Signal<M: ThreadModel, A: 'static, K> {
    queue: MessageQueue<M, A>,
    life: ObjectLifeIndicator,
    owner: Option<LifeToken>,
    _key: PhantomData<fn(K)>,
}

impl<M: ThreadModel, A: 'static, K> Signal<M, A, K> {
    pub fn new() -> Self {
        Self::from_queue(MessageQueue::new(MAX_SIZE), None)
    }

    /// A signal that stops emitting once `owner` is dropped or marked dead.
    pub fn with_owner(owner: &ObjectLifeIndicator) -> Self {
        Self::from_queue(MessageQueue::new(MAX_SIZE), Some(owner.token()))
    }

    pub fn with_capacity(max_slots: usize) -> Self {
        Self::from_queue(MessageQueue::new(max_slots), None)
    }

    fn from_queue(queue: MessageQueue<M, A>, owner: Option<LifeToken>) -> Self {
        Self {
            queue,
            life: ObjectLifeIndicator::new(),
            owner,
            _key: PhantomData,
        }
    }

    pub fn is_owner_alive(&self) -> bool {
        self.life.is_object_still_alive() && self.owner.as_ref().is_none_or(LifeToken::is_alive)
    }

    pub fn slot_count(&self) -> usize {
        self.queue.slot_count()
    }

    pub fn has_slots(&self) -> bool {
        self.queue.has_slots()
    }

    pub fn set_thread_id(&self, id: ThreadId) {
        self.queue.set_thread_id(id);
    }

    /// Runs destroy handlers and releases every slot. Later emissions reach nobody.
    pub(crate) fn close(&self) {
        self.life.mark_dead();
        self.queue.close();
    }
}

impl<A: Clone + 'static, K> Signal<SingleThreaded, A, K> {
    pub fn connect<F>(&self, callback: F) -> Result<LocalConnection, MessageQueueError>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.queue.connect(callback)
    }
}

impl<A: Clone + Send + 'static, K> Signal<SingleThreadedDeferredAccess, A, K> {
    pub fn connect<F>(&self, callback: F) -> Result<Connection, MessageQueueError>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.queue.connect(callback)
    }
}

impl<A: Clone + Send + 'static, K> Signal<MultiThreaded, A, K> {
    pub fn connect<F>(&self, callback: F) -> Result<Connection, MessageQueueError>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.queue.connect(callback)
    }
}

impl<M: ThreadModel, A: Clone + 'static, K> Signal<M, A, K> {
    /// Broadcasts synchronously. Returns `Ok(0)` without invoking anything
    /// once the owner is dead.
    pub fn emit(&self, _key: K, args: A) -> Result<usize, MessageQueueError> {
        if !self.is_owner_alive() {
            return Ok(0);
        }
        self.queue.dispatch(args)
    }

    /// Binds a key to the signal so it can be emitted repeatedly.
    pub fn access(&self, key: K) -> Emitter<'_, M, A, K> {
        Emitter { signal: self, key }
    }
}

impl<A: Clone + Send + 'static, K> Signal<MultiThreaded, A, K> {
    /// A signal that can also emit asynchronously on `worker`.
    pub fn with_worker(worker: Arc<WorkerThread<()>>) -> Self {
        Self::from_queue(MessageQueue::with_worker(MAX_SIZE, worker), None)
    }

    pub fn with_owner_and_worker(owner: &ObjectLifeIndicator, worker: Arc<WorkerThread<()>>) -> Self {
        Self::from_queue(MessageQueue::with_worker(MAX_SIZE, worker), Some(owner.token()))
    }

    /// Queues a broadcast on the attached worker.
    ///
    /// Returns `Ok(None)` when the owner is already dead. Liveness is checked
    /// again when the worker runs the broadcast.
    pub fn emit_async(&self, _key: K, args: A) -> Result<Option<MessageHandle<()>>, MessageQueueError> {
        if !self.is_owner_alive() {
            return Ok(None);
        }
        let own = self.life.token();
        let owner = self.owner.clone();
        self.queue
            .dispatch_async_if(args, move || {
                own.is_alive() && owner.as_ref().is_none_or(LifeToken::is_alive)
            })
            .map(Some)
    }
}

impl<M: ThreadModel, A: 'static, K> Default for Signal<M, A, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ThreadModel, A: 'static, K> fmt::Debug for Signal<M, A, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("queue", &self.queue)
            .field("owner_alive", &self.is_owner_alive())
            .finish()
    }
}

/// A signal paired with the key that unlocks it.
pub struct Emitter<'a, M: ThreadModel, A: 'static, K> {
    signal: &'a Signal<M, A, K>,
    key: K,
}

impl<M: ThreadModel, A: Clone + 'static, K: Clone> Emitter<'_, M, A, K> {
    pub fn emit(&self, args: A) -> Result<usize, MessageQueueError> {
        self.signal.emit(self.key.clone(), args)
    }
}

impl<A: Clone + Send + 'static, K: Clone> Emitter<'_, MultiThreaded, A, K> {
    pub fn emit_async(&self, args: A) -> Result<Option<MessageHandle<()>>, MessageQueueError> {
        self.signal.emit_async(self.key.clone(), args)
    }
}

/// Free-function form of [`Signal::access`].
pub fn access<M: ThreadModel, A: Clone + 'static, K>(key: K, signal: &Signal<M, A, K>) -> Emitter<'_, M, A, K> {
    signal.access(key)
}
