//! # Thread Model Policies
//!
//! A thread model decides two things for every container built on it: how
//! its internal state is locked and whether calls are pinned to one thread.
//!
//! The runtime ships three models:
//!
//! - single-threaded: no locking, every call must come from the constructing thread
//! - single-threaded with deferred access: an uncontended mutex so it can be moved, bound to the first thread that uses it
//! - multi-threaded: a recursive lock, no thread pinning
//!
//! Containers are generic over [`ThreadModel`] and only ever touch their
//! state through [`ModelLock::with`], so swapping the model swaps the
//! synchronization strategy without changing any container code.

use std::thread::ThreadId;

/// Storage wrapper chosen by a thread model.
///
/// `with` grants exclusive access for the duration of the closure. A nested
/// call from inside the closure either panics or deadlocks depending on the
/// model, so implementations must never call back into user code, or drop
/// user values, while the closure runs.
pub trait ModelLock<T> {
    fn new(value: T) -> Self
    where
        Self: Sized;

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

/// Thread-affinity guard.
pub trait ThreadCheck: Default {
    /// Panics when called from a thread other than the bound one.
    fn check_thread_id(&self);

    /// Rebinds the guard to `id`.
    fn set_thread_id(&self, id: ThreadId);

    /// The thread the guard is bound to, if any.
    fn owner(&self) -> Option<ThreadId>;
}

/// A synchronization policy.
pub trait ThreadModel: Send + Sync + 'static {
    type Lock<T>: ModelLock<T>;
    type Checker: ThreadCheck;

    /// Whether the thread binding happens on first use instead of construction.
    const IS_DEFERRED_ACCESS: bool;

    /// Human-readable name used in diagnostics.
    const NAME: &'static str;
}
