//! # Thread Models
//!
//! Concrete policies for [`ThreadModel`]. A queue or signal picks one of
//! these as a type parameter and gets its locking and thread-affinity
//! behavior from it.
//!
//! | Model | Lock | Thread binding |
//! |-------|------|----------------|
//! | [`SingleThreaded`] | none | constructing thread |
//! | [`SingleThreadedDeferredAccess`] | uncontended mutex | first thread that touches it |
//! | [`MultiThreaded`] | recursive mutex | none |
//!
//! Calling a single-threaded object from a foreign thread is a programming
//! error and panics.
//!
//! A [`SingleThreaded`] container never leaves its thread. A
//! [`SingleThreadedDeferredAccess`] container may be built on one thread and
//! moved to the thread that will own it; its mutex is only there to make the
//! move sound and is never contended while the checker holds.

use std::cell::RefCell;
use std::fmt;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, ReentrantMutex};

pub use courier_api::threading::{ModelLock, ThreadCheck, ThreadModel};

/// No locking and no thread checks beyond the owning-thread assertion.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleThreaded;

/// Like [`SingleThreaded`] but the owning thread is captured on first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleThreadedDeferredAccess;

/// Recursive locking, usable from any thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiThreaded;

impl ThreadModel for SingleThreaded {
    type Lock<T> = NullLock<T>;
    type Checker = ThreadChecker;
    const IS_DEFERRED_ACCESS: bool = false;
    const NAME: &'static str = "SingleThreaded";
}

impl ThreadModel for SingleThreadedDeferredAccess {
    type Lock<T> = AffinityLock<T>;
    type Checker = DeferredThreadChecker;
    const IS_DEFERRED_ACCESS: bool = true;
    const NAME: &'static str = "SingleThreadedDeferredAccess";
}

impl ThreadModel for MultiThreaded {
    type Lock<T> = RecursiveLock<T>;
    type Checker = NullThreadChecker;
    const IS_DEFERRED_ACCESS: bool = false;
    const NAME: &'static str = "MultiThreaded";
}

/// Lock-free cell for single-threaded models.
pub struct NullLock<T>(RefCell<T>);

impl<T> ModelLock<T> for NullLock<T> {
    fn new(value: T) -> Self {
        NullLock(RefCell::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl<T> fmt::Debug for NullLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NullLock")
    }
}

/// Mutex for the deferred-access model.
///
/// Not re-entrant: a nested `with` from inside the closure deadlocks, which
/// the container code never does.
pub struct AffinityLock<T>(Mutex<T>);

impl<T> ModelLock<T> for AffinityLock<T> {
    fn new(value: T) -> Self {
        AffinityLock(Mutex::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl<T> fmt::Debug for AffinityLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AffinityLock")
    }
}

/// Recursive mutex for the multi-threaded model.
///
/// The owning thread may take the lock again while holding it. The
/// `RefCell` still rejects a second mutable borrow, so callers must release
/// the closure before re-entering.
pub struct RecursiveLock<T>(ReentrantMutex<RefCell<T>>);

impl<T> ModelLock<T> for RecursiveLock<T> {
    fn new(value: T) -> Self {
        RecursiveLock(ReentrantMutex::new(RefCell::new(value)))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.0.lock();
        let mut value = guard.borrow_mut();
        f(&mut value)
    }
}

impl<T> fmt::Debug for RecursiveLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecursiveLock")
    }
}

/// Accepts every thread.
#[derive(Debug, Default)]
pub struct NullThreadChecker;

impl ThreadCheck for NullThreadChecker {
    fn check_thread_id(&self) {}

    fn set_thread_id(&self, _id: ThreadId) {}

    fn owner(&self) -> Option<ThreadId> {
        None
    }
}

/// Bound to the thread that constructed it.
#[derive(Debug)]
pub struct ThreadChecker {
    owner: Mutex<ThreadId>,
}

impl Default for ThreadChecker {
    fn default() -> Self {
        Self {
            owner: Mutex::new(thread::current().id()),
        }
    }
}

impl ThreadCheck for ThreadChecker {
    fn check_thread_id(&self) {
        let owner = *self.owner.lock();
        let current = thread::current().id();
        if owner != current {
            panic!(
                "single-threaded object owned by {:?} was accessed from {:?}",
                owner, current
            );
        }
    }

    fn set_thread_id(&self, id: ThreadId) {
        *self.owner.lock() = id;
    }

    fn owner(&self) -> Option<ThreadId> {
        Some(*self.owner.lock())
    }
}

/// Bound to the first thread that calls [`ThreadCheck::check_thread_id`].
#[derive(Debug, Default)]
pub struct DeferredThreadChecker {
    owner: Mutex<Option<ThreadId>>,
}

impl ThreadCheck for DeferredThreadChecker {
    fn check_thread_id(&self) {
        let current = thread::current().id();
        let mut owner = self.owner.lock();
        match *owner {
            None => *owner = Some(current),
            Some(id) if id == current => {}
            Some(id) => {
                // release before unwinding so the checker stays usable
                drop(owner);
                panic!(
                    "single-threaded object owned by {:?} was accessed from {:?}",
                    id, current
                );
            }
        }
    }

    fn set_thread_id(&self, id: ThreadId) {
        *self.owner.lock() = Some(id);
    }

    fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_lock_mutates() {
        let lock = NullLock::new(1);
        lock.with(|v| *v += 1);
        assert_eq!(lock.with(|v| *v), 2);
    }

    #[test]
    fn test_affinity_lock_mutates_across_threads() {
        let lock = std::sync::Arc::new(AffinityLock::new(0));
        let remote = std::sync::Arc::clone(&lock);
        thread::spawn(move || remote.with(|v| *v += 1))
            .join()
            .unwrap();
        assert_eq!(lock.with(|v| *v), 1);
    }

    #[test]
    fn test_recursive_lock_reenters() {
        let lock = RecursiveLock::new(Vec::new());
        let guard = lock.0.lock();
        lock.with(|v| v.push(1));
        drop(guard);
        assert_eq!(lock.with(|v| v.len()), 1);
    }

    #[test]
    fn test_checker_binds_constructing_thread() {
        let checker = ThreadChecker::default();
        checker.check_thread_id();
        assert_eq!(checker.owner(), Some(thread::current().id()));
    }

    #[test]
    fn test_checker_rejects_foreign_thread() {
        let checker = std::sync::Arc::new(ThreadChecker::default());
        let remote = std::sync::Arc::clone(&checker);
        let result = thread::spawn(move || remote.check_thread_id()).join();
        assert!(result.is_err());
    }

    #[test]
    fn test_checker_rebinds() {
        let checker = std::sync::Arc::new(ThreadChecker::default());
        let remote = std::sync::Arc::clone(&checker);
        let result = thread::spawn(move || {
            remote.set_thread_id(thread::current().id());
            remote.check_thread_id();
        })
        .join();
        assert!(result.is_ok());
    }

    #[test]
    fn test_deferred_checker_binds_on_first_use() {
        let checker = std::sync::Arc::new(DeferredThreadChecker::default());
        assert_eq!(checker.owner(), None);

        let remote = std::sync::Arc::clone(&checker);
        thread::spawn(move || remote.check_thread_id())
            .join()
            .unwrap();
        assert!(checker.owner().is_some());

        let result = thread::spawn(move || checker.check_thread_id()).join();
        assert!(result.is_err());
    }
}
