//! # Courier API
//!
//! Shared vocabulary for the courier toolkit: the error taxonomies returned by
//! slot queues, worker threads and message handles, the scheduling enums that
//! describe how a worker runs its tasks, and the thread-model traits that let
//! a queue choose between lock-free single-threaded storage and recursive
//! locking.
//!
//! The implementation lives in the `courier` crate. Everything here is plain
//! data or trait declarations so that downstream code can name errors and
//! modes without pulling in the runtime.
//!
//! ## Module Organization
//!
//! - [`errors`]: Error enums for queues, workers and handles
//! - [`mode`]: Worker run modes and thread ownership policies
//! - [`priority`]: Message priority and lifecycle status
//! - [`threading`]: Thread-model policy traits

use std::time::Duration;

pub mod errors;
pub mod mode;
pub mod priority;
pub mod threading;

pub use errors::{MessageHandleError, MessageQueueError, WorkerThreadError};
pub use mode::{Mode, ThreadExecutionMode};
pub use priority::{MessagePriority, MessageStatus};
pub use threading::{ModelLock, ThreadCheck, ThreadModel};

/// Upper bound on both slot counts and worker queue lengths.
pub const MAX_SIZE: usize = i16::MAX as usize;

/// Default sleep between two `update` ticks of a worker backing thread.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(1);
