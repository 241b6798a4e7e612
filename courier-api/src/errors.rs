//! # Error Types
//!
//! Three error enums cover the toolkit:
//!
//! - [`MessageQueueError`]: slot registration and broadcast failures
//! - [`WorkerThreadError`]: task submission, mode changes and thread creation
//! - [`MessageHandleError`]: outcomes observed through a task handle
//!
//! Misuse that indicates a programming error (touching a single-threaded
//! object from the wrong thread) is not represented here; it panics instead.
//!
//! ## Usage Example
//!
//! ```rust
//! use courier_api::errors::WorkerThreadError;
//!
//! fn describe(error: &WorkerThreadError) -> &'static str {
//!     match error {
//!         WorkerThreadError::PushExceed { .. } => "queue is full",
//!         WorkerThreadError::EnqueueWhileStopping => "worker is shutting down",
//!         _ => "other worker failure",
//!     }
//! }
//! ```

use thiserror::Error;

use crate::mode::Mode;
use crate::priority::MessageStatus;

/// Failures reported by a slot queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageQueueError {
    /// Asynchronous broadcast requested but the queue has no worker to run it on.
    #[error("no worker thread attached to run the asynchronous broadcast")]
    UpdateCallback,

    /// Registering another slot would exceed the queue capacity.
    #[error("slot capacity of {capacity} exceeded")]
    ExceedCapacity { capacity: usize },

    /// The slot id does not name a registered slot.
    #[error("slot is not registered")]
    CallbackNull,

    /// A broadcast was requested from inside a broadcast on the same queue.
    #[error("broadcast re-entered from one of its own slots")]
    Blocking,
}

/// Failures reported by a worker thread.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerThreadError {
    /// Dispatch needs a caller-driven `update` because no backing thread exists.
    #[error("worker runs in update-callback mode without a backing thread")]
    UpdateCallback,

    /// The pending queue is at its configured maximum.
    #[error("message queue capacity of {capacity} exceeded")]
    PushExceed { capacity: usize },

    /// Mode cannot change while an update-callback backing thread is running.
    #[error("cannot change mode while the update callback thread is running")]
    ChangeModeUpdateCallback,

    /// A task or callback was missing.
    #[error("callback is missing")]
    CallbackNull,

    /// The backing thread could not be started from the supplied runnable.
    #[error("failed to create worker runnable")]
    RunnableCreateFailed,

    /// The operating system refused to spawn a thread.
    #[error("failed to create thread: {0}")]
    CreateThreadFailed(String),

    /// The requested mode equals the current one.
    #[error("worker is already in the requested mode")]
    SamePreviousMode,

    /// A one-shot run or backing thread was already started.
    #[error("worker thread is already created")]
    IsAlreadyCreated,

    /// The operation or transition is not allowed in the given mode.
    #[error("operation is not allowed in {0:?} mode")]
    ThisModeCanNotBeUsed(Mode),

    /// The worker is stopping and refuses new tasks.
    #[error("cannot enqueue a message while the worker is stopping")]
    EnqueueWhileStopping,

    /// The worker was torn down before the task completed.
    #[error("message was canceled")]
    MessageCanceled,

    /// No runnable message is pending.
    #[error("message queue is empty")]
    QueueEmpty,

    /// Dequeuing is suspended by a manual or automatic pause.
    #[error("worker is paused")]
    Paused,

    /// The worker stopped while the caller was waiting for a message.
    #[error("worker has been terminated")]
    Terminated,

    /// A message was handed to `call` when it was not waiting to be dispatched.
    #[error("message cannot be dispatched from status {0:?}")]
    DoubleDispatch(MessageStatus),
}

/// Outcomes reported through a message handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageHandleError {
    /// The handle lost its task, either because submission failed or the worker is gone.
    #[error("message handle is not attached to a live task")]
    InvalidHandler,

    /// The result has already been taken.
    #[error("result has already been retrieved")]
    Void,

    /// The task was canceled before it ran.
    #[error("message was cancelled")]
    Cancelled,

    /// The priority of this message was already changed from this thread.
    #[error("priority has already been set for this message")]
    PriorityAlreadySet,

    /// The priority of this message was already changed from another thread.
    #[error("priority was set from a different thread")]
    PriorityForeignThread,

    /// A bounded wait elapsed before the task finished.
    #[error("timed out waiting for the message")]
    Timeout,

    /// The task panicked; the payload message is preserved.
    #[error("message handler panicked: {0}")]
    Panicked(String),
}
