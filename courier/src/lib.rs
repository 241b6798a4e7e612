// Courier
//
// Thread-model-aware slot queues, key-gated signals, cancellable message
// handles and multi-mode worker threads. Error and scheduling types live in
// the `courier-api` crate and are re-exported here.

pub mod logging;
pub mod queue;
pub mod signal;
pub mod threading;
pub mod worker;

// Re-export commonly used types
pub use courier_api::errors::{MessageHandleError, MessageQueueError, WorkerThreadError};
pub use courier_api::{MessagePriority, MessageStatus, Mode, ThreadExecutionMode, MAX_SIZE, UPDATE_INTERVAL};
pub use queue::{Connection, LocalConnection, MessageQueue, MessageQueueMt, MessageQueueSt, MessageQueueStDa, SlotId};
pub use signal::{access, Emitter, LifeToken, ObjectLifeIndicator, Signal, SignalMt, SignalSt, SignalStDa};
pub use threading::{MultiThreaded, SingleThreaded, SingleThreadedDeferredAccess};
pub use worker::{
    create_scoped_thread, MessageHandle, PackagedMessage, ScopedWorker, WaitStatus, WorkerRunnable,
    WorkerThread, WorkerThreadConfig,
};
