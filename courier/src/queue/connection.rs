//! Type-erased handle to a registered slot.

use std::fmt;
use std::sync::{Arc, Weak};

use courier_api::errors::MessageQueueError;
use parking_lot::Mutex;

use super::slot::{Callback, DestroyHandler, SlotCallback, SlotId};
use super::QueueCore;
use crate::threading::ThreadModel;

trait ConnectionImpl {
    fn disconnect(&self);
    fn set_locked(&self, locked: bool) -> Result<(), MessageQueueError>;
    fn is_valid(&self) -> bool;
    fn has_connected_slots(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct ConnectionIds {
    slot: SlotId,
    destroy_handler: SlotId,
}

pub(crate) struct QueueConnection<M: ThreadModel, A: Clone + 'static> {
    queue: Weak<QueueCore<M, A>>,
    ids: Arc<Mutex<Option<ConnectionIds>>>,
}

impl<M: ThreadModel, A: Clone + 'static> QueueConnection<M, A> {
    /// Registers `callback` plus the destroy handler that clears the ids on teardown.
    fn register(queue: &Arc<QueueCore<M, A>>, callback: Callback<A>) -> Result<Self, MessageQueueError> {
        let slot = queue.insert(SlotCallback::Message(callback))?;

        let ids: Arc<Mutex<Option<ConnectionIds>>> = Arc::new(Mutex::new(None));
        let cleared = Arc::downgrade(&ids);
        let handler: DestroyHandler<A> = Arc::new(move |_: Option<&A>| {
            if let Some(ids) = cleared.upgrade() {
                ids.lock().take();
            }
        });

        let destroy_handler = match queue.insert(SlotCallback::DestroyHandler(handler)) {
            Ok(id) => id,
            Err(error) => {
                let _ = queue.remove(slot);
                return Err(error);
            }
        };
        *ids.lock() = Some(ConnectionIds {
            slot,
            destroy_handler,
        });

        Ok(Self {
            queue: Arc::downgrade(queue),
            ids,
        })
    }
}

macro_rules! connection_handle {
    ($(#[$meta:meta])* $name:ident, $erased:ty) => {
        $(#[$meta])*
        #[must_use = "dropping a connection disconnects its slot"]
        #[derive(Default)]
        pub struct $name {
            inner: Option<Box<$erased>>,
        }

        impl $name {
            /// Removes the slot from its queue. Safe to call repeatedly.
            pub fn disconnect(&mut self) {
                if let Some(inner) = self.inner.take() {
                    inner.disconnect();
                }
            }

            /// Stops broadcasts from reaching the slot without removing it.
            pub fn lock(&self) -> Result<(), MessageQueueError> {
                match &self.inner {
                    Some(inner) => inner.set_locked(true),
                    None => Err(MessageQueueError::CallbackNull),
                }
            }

            pub fn unlock(&self) -> Result<(), MessageQueueError> {
                match &self.inner {
                    Some(inner) => inner.set_locked(false),
                    None => Err(MessageQueueError::CallbackNull),
                }
            }

            /// True while the queue is alive and still holds this connection's slot.
            pub fn is_connection_still_valid(&self) -> bool {
                self.inner.as_ref().is_some_and(|inner| inner.is_valid())
            }

            /// True if the queue is alive and has at least one message slot, not
            /// necessarily this one.
            pub fn has_connected_slots(&self) -> bool {
                self.inner
                    .as_ref()
                    .is_some_and(|inner| inner.has_connected_slots())
            }

            /// True for a default-constructed or disconnected connection.
            pub fn is_empty(&self) -> bool {
                self.inner.is_none()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("valid", &self.is_connection_still_valid())
                    .finish()
            }
        }
    };
}

connection_handle!(
    /// Owns one message slot on a queue.
    ///
    /// Dropping the connection disconnects the slot. The connection never keeps
    /// the queue alive: once the queue is torn down, its destroy handler clears
    /// the connection and every operation becomes a no-op.
    ///
    /// Handed out by queues and signals that can be shared between threads,
    /// so the connection itself may be moved to and dropped on any thread.
    Connection,
    dyn ConnectionImpl + Send
);

connection_handle!(
    /// A [`Connection`] to a [`SingleThreaded`](crate::threading::SingleThreaded)
    /// queue. It stays on the queue's thread.
    LocalConnection,
    dyn ConnectionImpl
);

impl Connection {
    pub(crate) fn connect<M, A>(queue: &Arc<QueueCore<M, A>>, callback: Callback<A>) -> Result<Self, MessageQueueError>
    where
        M: ThreadModel,
        A: Clone + 'static,
        QueueConnection<M, A>: Send,
    {
        let inner = QueueConnection::register(queue, callback)?;
        Ok(Self {
            inner: Some(Box::new(inner)),
        })
    }
}

impl LocalConnection {
    pub(crate) fn connect<M, A>(queue: &Arc<QueueCore<M, A>>, callback: Callback<A>) -> Result<Self, MessageQueueError>
    where
        M: ThreadModel,
        A: Clone + 'static,
    {
        let inner = QueueConnection::register(queue, callback)?;
        Ok(Self {
            inner: Some(Box::new(inner)),
        })
    }
}

impl<M: ThreadModel, A: Clone + 'static> QueueConnection<M, A> {
    fn live(&self) -> Option<(Arc<QueueCore<M, A>>, ConnectionIds)> {
        let ids = (*self.ids.lock())?;
        let queue = self.queue.upgrade()?;
        queue.contains(ids.slot).then_some((queue, ids))
    }
}

impl<M: ThreadModel, A: Clone + 'static> ConnectionImpl for QueueConnection<M, A> {
    fn disconnect(&self) {
        let ids = *self.ids.lock();
        let Some(ids) = ids else {
            return;
        };
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.remove(ids.slot);
            // running the handler normalizes our state the same way a teardown would
            if let Some((handler, args)) = queue.take_destroy_handler(ids.destroy_handler) {
                handler(args.as_ref());
            }
        }
        self.ids.lock().take();
    }

    fn set_locked(&self, locked: bool) -> Result<(), MessageQueueError> {
        let ids = (*self.ids.lock()).ok_or(MessageQueueError::CallbackNull)?;
        let queue = self.queue.upgrade().ok_or(MessageQueueError::CallbackNull)?;
        queue.set_locked(ids.slot, locked)
    }

    fn is_valid(&self) -> bool {
        self.live().is_some()
    }

    fn has_connected_slots(&self) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|queue| queue.message_slot_count() > 0)
    }
}

impl<M: ThreadModel, A: Clone + 'static> Drop for QueueConnection<M, A> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
