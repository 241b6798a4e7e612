//! Message priority and lifecycle status.
//!
//! Both enums are stored in atomics by the runtime, so they carry a stable
//! `u8` representation.
//!
//! # Usage
//!
//! ```rust
//! use courier_api::priority::{MessagePriority, MessageStatus};
//!
//! assert!(MessagePriority::Immediately.is_urgent());
//! assert_eq!(MessageStatus::from_u8(MessageStatus::Dispatched as u8), Some(MessageStatus::Dispatched));
//! ```

/// Scheduling priority of a queued message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessagePriority {
    Immediately = 0,
    Asap = 1,
    #[default]
    NormalAsync = 2,
}

impl MessagePriority {
    /// Urgent priorities move the message to the head of the queue.
    pub fn is_urgent(&self) -> bool {
        !matches!(self, MessagePriority::NormalAsync)
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessagePriority::Immediately),
            1 => Some(MessagePriority::Asap),
            2 => Some(MessagePriority::NormalAsync),
            _ => None,
        }
    }
}

/// Lifecycle of a queued message.
///
/// A message starts in `BeingDispatched`. It moves to `Dispatching` when a
/// thread claims it and to `Dispatched` once its task returned. `Canceled` is
/// only reachable from `BeingDispatched`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageStatus {
    #[default]
    BeingDispatched = 0,
    Dispatching = 1,
    Canceled = 2,
    Dispatched = 3,
}

impl MessageStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageStatus::BeingDispatched),
            1 => Some(MessageStatus::Dispatching),
            2 => Some(MessageStatus::Canceled),
            3 => Some(MessageStatus::Dispatched),
            _ => None,
        }
    }

    /// True once the message can no longer run.
    pub fn is_final(&self) -> bool {
        matches!(self, MessageStatus::Canceled | MessageStatus::Dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_repr_round_trip() {
        for status in [
            MessageStatus::BeingDispatched,
            MessageStatus::Dispatching,
            MessageStatus::Canceled,
            MessageStatus::Dispatched,
        ] {
            assert_eq!(MessageStatus::from_u8(status as u8), Some(status));
        }
        assert_eq!(MessageStatus::from_u8(9), None);
    }

    #[test]
    fn test_urgent_priorities() {
        assert!(MessagePriority::Immediately.is_urgent());
        assert!(MessagePriority::Asap.is_urgent());
        assert!(!MessagePriority::NormalAsync.is_urgent());
    }
}
