use std::time::Duration;

use anyhow::Result;
use courier::worker::{WaitStatus, WorkerThread, WorkerThreadConfig};
use courier::{MessageHandleError, MessagePriority, MessageStatus, Mode};

use test_helpers::worker;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_async_resolves_after_run() -> Result<()> {
        let worker = worker::<u32>(Mode::MessageQueue);
        let handle = worker.push_callback(|| {
            std::thread::sleep(Duration::from_millis(20));
            11
        });

        handle.wait_async().await?;
        assert_eq!(handle.status(), Some(MessageStatus::Dispatched));
        assert_eq!(handle.get_result()?, 11);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_async_reports_cancel() {
        let worker = worker::<u32>(Mode::UpdateCallback);
        let handle = worker.push_callback(|| 1);
        handle.cancel().unwrap();
        assert_eq!(handle.wait_async().await, Err(MessageHandleError::Cancelled));
    }

    #[test]
    fn test_status_follows_execution() -> Result<()> {
        let worker = worker::<u32>(Mode::UpdateCallback);
        let handle = worker.push_callback(|| 2);
        assert_eq!(handle.status(), Some(MessageStatus::BeingDispatched));
        assert_eq!(handle.priority(), Some(MessagePriority::NormalAsync));

        worker.update()?;
        assert_eq!(handle.status(), Some(MessageStatus::Dispatched));
        assert_eq!(handle.cancel()?, false);
        Ok(())
    }

    #[test]
    fn test_result_can_be_taken_once() -> Result<()> {
        let worker = worker::<String>(Mode::MessageQueue);
        let handle = worker.push_callback(|| "done".to_string());
        assert_eq!(handle.get_result()?, "done");
        assert_eq!(handle.get_result(), Err(MessageHandleError::Void));
        // waiting still succeeds after the value is gone
        handle.wait()?;
        Ok(())
    }

    #[test]
    fn test_priority_is_set_once() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let handle = worker.push_callback(|| {});
        handle.set_priority(MessagePriority::Asap)?;
        assert_eq!(handle.priority(), Some(MessagePriority::Asap));
        assert_eq!(
            handle.set_priority(MessagePriority::Immediately),
            Err(MessageHandleError::PriorityAlreadySet)
        );
        Ok(())
    }

    #[test]
    fn test_wait_for_pending_message() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let handle = worker.push_callback(|| {});
        assert_eq!(handle.wait_for(Duration::from_millis(10))?, WaitStatus::Timeout);

        worker.update()?;
        assert_eq!(handle.wait_for(Duration::from_millis(10))?, WaitStatus::Ready);
        Ok(())
    }

    #[test]
    fn test_settled_message_cached_until_handle_drops() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let kept = worker.push_callback(|| {});
        drop(worker.push_callback(|| {}));

        assert_eq!(worker.update()?, 2);
        assert_eq!(worker.cached_len(), 1);

        drop(kept);
        assert_eq!(worker.cached_len(), 0);
        Ok(())
    }

    #[test]
    fn test_handle_outlives_worker() {
        let worker = WorkerThread::<u32>::new(WorkerThreadConfig::new(Mode::MessageQueue)).unwrap();
        let handle = worker.push_callback(|| 4);
        handle.wait().unwrap();
        drop(worker);

        assert!(!handle.is_valid());
        assert_eq!(handle.get_result(), Err(MessageHandleError::InvalidHandler));
    }
}
