use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use courier::worker::{create_scoped_thread, current_thread_id, sleep, PauseReason, WaitStatus, WorkerThread, WorkerThreadConfig};
use courier::{MessageHandleError, MessagePriority, MessageStatus, Mode, ThreadExecutionMode, WorkerThreadError, MAX_SIZE};

use test_helpers::{counter, load, recorder, wait_until, worker, DEFAULT_WAIT_TIME};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_queue_runs_pushed_task() -> Result<()> {
        let worker = worker::<u32>(Mode::MessageQueue);
        let handle = worker.push_callback(|| 6 * 7);
        assert_eq!(handle.get_result()?, 42);
        assert!(handle.is_success());
        Ok(())
    }

    #[test]
    fn test_urgent_priority_jumps_the_queue() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let (order, _) = recorder();
        let mut handles = Vec::new();
        for tag in 1..=3 {
            let sink = Arc::clone(&order);
            handles.push(worker.push_callback(move || sink.lock().unwrap().push(tag)));
        }

        handles[2].set_priority(MessagePriority::Immediately)?;
        assert_eq!(worker.update()?, 3);
        assert_eq!(*order.lock().unwrap(), vec![3, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_normal_priority_keeps_position() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let (order, _) = recorder();
        let mut handles = Vec::new();
        for tag in 1..=3 {
            let sink = Arc::clone(&order);
            handles.push(worker.push_callback(move || sink.lock().unwrap().push(tag)));
        }

        handles[2].set_priority(MessagePriority::NormalAsync)?;
        worker.update()?;
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_canceled_task_never_runs() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let (count, sink) = counter();
        let handle = worker.push_callback(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(handle.cancel()?, true);
        assert_eq!(worker.update()?, 0);
        assert_eq!(load(&count), 0);
        assert_eq!(handle.wait(), Err(MessageHandleError::Cancelled));
        assert_eq!(handle.cancel(), Err(MessageHandleError::Cancelled));
        Ok(())
    }

    #[test]
    fn test_full_queue_rejects_push() {
        let worker = WorkerThread::<()>::new(WorkerThreadConfig::new(Mode::UpdateCallback).with_max_queue(2)).unwrap();
        let first = worker.push_callback(|| {});
        let second = worker.push_callback(|| {});
        let third = worker.push_callback(|| {});

        assert!(first.is_success() && second.is_success());
        assert_eq!(third.error(), Some(WorkerThreadError::PushExceed { capacity: 2 }));
        assert_eq!(third.wait(), Err(MessageHandleError::InvalidHandler));
        assert_eq!(worker.len(), 2);
    }

    #[test]
    fn test_message_ids_reuse_smallest_free() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let first = worker.push_callback(|| {});
        let second = worker.push_callback(|| {});
        let third = worker.push_callback(|| {});
        assert_eq!(
            (first.message_id(), second.message_id(), third.message_id()),
            (Some(0), Some(1), Some(2))
        );

        second.cancel()?;
        drop(second);
        assert_eq!(worker.update()?, 2);

        let next = worker.push_callback(|| {});
        assert_eq!(next.message_id(), Some(1));
        Ok(())
    }

    #[test]
    fn test_panic_is_reported_on_error_signal() -> Result<()> {
        let worker = worker::<u32>(Mode::MessageQueue);
        let (errors, sink) = recorder();
        let _conn = worker
            .sig_error_throw()
            .connect(move |reason: &String| sink.lock().unwrap().push(reason.clone()))?;

        let handle = worker.push_callback(|| -> u32 { panic!("boom") });
        handle.wait()?;
        assert_eq!(handle.get_result(), Err(MessageHandleError::Panicked("boom".to_string())));
        assert_eq!(*errors.lock().unwrap(), vec!["boom".to_string()]);

        // the worker keeps serving after a panic
        assert_eq!(worker.push_callback(|| 1).get_result()?, 1);
        Ok(())
    }

    #[test]
    fn test_update_only_in_update_callback_mode() {
        let worker = worker::<()>(Mode::MessageQueue);
        assert_eq!(
            worker.update(),
            Err(WorkerThreadError::ThisModeCanNotBeUsed(Mode::MessageQueue))
        );
    }

    #[test]
    fn test_change_mode_rules() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        assert_eq!(
            worker.change_mode(Mode::UpdateCallback, 8),
            Err(WorkerThreadError::SamePreviousMode)
        );

        worker.create_worker_thread(|| {})?;
        assert_eq!(
            worker.change_mode(Mode::MessageQueue, 8),
            Err(WorkerThreadError::ChangeModeUpdateCallback)
        );
        Ok(())
    }

    #[test]
    fn test_change_mode_runs_pending_work() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let (count, sink) = counter();
        let handle = worker.push_callback(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        worker.change_mode(Mode::MessageQueue, 16)?;
        handle.wait()?;
        assert_eq!(load(&count), 1);
        assert_eq!(worker.mode(), Mode::MessageQueue);
        assert_eq!(worker.max_queue(), 16);
        assert!(!worker.is_paused());

        // a worker that already ran cannot become one-shot
        assert_eq!(
            worker.change_mode(Mode::RunOneTime, 16),
            Err(WorkerThreadError::ThisModeCanNotBeUsed(Mode::RunOneTime))
        );

        worker.change_mode(Mode::MessageLoop, 16)?;
        let looped = worker.push_callback(|| {});
        worker.dispatch()?;
        looped.wait()?;
        Ok(())
    }

    #[test]
    fn test_run_one_time() -> Result<()> {
        let worker = worker::<u32>(Mode::RunOneTime);
        let (finished, sink) = counter();
        let _conn = worker.sig_on_run_finished().connect(move |_: &()| {
            sink.fetch_add(1, Ordering::SeqCst);
        })?;

        let handle = worker.push_callback(|| 5);
        assert!(!worker.is_one_time_run());
        worker.run_one_time(true)?;
        assert!(worker.is_one_time_run());
        assert_eq!(handle.get_result()?, 5);
        assert_eq!(load(&finished), 1);
        assert!(worker.is_terminated());

        assert_eq!(worker.run_one_time(false), Err(WorkerThreadError::IsAlreadyCreated));
        assert_eq!(
            worker.push_callback(|| 6).error(),
            Some(WorkerThreadError::EnqueueWhileStopping)
        );
        Ok(())
    }

    #[test]
    fn test_run_one_time_detached_stays_joinable() -> Result<()> {
        let worker = worker::<u32>(Mode::RunOneTime);
        let handle = worker.push_callback(|| 5);
        assert!(!worker.joinable());

        worker.run_one_time(false)?;
        assert_eq!(handle.get_result()?, 5);
        assert!(wait_until(DEFAULT_WAIT_TIME, || worker.is_terminated()));

        // the finished thread is kept until someone joins it
        assert!(worker.joinable());
        worker.join();
        assert!(!worker.joinable());
        Ok(())
    }

    #[test]
    fn test_wait_returns_when_message_loop_needs_dispatch() -> Result<()> {
        let worker = worker::<u32>(Mode::MessageLoop);
        let handle = worker.push_callback(|| 1);
        assert!(!worker.wait());

        worker.dispatch()?;
        assert!(worker.wait());
        assert_eq!(handle.get_result()?, 1);
        Ok(())
    }

    #[test]
    fn test_wait_returns_when_pool_is_idle() -> Result<()> {
        let worker = worker::<u32>(Mode::MessageQueueMt);
        let handle = worker.push_callback(|| 2);
        assert!(!worker.wait());
        assert!(worker.has_all_mt_process_done());

        worker.dispatch()?;
        assert!(worker.wait());
        assert_eq!(handle.get_result()?, 2);
        Ok(())
    }

    #[test]
    fn test_create_one_time() -> Result<()> {
        let worker = worker::<u32>(Mode::RunOneTime);
        let handle = worker.create_one_time(|| 9);
        assert_eq!(handle.get_result()?, 9);
        assert!(!worker.wait());
        Ok(())
    }

    #[test]
    fn test_message_loop_runs_one_per_dispatch() -> Result<()> {
        let worker = worker::<()>(Mode::MessageLoop);
        let (count, _) = counter();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let sink = Arc::clone(&count);
                worker.push_callback(move || {
                    sink.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert_eq!(handles[0].wait_for(Duration::from_millis(30))?, WaitStatus::Timeout);

        worker.dispatch()?;
        handles[0].wait()?;
        assert_eq!(handles[1].wait_for(Duration::from_millis(30))?, WaitStatus::Timeout);
        assert_eq!(load(&count), 1);

        worker.dispatch()?;
        handles[1].wait()?;
        assert_eq!(load(&count), 2);
        Ok(())
    }

    #[test]
    fn test_message_queue_mt_drains_with_pool() -> Result<()> {
        let worker = WorkerThread::<()>::new(
            WorkerThreadConfig::new(Mode::MessageQueueMt)
                .with_pool_size(4)
                .with_idle_timeout(Duration::from_millis(10)),
        )?;
        let (count, _) = counter();
        for _ in 0..32 {
            let sink = Arc::clone(&count);
            let _ = worker.push_callback(move || {
                sink.fetch_add(1, Ordering::SeqCst);
            });
        }

        worker.dispatch()?;
        assert!(worker.wait());
        assert_eq!(load(&count), 32);
        assert!(worker.is_process_done());
        assert!(wait_until(DEFAULT_WAIT_TIME, || worker.has_all_mt_process_done()));
        Ok(())
    }

    #[test]
    fn test_pause_holds_messages() -> Result<()> {
        let worker = worker::<()>(Mode::MessageQueue);
        let (count, sink) = counter();
        worker.pause(true);
        assert_eq!(worker.pause_reason(), Some(PauseReason::Manual));
        let handle = worker.push_callback(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(handle.wait_for(Duration::from_millis(30))?, WaitStatus::Timeout);
        assert_eq!(worker.pop().unwrap_err(), WorkerThreadError::Paused);
        assert_eq!(load(&count), 0);

        worker.pause(false);
        assert_eq!(worker.pause_reason(), None);
        handle.wait()?;
        assert_eq!(load(&count), 1);
        Ok(())
    }

    #[test]
    fn test_suspend_and_resume() -> Result<()> {
        let worker = worker::<()>(Mode::MessageQueue);
        worker.suspend();
        assert!(worker.is_suspended());
        // give the dedicated thread time to park
        thread::sleep(Duration::from_millis(30));

        let handle = worker.push_callback(|| {});
        assert_eq!(handle.wait_for(Duration::from_millis(30))?, WaitStatus::Timeout);

        worker.resume();
        handle.wait()?;
        Ok(())
    }

    #[test]
    fn test_clear_cancels_pending() {
        let worker = worker::<()>(Mode::UpdateCallback);
        let first = worker.push_callback(|| {});
        let second = worker.push_callback(|| {});

        worker.clear();
        assert!(worker.is_empty());
        assert_eq!(first.wait(), Err(MessageHandleError::Cancelled));
        assert_eq!(second.wait(), Err(MessageHandleError::Cancelled));
    }

    #[test]
    fn test_dropping_worker_invalidates_handles() {
        let worker = worker::<()>(Mode::UpdateCallback);
        let handle = worker.push_callback(|| {});
        drop(worker);

        assert!(!handle.is_valid());
        assert_eq!(handle.wait(), Err(MessageHandleError::InvalidHandler));
        assert_eq!(handle.error(), Some(WorkerThreadError::MessageCanceled));
    }

    #[test]
    fn test_pop_and_call_on_caller_thread() -> Result<()> {
        let worker = worker::<u32>(Mode::UpdateCallback);
        assert_eq!(worker.pop().unwrap_err(), WorkerThreadError::QueueEmpty);

        let handle = worker.push_callback(|| 3);
        let message = worker.pop()?;
        assert_eq!(Some(message.message_id()), handle.message_id());
        assert_eq!(message.priority(), MessagePriority::NormalAsync);

        worker.call(message)?;
        assert_eq!(handle.get_result()?, 3);
        Ok(())
    }

    #[test]
    fn test_pool_threads_stop_after_mode_change() -> Result<()> {
        let worker = WorkerThread::<()>::new(
            WorkerThreadConfig::new(Mode::MessageQueueMt)
                .with_pool_size(1)
                .with_idle_timeout(Duration::from_millis(10)),
        )?;
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = worker.push_callback(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        });
        let (count, sink) = counter();
        let second = worker.push_callback(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        worker.dispatch()?;
        started_rx.recv_timeout(DEFAULT_WAIT_TIME)?;
        worker.change_mode(Mode::UpdateCallback, MAX_SIZE)?;
        release_tx.send(())?;
        first.wait()?;

        // the pool thread leaves the second message to the new mode
        assert!(wait_until(DEFAULT_WAIT_TIME, || worker.has_all_mt_process_done()));
        assert_eq!(load(&count), 0);
        assert_eq!(worker.update()?, 1);
        second.wait()?;
        assert_eq!(load(&count), 1);
        Ok(())
    }

    #[test]
    fn test_dropping_popped_message_cancels_it() -> Result<()> {
        let worker = worker::<u32>(Mode::UpdateCallback);
        let handle = worker.push_callback(|| 3);
        let message = worker.pop()?;
        drop(message);

        assert!(handle.is_valid());
        assert_eq!(handle.status(), Some(MessageStatus::Canceled));
        assert_eq!(handle.wait(), Err(MessageHandleError::Cancelled));
        assert_eq!(handle.error(), None);

        // the id is free again once the handle goes away
        drop(handle);
        let next = worker.push_callback(|| 4);
        assert_eq!(next.message_id(), Some(0));
        Ok(())
    }

    #[test]
    fn test_dropping_unobserved_popped_message_frees_id() -> Result<()> {
        let worker = worker::<u32>(Mode::UpdateCallback);
        drop(worker.push_callback(|| 1));
        let kept = worker.push_callback(|| 2);
        assert_eq!(kept.message_id(), Some(1));

        let message = worker.pop()?;
        assert_eq!(message.message_id(), 0);
        drop(message);

        let next = worker.push_callback(|| 3);
        assert_eq!(next.message_id(), Some(0));
        assert_eq!(worker.update()?, 2);
        assert_eq!(kept.get_result(), Ok(2));
        Ok(())
    }

    #[test]
    fn test_popped_message_dropped_after_worker_is_inert() -> Result<()> {
        let worker = worker::<u32>(Mode::UpdateCallback);
        let handle = worker.push_callback(|| 3);
        let message = worker.pop()?;
        drop(worker);
        drop(message);

        assert!(!handle.is_valid());
        assert_eq!(handle.wait(), Err(MessageHandleError::InvalidHandler));
        Ok(())
    }

    #[test]
    fn test_backing_update_thread() -> Result<()> {
        let worker = worker::<()>(Mode::UpdateCallback);
        let (ticks, sink) = counter();
        worker.create_worker_thread(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        })?;
        assert!(worker.has_update_thread());
        assert_eq!(
            worker.create_worker_thread(|| {}),
            Err(WorkerThreadError::IsAlreadyCreated)
        );

        let handle = worker.push_callback(|| {});
        worker.dispatch()?;
        handle.wait()?;
        assert!(wait_until(DEFAULT_WAIT_TIME, || load(&ticks) > 0));

        worker.stop_async();
        worker.join();
        assert!(!worker.has_update_thread());
        Ok(())
    }

    #[test]
    fn test_wait_returns_false_without_driver() {
        let worker = worker::<()>(Mode::UpdateCallback);
        assert!(!worker.wait());
        assert_eq!(worker.dispatch(), Err(WorkerThreadError::UpdateCallback));
    }

    #[test]
    fn test_thread_creation_can_be_disabled() {
        let config = WorkerThreadConfig::new(Mode::MessageQueue).with_execution(ThreadExecutionMode::None);
        let result = WorkerThread::<()>::new(config);
        assert!(matches!(result, Err(WorkerThreadError::CreateThreadFailed(_))));
    }

    #[test]
    fn test_only_detached_workers_leak() {
        let result = WorkerThread::<()>::make_leaked(WorkerThreadConfig::new(Mode::MessageQueue));
        assert!(result.is_err());

        let leaked = WorkerThread::<u32>::make_leaked(
            WorkerThreadConfig::new(Mode::MessageQueue).with_execution(ThreadExecutionMode::Detach),
        )
        .unwrap();
        assert_eq!(leaked.push_callback(|| 8).get_result(), Ok(8));
    }

    #[test]
    fn test_scoped_worker_finishes_queued_work() -> Result<()> {
        let (count, _) = counter();
        {
            let scoped = create_scoped_thread(WorkerThreadConfig::new(Mode::MessageQueueMt).with_pool_size(2))?;
            for _ in 0..8 {
                let sink = Arc::clone(&count);
                let _ = scoped.push_callback(move || {
                    sink.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(load(&count), 8);
        Ok(())
    }

    #[test]
    fn test_execution_thread_per_mode() -> Result<()> {
        let caller = current_thread_id();

        let updated = worker(Mode::UpdateCallback);
        let handle = updated.push_callback(current_thread_id);
        updated.update()?;
        assert_eq!(handle.get_result()?, caller);

        let queued = worker(Mode::MessageQueue);
        let handle = queued.push_callback(|| {
            sleep(Duration::from_millis(1));
            current_thread_id()
        });
        assert_ne!(handle.get_result()?, caller);
        Ok(())
    }
}
