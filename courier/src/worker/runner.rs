//! Bodies of the OS threads a worker runs.

use std::sync::Arc;

use courier_api::Mode;

use super::handle::PackagedMessage;
use super::shared::{OneTimeState, WorkerShared};

/// Work driven by an update-callback backing thread.
///
/// `on_run` is called once per tick, before the queued messages of that
/// tick are processed. `on_cancel` runs once when the thread leaves its
/// loop.
pub trait WorkerRunnable: Send {
    fn on_run(&mut self);

    fn on_cancel(&mut self) {}
}

impl<F: FnMut() + Send> WorkerRunnable for F {
    fn on_run(&mut self) {
        self()
    }
}

/// Dedicated thread of `Mode::MessageQueue`: runs every message as it arrives.
pub(crate) fn message_queue_loop<R: Send + 'static>(shared: Arc<WorkerShared<R>>, epoch: u64) {
    let span = crate::worker_span!(shared.name.as_str(), shared.id);
    let _guard = span.enter();

    while let Some(message) = next_queued(&shared, epoch) {
        let _ = shared.call(message, true);
    }
    shared.emit_run_finished();
}

fn next_queued<R: Send + 'static>(shared: &WorkerShared<R>, epoch: u64) -> Option<PackagedMessage<R>> {
    let mut state = shared.state.lock();
    loop {
        if state.should_exit(epoch) {
            return None;
        }
        if state.suspended {
            shared.resume.wait(&mut state);
            continue;
        }
        match WorkerShared::pop_locked(&mut state, true) {
            Ok(message) => return Some(message),
            Err(_) => {
                shared.work.wait_for(&mut state, shared.idle_timeout);
            }
        }
    }
}

/// Dedicated thread of `Mode::MessageLoop`: one message per dispatch.
pub(crate) fn message_loop<R: Send + 'static>(shared: Arc<WorkerShared<R>>, epoch: u64) {
    let span = crate::worker_span!(shared.name.as_str(), shared.id);
    let _guard = span.enter();

    while let Some(message) = next_looped(&shared, epoch) {
        let _ = shared.call(message, true);
    }
    shared.emit_run_finished();
}

fn next_looped<R: Send + 'static>(shared: &WorkerShared<R>, epoch: u64) -> Option<PackagedMessage<R>> {
    let mut state = shared.state.lock();
    loop {
        if state.should_exit(epoch) {
            return None;
        }
        if state.suspended {
            shared.resume.wait(&mut state);
            continue;
        }
        if state.loop_wakes == 0 || state.pause.is_some() {
            shared.work.wait_for(&mut state, shared.idle_timeout);
            continue;
        }
        // a wake is consumed even when there is nothing to run
        state.loop_wakes -= 1;
        if let Ok(message) = WorkerShared::pop_locked(&mut state, true) {
            return Some(message);
        }
    }
}

/// Transient thread of `Mode::MessageQueueMt`: drains the queue, then exits.
///
/// The thread also leaves as soon as the worker is switched to another
/// mode. It checks the mode rather than the epoch so a thread spawned
/// before a round trip back to `MessageQueueMt` keeps counting toward the
/// pool.
pub(crate) fn pool_worker<R: Send + 'static>(shared: Arc<WorkerShared<R>>, slot: usize) {
    loop {
        let message = {
            let mut state = shared.state.lock();
            while state.suspended && state.alive && !state.terminated {
                shared.resume.wait(&mut state);
            }
            let next = if state.terminated || !state.alive || state.mode != Mode::MessageQueueMt {
                None
            } else {
                WorkerShared::pop_locked(&mut state, true).ok()
            };
            match next {
                Some(message) => message,
                None => {
                    state.pool_threads = state.pool_threads.saturating_sub(1);
                    break;
                }
            }
        };
        let _ = shared.call(message, true);
    }
    shared.finished_pool.push(slot);
    shared.idle.notify_all();
}

/// Backing thread of `Mode::UpdateCallback`.
pub(crate) fn update_loop<R: Send + 'static>(
    shared: Arc<WorkerShared<R>>,
    mut runnable: Box<dyn WorkerRunnable>,
    epoch: u64,
) {
    let span = crate::worker_span!(shared.name.as_str(), shared.id);
    let _guard = span.enter();

    loop {
        {
            let mut state = shared.state.lock();
            if state.should_exit(epoch) {
                break;
            }
            if state.suspended {
                shared.resume.wait(&mut state);
                continue;
            }
        }

        runnable.on_run();

        let limit = {
            let state = shared.state.lock();
            if state.pause.is_some() { 0 } else { state.queue.len() }
        };
        shared.drain(limit);

        let mut state = shared.state.lock();
        if state.should_exit(epoch) {
            break;
        }
        shared.work.wait_for(&mut state, shared.update_interval);
    }

    runnable.on_cancel();
    shared.state.lock().update_thread = false;
    shared.emit_run_finished();
}

/// Thread of `Mode::RunOneTime`: runs the first queued message, then terminates the worker.
pub(crate) fn run_once<R: Send + 'static>(shared: Arc<WorkerShared<R>>) {
    let span = crate::worker_span!(shared.name.as_str(), shared.id);
    let _guard = span.enter();

    let message = WorkerShared::pop_locked(&mut shared.state.lock(), true).ok();
    if let Some(message) = message {
        let _ = shared.call(message, true);
    }

    {
        let mut state = shared.state.lock();
        state.terminated = true;
        state.one_time = OneTimeState::Finished;
    }
    shared.wake_all();
    shared.emit_run_finished();
}
