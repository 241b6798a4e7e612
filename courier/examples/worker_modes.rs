use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier::logging;
use courier::worker::{create_scoped_thread, WorkerThread, WorkerThreadConfig};
use courier::{MessagePriority, Mode};

fn update_callback() -> anyhow::Result<()> {
    let worker = WorkerThread::<String>::new(WorkerThreadConfig::new(Mode::UpdateCallback).with_name("game-loop"))?;
    let first = worker.push_callback(|| "physics".to_string());
    let second = worker.push_callback(|| "input".to_string());
    second.set_priority(MessagePriority::Immediately)?;

    let processed = worker.update()?;
    println!(
        "update ran {processed} message(s): {} then {}",
        second.get_result()?,
        first.get_result()?
    );
    Ok(())
}

fn message_queue_mt() -> anyhow::Result<()> {
    let done = Arc::new(AtomicUsize::new(0));
    {
        let pool = create_scoped_thread(WorkerThreadConfig::new(Mode::MessageQueueMt).with_pool_size(4))?;
        for _ in 0..16 {
            let done = Arc::clone(&done);
            let _ = pool.push_callback(move || {
                std::thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        // the scoped worker drains its queue before it is dropped
    }
    println!("pool finished {} task(s)", done.load(Ordering::SeqCst));
    Ok(())
}

fn message_loop() -> anyhow::Result<()> {
    let worker = WorkerThread::<usize>::new(WorkerThreadConfig::new(Mode::MessageLoop).with_name("loop"))?;
    let handles: Vec<_> = (0..3).map(|step| worker.push_callback(move || step * step)).collect();
    for handle in &handles {
        worker.dispatch()?;
        println!("loop step produced {}", handle.get_result()?);
    }
    Ok(())
}

fn run_one_time() -> anyhow::Result<()> {
    let worker = WorkerThread::<u64>::new(WorkerThreadConfig::new(Mode::RunOneTime).with_name("once"))?;
    let handle = worker.create_one_time(|| (1..=20u64).product());
    println!("20! = {}", handle.get_result()?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    logging::init_default();

    update_callback()?;
    message_queue_mt()?;
    message_loop()?;
    run_one_time()?;

    logging::shutdown();
    Ok(())
}
