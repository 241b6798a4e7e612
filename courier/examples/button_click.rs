use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use courier::logging::{self, LogSink};
use courier::signal::{ObjectLifeIndicator, Signal, SignalMt};
use courier::worker::{WorkerThread, WorkerThreadConfig};
use courier::Mode;

// Only Button can construct this, so only Button can emit its signals
courier::signal_key!(ButtonKey);

struct Button {
    label: String,
    clicks: AtomicU32,
    life: ObjectLifeIndicator,
    clicked: SignalMt<(String, u32), ButtonKey>,
}

impl Button {
    fn new(label: &str, worker: Arc<WorkerThread<()>>) -> Self {
        let life = ObjectLifeIndicator::new();
        let clicked = Signal::with_owner_and_worker(&life, worker);
        Self {
            label: label.to_string(),
            clicks: AtomicU32::new(0),
            life,
            clicked,
        }
    }

    fn click(&self) -> anyhow::Result<()> {
        let count = self.clicks.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(handle) = self.clicked.emit_async(ButtonKey::new(), (self.label.clone(), count))? {
            handle.wait()?;
        }
        Ok(())
    }

    fn destroy(&self) {
        self.life.mark_dead();
    }
}

fn print_click((label, count): &(String, u32)) {
    println!("{label} clicked {count} time(s)");
}

fn main() -> anyhow::Result<()> {
    logging::init_async(LogSink::Stdout);

    let ui = WorkerThread::make_shared(WorkerThreadConfig::new(Mode::MessageQueue).with_name("ui"))?;
    let button = Button::new("OK", Arc::clone(&ui));

    let _printer = button.clicked.connect(print_click)?;
    let mut counter = button.clicked.connect(|(_, count): &(String, u32)| {
        logging::info!(count, "click recorded");
    })?;

    button.click()?;
    button.click()?;

    counter.disconnect();
    button.click()?;

    // nothing is delivered once the owner is gone
    button.destroy();
    button.click()?;

    logging::info!(slots = button.clicked.slot_count(), "done");
    logging::shutdown();
    Ok(())
}
