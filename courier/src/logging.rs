// Logging for courier
//
// Built on the `tracing` ecosystem. Workers and queues emit structured
// events through the macros at the bottom of this module; applications pick
// an output format with one of the `init_*` functions.
//
// # Usage Examples
//
// ## Basic Initialization
//
// ```rust
// use courier::logging;
//
// // INFO level, console output
// logging::init_default();
//
// // Or with custom settings
// let config = logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     ..Default::default()
// };
// logging::init(config);
// ```
//
// ## Asynchronous Output
//
// Formatting happens on the calling thread, but the formatted line is
// written by a shared multi-threaded log worker so slow sinks never block
// the thread that logged.
//
// ```rust
// use courier::logging::{self, LogSink};
//
// logging::init_async(LogSink::File("courier.log".into()));
// logging::info!("written from a log worker thread");
//
// // Before exit, drain pending lines
// logging::shutdown();
// ```
//
// ## Using Log Macros
//
// ```rust
// use courier::{log_worker, worker_span};
//
// let span = worker_span!("io", "3f1c");
// let _guard = span.enter();
// log_worker!("io", "mode_changed", to = "MessageQueue");
// ```

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use courier_api::errors::WorkerThreadError;
use courier_api::Mode;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{fmt, fmt::MakeWriter, prelude::*, EnvFilter, Layer, Registry};

use crate::worker::{WorkerThread, WorkerThreadConfig};

/// Name of the shared log worker.
pub const LOG_WORKER_NAME: &str = "Log Thread";

/// Configuration for the logging system
///
/// # Examples
///
/// ```rust
/// use courier::logging::{LogConfig, LogSink};
/// use tracing::Level;
///
/// let config = LogConfig {
///     level: Level::DEBUG,
///     json_format: false,
///     show_file_line: true,
///     show_thread_info: true,
///     show_time: true,
///     target_filters: Some("courier=debug,courier::worker=trace".to_string()),
///     async_sink: Some(LogSink::Stderr),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
    /// Write formatted lines through the log worker instead of the calling thread
    pub async_sink: Option<LogSink>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
            async_sink: None,
        }
    }
}

/// Destination of asynchronously written log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    Stderr,
    /// Appended to, created if missing.
    File(PathBuf),
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

// 0 means one thread per CPU
static LOG_POOL_SIZE: AtomicUsize = AtomicUsize::new(0);

lazy_static! {
    static ref LOG_THREAD: Mutex<Option<Arc<WorkerThread<()>>>> = Mutex::new(None);
    // pool threads write concurrently; lines must not interleave
    static ref SINK_LOCK: Mutex<()> = Mutex::new(());
}

/// Initialize the logging system with the given configuration
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

        if let Some(filters) = &config.target_filters {
            for filter in filters.split(',') {
                if let Ok(directive) = filter.parse() {
                    env_filter = env_filter.add_directive(directive);
                }
            }
        }

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(format_layer(&config));

        set_global_subscriber(subscriber);
    });
}

type FilteredRegistry = Layered<EnvFilter, Registry>;

// Picks the output format and writer for `init`
fn format_layer(config: &LogConfig) -> Box<dyn Layer<FilteredRegistry> + Send + Sync> {
    let writer = config.async_sink.clone().map(AsyncMakeWriter::new);

    if config.json_format {
        let layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);
        return match writer {
            Some(writer) => layer.with_writer(writer).boxed(),
            None => layer.boxed(),
        };
    }

    let layer = fmt::layer()
        .with_ansi(writer.is_none() && atty::is(atty::Stream::Stdout))
        .with_file(config.show_file_line)
        .with_line_number(config.show_file_line)
        .with_thread_names(config.show_thread_info)
        .with_thread_ids(config.show_thread_info);
    match (config.show_time, writer) {
        (true, Some(writer)) => layer.with_writer(writer).boxed(),
        (true, None) => layer.boxed(),
        (false, Some(writer)) => layer.without_time().with_writer(writer).boxed(),
        (false, None) => layer.without_time().boxed(),
    }
}

// Helper function to set the global subscriber
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Utility function to create a file writer for logs
///
/// The file is opened in append mode and created if it doesn't exist.
pub fn file_writer(path: &str) -> io::Result<Box<dyn io::Write + Send + Sync + 'static>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

/// Initialize logging with both console and file output
///
/// Console output respects the ansi color setting, while file output is always plain.
pub fn init_with_file(config: LogConfig, log_file: &str) -> Result<(), io::Error> {
    // surface an unwritable path to the caller instead of silently falling back
    drop(file_writer(log_file)?);

    INIT.call_once(|| {
        let env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

        let console_layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let log_file_path = log_file.to_string();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || match file_writer(&log_file_path) {
                Ok(writer) => writer,
                Err(_) => Box::new(std::io::stderr()),
            })
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

/// INFO level, human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// Initialize logging with asynchronous output to `sink`.
pub fn init_async(sink: LogSink) {
    init(LogConfig {
        async_sink: Some(sink),
        ..Default::default()
    });
}

/// Initialize logging optimized for development environments
///
/// - DEBUG level for courier, TRACE for worker internals
/// - Colorized console output with file/line information
/// - Thread names and IDs displayed
pub fn init_development() {
    let config = LogConfig {
        level: Level::DEBUG,
        json_format: false,
        show_file_line: true,
        show_thread_info: true,
        show_time: true,
        target_filters: Some("courier=debug,courier::worker=trace".to_string()),
        async_sink: None,
    };
    init(config);
}

/// Initialize logging optimized for production environments
///
/// JSON lines written asynchronously to stdout, without file/line information.
pub fn init_production() {
    let config = LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
        async_sink: Some(LogSink::Stdout),
    };
    init(config);
}

/// Initialize logging for testing
///
/// Only warnings and errors, without thread information.
pub fn init_test() {
    let config = LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
        async_sink: None,
    };
    init(config);
}

/// Sets the number of pool threads of the log worker. Only effective before
/// the first asynchronous line is written.
pub fn set_log_pool_size(size: usize) {
    LOG_POOL_SIZE.store(size, Ordering::Relaxed);
}

/// The shared log worker, created on first use.
///
/// It runs in `MessageQueueMt` mode with event tracing disabled, so writing
/// a line never produces another one.
pub fn log_thread() -> Result<Arc<WorkerThread<()>>, WorkerThreadError> {
    let mut slot = LOG_THREAD.lock();
    if let Some(worker) = slot.as_ref() {
        return Ok(Arc::clone(worker));
    }

    let mut config = WorkerThreadConfig::new(Mode::MessageQueueMt)
        .with_name(LOG_WORKER_NAME)
        .with_trace_events(false);
    let pool_size = LOG_POOL_SIZE.load(Ordering::Relaxed);
    if pool_size > 0 {
        config = config.with_pool_size(pool_size);
    }

    let worker = WorkerThread::make_shared(config)?;
    *slot = Some(Arc::clone(&worker));
    Ok(worker)
}

/// Blocks until every queued line has been written.
pub fn flush() {
    let worker = LOG_THREAD.lock().clone();
    if let Some(worker) = worker {
        let _ = worker.dispatch();
        worker.wait();
    }
}

/// Flushes and tears down the log worker. A later line starts a new one.
pub fn shutdown() {
    let worker = LOG_THREAD.lock().take();
    if let Some(worker) = worker {
        let _ = worker.dispatch();
        worker.wait();
    }
}

fn write_line(sink: &LogSink, line: &[u8]) {
    let _serialized = SINK_LOCK.lock();
    // there is nowhere left to report a failing sink
    let _ = match sink {
        LogSink::Stdout => io::stdout().lock().write_all(line),
        LogSink::Stderr => io::stderr().lock().write_all(line),
        LogSink::File(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line)),
    };
}

/// [`MakeWriter`] that hands each formatted line to the log worker.
#[derive(Debug, Clone)]
pub struct AsyncMakeWriter {
    sink: Arc<LogSink>,
}

impl AsyncMakeWriter {
    pub fn new(sink: LogSink) -> Self {
        Self { sink: Arc::new(sink) }
    }
}

impl<'a> MakeWriter<'a> for AsyncMakeWriter {
    type Writer = AsyncLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        AsyncLogWriter {
            sink: Arc::clone(&self.sink),
            buffer: Vec::new(),
        }
    }
}

/// Buffers one formatted event and submits it when dropped.
#[derive(Debug)]
pub struct AsyncLogWriter {
    sink: Arc<LogSink>,
    buffer: Vec<u8>,
}

impl io::Write for AsyncLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for AsyncLogWriter {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let line = Arc::new(mem::take(&mut self.buffer));

        let worker = match log_thread() {
            Ok(worker) => worker,
            Err(_) => {
                write_line(&self.sink, &line);
                return;
            }
        };

        let sink = Arc::clone(&self.sink);
        let queued = Arc::clone(&line);
        let handle = worker.push_callback(move || write_line(&sink, &queued));
        if handle.is_error() {
            // queue full or worker stopping: write inline rather than lose the line
            write_line(&self.sink, &line);
            return;
        }
        let _ = worker.dispatch();
    }
}

/// Create a new span for worker threads
///
/// # Examples
///
/// ```rust
/// use courier::worker_span;
///
/// let span = worker_span!("io", "3f1c");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! worker_span {
    ($name:expr, $id:expr) => {
        $crate::logging::info_span!("worker", name = $name, id = %$id)
    };
    ($name:expr, $id:expr, $($fields:tt)*) => {
        $crate::logging::info_span!("worker", name = $name, id = %$id, $($fields)*)
    };
}

/// Log worker lifecycle events
///
/// # Examples
///
/// ```rust
/// use courier::log_worker;
///
/// log_worker!("io", "created");
/// log_worker!("io", "mode_changed", to = "MessageLoop");
/// ```
#[macro_export]
macro_rules! log_worker {
    ($name:expr, $event:expr) => {
        $crate::logging::info!(worker = %$name, event = $event);
    };
    ($name:expr, $event:expr, $($fields:tt)*) => {
        $crate::logging::info!(worker = %$name, event = $event, $($fields)*);
    };
}

/// Log slot queue events
///
/// # Examples
///
/// ```rust
/// use courier::log_queue;
///
/// log_queue!("slot_added", slot = 3);
/// ```
#[macro_export]
macro_rules! log_queue {
    ($event:expr) => {
        $crate::logging::trace!(component = "queue", event = $event);
    };
    ($event:expr, $($fields:tt)*) => {
        $crate::logging::trace!(component = "queue", event = $event, $($fields)*);
    };
}

/// Get the current tracing dispatcher
///
/// Useful when spawning threads that need access to the current tracing configuration.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}

// Re-export the most commonly used tracing macros for convenience
pub use tracing::{debug, error, info, info_span, trace, warn};
