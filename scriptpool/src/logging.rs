// Logging for the script worker runtime.
//
// Built on `tracing`. Worker threads run inside a `worker_span!`, and task
// dispatch, context lifecycle and message delivery are logged with the
// structured macros defined below, so a subscriber can filter by worker id
// or task id.
//
// # Usage
//
// ```rust
// use scriptpool::logging;
//
// // INFO level, human-readable console output
// logging::init_default();
//
// // Or customise
// logging::init(logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     target_filters: Some("scriptpool::thread::worker=trace".to_string()),
//     ..Default::default()
// });
// ```
//
// Only the first initialisation call takes effect; later calls are no-ops,
// which keeps `init_test()` safe to call from every test.

use std::io;
use std::sync::Once;

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, registry::LookupSpan, EnvFilter, Layer};

/// Configuration for the logging subscriber.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Emit JSON lines instead of human-readable text
    pub json_format: bool,
    /// Include file and line information
    pub show_file_line: bool,
    /// Include thread name and id; worker threads are named after their id
    pub show_thread_info: bool,
    /// Include timestamps
    pub show_time: bool,
    /// Extra filter directives, e.g. `"scriptpool=debug,scriptpool::thread::bridge=trace"`
    pub target_filters: Option<String>,
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
        }
    }
}

static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(filters) = &config.target_filters {
        for directive in filters.split(',') {
            if let Ok(directive) = directive.trim().parse() {
                filter = filter.add_directive(directive);
            }
        }
    }
    filter
}

fn console_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_ansi(atty::is(atty::Stream::Stdout))
        .with_file(config.show_file_line)
        .with_line_number(config.show_file_line)
        .with_thread_names(config.show_thread_info)
        .with_thread_ids(config.show_thread_info);

    match (config.json_format, config.show_time) {
        (true, _) => layer.json().flatten_event(true).boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    }
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Install the global subscriber. Only the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer(&config));
        set_global_subscriber(subscriber);
    });
}

/// Open `path` for appending, creating it if needed.
pub fn file_writer(path: &str) -> io::Result<Box<dyn io::Write + Send + Sync + 'static>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(Box::new(file))
}

/// Log to the console and append plain text to `log_file`.
///
/// The file is opened up front so that a bad path is reported to the caller
/// instead of silently falling back to stderr.
pub fn init_with_file(config: LogConfig, log_file: &str) -> io::Result<()> {
    file_writer(log_file)?;

    INIT.call_once(|| {
        let path = log_file.to_string();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || match file_writer(&path) {
                Ok(writer) => writer,
                Err(_) => Box::new(io::stderr()),
            })
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer(&config))
            .with(file_layer);
        set_global_subscriber(subscriber);
    });
    Ok(())
}

/// INFO level, human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG level with worker and bridge internals at TRACE.
pub fn init_development() {
    init(LogConfig {
        level: Level::DEBUG,
        target_filters: Some(
            "scriptpool=debug,scriptpool::thread::worker=trace,scriptpool::thread::bridge=trace"
                .to_string(),
        ),
        ..Default::default()
    });
}

/// JSON output for log aggregation, without source locations.
pub fn init_production() {
    init(LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        ..Default::default()
    });
}

/// Warnings and errors only, compact output.
pub fn init_test() {
    init(LogConfig {
        level: Level::WARN,
        show_thread_info: false,
        show_time: false,
        ..Default::default()
    });
}

/// The dispatcher active on the calling thread.
///
/// Worker threads are spawned with the creator's dispatcher so that a
/// scoped (non-global) subscriber still sees their events.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}

/// Span covering the whole life of one worker thread.
///
/// ```ignore
/// let span = scriptpool::worker_span!(3usize);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! worker_span {
    ($worker_id:expr) => {
        ::tracing::info_span!("worker", id = %$worker_id)
    };
    ($worker_id:expr, $($fields:tt)*) => {
        ::tracing::info_span!("worker", id = %$worker_id, $($fields)*)
    };
}

/// Span covering one task execution on a worker.
#[macro_export]
macro_rules! task_span {
    ($task_id:expr) => {
        ::tracing::debug_span!("task", id = %$task_id)
    };
    ($task_id:expr, $($fields:tt)*) => {
        ::tracing::debug_span!("task", id = %$task_id, $($fields)*)
    };
}

/// Task lifecycle events: prepared, started, completed, timed out.
#[macro_export]
macro_rules! log_task {
    ($task_id:expr, $event:expr) => {
        ::tracing::debug!(task_id = %$task_id, event = $event);
    };
    ($task_id:expr, $event:expr, $($fields:tt)*) => {
        ::tracing::debug!(task_id = %$task_id, event = $event, $($fields)*);
    };
}

/// Worker state changes; these are rare enough to log at INFO.
#[macro_export]
macro_rules! log_worker {
    ($worker_id:expr, $event:expr) => {
        ::tracing::info!(worker_id = %$worker_id, event = $event);
    };
    ($worker_id:expr, $event:expr, $($fields:tt)*) => {
        ::tracing::info!(worker_id = %$worker_id, event = $event, $($fields)*);
    };
}

/// Dispatch decisions made by the pool or the scheduler.
///
/// ```ignore
/// scriptpool::log_scheduler!("pool", "task_queued", queued = 3);
/// ```
#[macro_export]
macro_rules! log_scheduler {
    ($scheduler:expr, $event:expr) => {
        ::tracing::debug!(scheduler = $scheduler, event = $event);
    };
    ($scheduler:expr, $event:expr, $($fields:tt)*) => {
        ::tracing::debug!(scheduler = $scheduler, event = $event, $($fields)*);
    };
}

/// Cross-worker message traffic.
#[macro_export]
macro_rules! log_message {
    ($message_type:expr, $status:expr) => {
        ::tracing::trace!(message_type = %$message_type, status = $status);
    };
    ($message_type:expr, $status:expr, $($fields:tt)*) => {
        ::tracing::trace!(message_type = %$message_type, status = $status, $($fields)*);
    };
}

#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        ::tracing::error!(error = %$error);
    };
    ($error:expr, $($fields:tt)*) => {
        ::tracing::error!(error = %$error, $($fields)*);
    };
}

pub use tracing::{debug, error, info, trace, warn};
