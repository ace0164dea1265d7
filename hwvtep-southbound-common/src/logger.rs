use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use std::sync::{Arc, Mutex};
use tracing::{subscriber::set_global_default, Level, Metadata, Subscriber};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn,
    fmt,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    Layer, Registry,
};

/// Process logger: console plus a daily rolling file, sharing one level that
/// can be changed at runtime.
pub struct Logger {
    level: Arc<Mutex<Level>>,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(level: Option<Level>) -> Self {
        Logger {
            level: Arc::new(Mutex::new(level.unwrap_or(Level::INFO))),
            _file_guard: None,
        }
    }

    /// Applies to both console and file output immediately.
    #[inline]
    pub fn set_level(&self, new_level: Level) {
        *self.level.lock().unwrap() = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *self.level.lock().unwrap()
    }

    /// Whether an event at `level` currently passes the filter.
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.get_level()
    }

    fn level_filter<S>(&self) -> DynFilterFn<S, impl Fn(&Metadata<'_>, &Context<'_, S>) -> bool>
    where
        S: Subscriber,
    {
        let level = Arc::clone(&self.level);
        DynFilterFn::new(move |metadata, _| metadata.level() <= &*level.lock().unwrap())
    }

    fn console_layer<S>(&self) -> impl Layer<S> + Send + Sync
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        #[cfg(debug_assertions)]
        let layer = fmt::layer()
            .pretty()
            .with_writer(std::io::stdout)
            .with_file(true)
            .with_line_number(true);

        #[cfg(not(debug_assertions))]
        let layer = fmt::layer().compact().with_writer(std::io::stdout);

        layer.with_filter(self.level_filter())
    }

    /// Console and file layers on a fresh registry, without installing it.
    /// The file writer stays flushing for as long as this logger lives.
    pub fn subscriber(
        &mut self,
        log_dir: &str,
        file_name: &str,
    ) -> impl Subscriber + Send + Sync + for<'a> LookupSpan<'a> {
        let (writer, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, file_name));
        self._file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_filter(self.level_filter());

        Registry::default()
            .with(self.console_layer())
            .with(file_layer)
    }

    /// Install as the global subscriber. Fails if one is already installed.
    pub fn initialize(&mut self, log_dir: &str, file_name: &str) -> SouthboundResult<()> {
        let subscriber = self.subscriber(log_dir, file_name);
        set_global_default(subscriber)
            .map_err(|e| SouthboundError::from(format!("Failed to set logger: {e}")))
    }
}
