use std::borrow::Cow;
use std::panic::Location;

/// Destination for exchange records and the middleware's own diagnostics.
///
/// A sink is built once at startup and shared by every worker, so it must be
/// safe to call from many requests at the same time. Every call to
/// [`emit`](Sink::emit) is one atomic write: two records never interleave.
/// Emission is fire-and-forget, a failing destination must not fail the request.
pub trait Sink: Send + Sync {
    fn emit(&self, level: log::Level, message: &str);

    /// Flush buffered output. Call it on shutdown.
    fn flush(&self) {}
}

/// [`Sink`] that hands messages to whatever logger is installed behind the
/// `log` facade.
///
/// # Examples
/// ```rust
/// use actix_web_middleware_exchange_log::LogSink;
///
/// let sink = LogSink::default().target("http_exchange");
/// ```
#[derive(Debug, Clone)]
pub struct LogSink {
    target: Cow<'static, str>,
}

impl LogSink {
    /// Sets the logging target.
    ///
    /// By default, the target is `actix_web_middleware_exchange_log::recorder`.
    pub fn target(mut self, target: impl Into<Cow<'static, str>>) -> Self {
        self.target = target.into();
        self
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink {
            target: Cow::Borrowed("actix_web_middleware_exchange_log::recorder"),
        }
    }
}

impl Sink for LogSink {
    #[track_caller]
    fn emit(&self, level: log::Level, message: &str) {
        let loc = Location::caller();

        log::logger().log(
            &log::Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target(self.target.as_ref())
                .module_path_static(Some(module_path!()))
                .file_static(Some(loc.file()))
                .line(Some(loc.line()))
                .build(),
        );
    }

    fn flush(&self) {
        log::logger().flush();
    }
}
