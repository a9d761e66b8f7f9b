//! Leveled print macros for the runtime.
//!
//! Line-atomic output behind a mutex, with the level read from an
//! atomic so disabled levels cost one load. The sink is `stderr` until
//! the runtime installs one from its configuration: the sentinels
//! `"stdout"`/`"stderr"`, or a file path opened for append with a
//! buffered writer sized by the configured log buffer size. Errors and
//! warnings always flush; lower levels flush when `SVCMUX_LOG_FLUSH`
//! is set.
//!
//! # Environment Variables
//!
//! - `SVCMUX_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace
//! - `SVCMUX_LOG_FLUSH=1` - flush after every line
//!
//! # Usage
//!
//! ```ignore
//! use svcmux_core::{svc_info, svc_warn};
//!
//! svc_info!("worker {} started", index);
//! svc_warn!("unexpected state: {:?}", state);
//! ```

use std::fs::OpenOptions;
use std::io::{BufWriter, Stderr, Stdout, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// Log levels, lowest to most verbose.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn parse(s: &str) -> LogLevel {
        match s.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ALWAYS: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

enum Sink {
    Stderr(Stderr),
    Stdout(Stdout),
    File(BufWriter<std::fs::File>),
}

impl Sink {
    fn write_line(&mut self, prefix: &str, args: std::fmt::Arguments<'_>, flush: bool) {
        match self {
            Sink::Stderr(s) => {
                let mut h = s.lock();
                let _ = write!(h, "{} ", prefix);
                let _ = h.write_fmt(args);
                let _ = h.write_all(b"\n");
                if flush {
                    let _ = h.flush();
                }
            }
            Sink::Stdout(s) => {
                let mut h = s.lock();
                let _ = write!(h, "{} ", prefix);
                let _ = h.write_fmt(args);
                let _ = h.write_all(b"\n");
                if flush {
                    let _ = h.flush();
                }
            }
            Sink::File(w) => {
                let _ = write!(w, "{} ", prefix);
                let _ = w.write_fmt(args);
                let _ = w.write_all(b"\n");
                if flush {
                    let _ = w.flush();
                }
            }
        }
    }

    fn flush(&mut self) {
        match self {
            Sink::Stderr(s) => {
                let _ = s.lock().flush();
            }
            Sink::Stdout(s) => {
                let _ = s.lock().flush();
            }
            Sink::File(w) => {
                let _ = w.flush();
            }
        }
    }
}

static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();

fn sink() -> &'static Mutex<Sink> {
    SINK.get_or_init(|| Mutex::new(Sink::Stderr(std::io::stderr())))
}

/// Read level and flush mode from the environment. Called lazily on
/// first log; call explicitly for deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(val) = std::env::var("SVCMUX_LOG_LEVEL") {
        LOG_LEVEL.store(LogLevel::parse(&val) as u8, Ordering::Relaxed);
    }
    if let Ok(val) = std::env::var("SVCMUX_LOG_FLUSH") {
        let on = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ALWAYS.store(on, Ordering::Relaxed);
    }
}

/// Install the configured sink: `"stdout"`, `"stderr"`, or a file path
/// opened for append. A file sink buffers `buf_size` bytes between
/// flushes. An unopenable path falls back to stderr.
pub fn init_sink(target: &str, buf_size: usize) {
    init();
    let s = match target {
        "stderr" | "" => Sink::Stderr(std::io::stderr()),
        "stdout" => Sink::Stdout(std::io::stdout()),
        path => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Sink::File(BufWriter::with_capacity(buf_size, f)),
            Err(e) => {
                eprintln!("[ERROR] cannot open log file {}: {}; using stderr", path, e);
                Sink::Stderr(std::io::stderr())
            }
        },
    };
    if let Ok(mut g) = sink().lock() {
        g.flush();
        *g = s;
    }
}

/// Flush any buffered output. Called at runtime teardown.
pub fn flush() {
    if let Ok(mut s) = sink().lock() {
        s.flush();
    }
}

/// Current log level.
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set the level programmatically.
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check whether a level is enabled.
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: leveled line write.
#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let flush = level <= LogLevel::Warn || FLUSH_ALWAYS.load(Ordering::Relaxed);
    if let Ok(mut s) = sink().lock() {
        s.write_line(level.prefix(), args, flush);
    }
}

/// Error level log
#[macro_export]
macro_rules! svc_error {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! svc_warn {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! svc_info {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! svc_debug {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! svc_trace {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("5"), LogLevel::Trace);
        assert_eq!(LogLevel::parse("garbage"), LogLevel::Info);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        svc_error!("error {}", 1);
        svc_warn!("warn");
        svc_info!("info");
        svc_debug!("debug");
        svc_trace!("trace");
        set_log_level(LogLevel::Info);
    }
}
