use std::fmt::Arguments;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity levels for log messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Interface for structured logging and event tracing.
///
/// Planner phases report what they decided through [`LoggerAndTracer::event`]
/// using the format:
///
/// `event: <action>, key1=value1, key2=value2`
///
/// Example:
/// `event: multiplanning done, candidates=3, winner=1, works=12`
pub trait LoggerAndTracer: Send + Sync {
    /// Logs a formatted message at the specified level.
    fn log(&self, level: LogLevel, context: &'static str, msg: Arguments);

    /// Emits a trace event message.
    fn event(&self, context: &'static str, event: Arguments);

    /// Returns `true` if tracing events are enabled.
    fn is_tracing_enabled(&self) -> bool;

    /// Returns `true` if the given log level is currently enabled.
    fn level_enabled(&self, level: LogLevel) -> bool;
}

#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::obs::logger::LogLevel::Debug, module_path!(), format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::obs::logger::LogLevel::Info, module_path!(), format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::obs::logger::LogLevel::Warn, module_path!(), format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::obs::logger::LogLevel::Error, module_path!(), format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! event {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.is_tracing_enabled() {
            $logger.event(module_path!(), format_args!($($arg)*));
        }
    };
}

/// Prints messages to stdout with timestamps and thread ids.
pub struct StdoutLogger {
    pub min_level: LogLevel,
    pub tracing_enabled: bool,
}

impl StdoutLogger {
    pub fn new(min_level: LogLevel, tracing_enabled: bool) -> Arc<Self> {
        Arc::new(StdoutLogger { min_level, tracing_enabled })
    }

    fn now_micros() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default()
    }
}

impl LoggerAndTracer for StdoutLogger {
    fn log(&self, level: LogLevel, context: &'static str, msg: Arguments) {
        if self.level_enabled(level) {
            println!(
                "[{:?}] [{}] [thread={:?}] [{}] {}",
                level,
                Self::now_micros(),
                std::thread::current().id(),
                context,
                msg
            );
        }
    }

    fn event(&self, context: &'static str, event: Arguments) {
        if self.tracing_enabled {
            println!(
                "[TRACE] [{}] [thread={:?}] [{}] {}",
                Self::now_micros(),
                std::thread::current().id(),
                context,
                event
            );
        }
    }

    fn is_tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }

    fn level_enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }
}

#[derive(Default)]
pub struct NoOpLogger;

impl LoggerAndTracer for NoOpLogger {
    fn log(&self, _level: LogLevel, _context: &'static str, _msg: Arguments) {}

    fn event(&self, _context: &'static str, _event: Arguments) {}

    fn is_tracing_enabled(&self) -> bool {
        false
    }

    fn level_enabled(&self, _level: LogLevel) -> bool {
        false
    }
}

/// Keeps every message and event in memory so that they can be inspected.
#[derive(Default)]
pub struct CapturingLogger {
    lines: Mutex<Vec<String>>,
}

impl CapturingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(CapturingLogger::default())
    }

    /// Returns the captured lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Returns the captured events whose action matches `action`.
    pub fn events(&self, action: &str) -> Vec<String> {
        let prefix = format!("event: {}", action);
        self.lines()
            .into_iter()
            .filter(|line| line.starts_with(&prefix))
            .collect()
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }
}

impl LoggerAndTracer for CapturingLogger {
    fn log(&self, level: LogLevel, context: &'static str, msg: Arguments) {
        self.push(format!("[{:?}] [{}] {}", level, context, msg));
    }

    fn event(&self, _context: &'static str, event: Arguments) {
        self.push(event.to_string());
    }

    fn is_tracing_enabled(&self) -> bool {
        true
    }

    fn level_enabled(&self, _level: LogLevel) -> bool {
        true
    }
}

#[cfg(test)]
pub fn test_instance() -> Arc<dyn LoggerAndTracer> {
    StdoutLogger::new(LogLevel::Debug, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;

    #[test]
    fn test_capturing_logger_filters_events() {
        let logger = CapturingLogger::new();
        event!(logger, "event: multiplanning done, candidates={}", 2);
        event!(logger, "event: plan cache hit, key={:x}", 10);
        crate::info!(logger, "hello {}", "world");

        assert_eq!(logger.events("multiplanning done"), vec!["event: multiplanning done, candidates=2"]);
        assert_eq!(logger.lines().len(), 3);
    }

    #[test]
    fn test_stdout_logger_levels() {
        let logger = StdoutLogger::new(LogLevel::Warn, false);
        assert!(!logger.level_enabled(LogLevel::Info));
        assert!(logger.level_enabled(LogLevel::Error));
        assert!(!logger.is_tracing_enabled());
    }
}
