//! Diagnostic log sinks.
//!
//! Engine components receive a [`SharedSink`] at construction and write their
//! trace through it. Nothing here is global: two exports running side by side
//! each keep their own sink and log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Severity of a sink message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Receiver for diagnostic trace lines.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

pub type SharedSink = Arc<dyn LogSink>;

/// Forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }
}

/// Appends timestamped lines to a file.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    /// Create (truncating) the log file, creating parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn log(&self, level: LogLevel, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if let Ok(mut file) = self.file.lock() {
            // A failing log write must not fail the transfer
            let _ = writeln!(file, "{} [{}] {}", stamp, level.as_str(), message);
        }
    }
}

/// Collects lines in memory.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("[{}] {}", level.as_str(), message));
        }
    }
}

/// Adapts a closure, e.g. a UI callback.
pub struct FnSink<F>(pub F);

impl<F> LogSink for FnSink<F>
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, message: &str) {
        (self.0)(level, message)
    }
}

/// Duplicates every line to several sinks.
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl LogSink for FanoutSink {
    fn log(&self, level: LogLevel, message: &str) {
        for sink in &self.sinks {
            sink.log(level, message);
        }
    }
}

/// The default sink: plain `tracing`.
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_levels() {
        let sink = MemorySink::new();
        sink.info("starting");
        sink.warn("slow");
        let lines = sink.lines();
        assert_eq!(lines, vec!["[INFO] starting", "[WARN] slow"]);
        assert!(sink.contains("slow"));
    }

    #[test]
    fn test_fanout_and_fn_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: SharedSink = Arc::new(FnSink(move |lvl: LogLevel, msg: &str| {
            seen_cb.lock().unwrap().push(format!("{}:{}", lvl.as_str(), msg));
        }));
        let mem = Arc::new(MemorySink::new());
        let fan = FanoutSink::new(vec![cb, mem.clone()]);
        fan.error("boom");
        assert_eq!(seen.lock().unwrap().as_slice(), ["ERROR:boom"]);
        assert!(mem.contains("boom"));
    }

    #[test]
    fn test_file_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("export_log.txt");
        let sink = FileSink::create(&path).unwrap();
        sink.info("hello file");
        drop(sink);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[INFO] hello file"));
    }
}
