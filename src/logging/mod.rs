use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn label(self, colored: bool) -> &'static str {
        match (self, colored) {
            (Self::Error, false) => "ERROR",
            (Self::Warn, false) => "WARN",
            (Self::Info, false) => "INFO",
            (Self::Debug, false) => "DEBUG",
            (Self::Verbose, false) => "VERBOSE",
            (Self::Error, true) => "\x1b[31mERROR\x1b[0m",
            (Self::Warn, true) => "\x1b[33mWARN\x1b[0m",
            (Self::Info, true) => "\x1b[32mINFO\x1b[0m",
            (Self::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
            (Self::Verbose, true) => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

/// Destination for fully rendered log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Line logger shared by the pool and every worker thread.
///
/// Cloning is cheap: clones share the sink, so lines from concurrent workers
/// interleave at line granularity only.
#[derive(Clone)]
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn verbose(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Verbose, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut line = format!("{timestamp} [{}]", level.label(self.config.human_friendly));
        if let Some(ctx) = context.filter(|ctx| !ctx.is_empty()) {
            line.push_str(&format!(" [{ctx}]"));
        }
        line.push(' ');
        line.push_str(message);
        if let Some(value) = payload {
            line.push_str(&format!(" payload={value}"));
        }

        self.sink.write_line(&line);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::{LogLevel, LogSink, Logger, LoggerConfig};

    #[derive(Default)]
    pub struct MemorySink {
        lines: Mutex<Vec<String>>,
    }

    impl MemorySink {
        pub fn lines(&self) -> Vec<String> {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .clone()
        }
    }

    impl LogSink for MemorySink {
        fn write_line(&self, line: &str) {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .push(line.to_owned());
        }
    }

    pub fn memory_logger(min_level: LogLevel) -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level,
                human_friendly: false,
            },
            sink.clone(),
        );
        (logger, sink)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::memory_logger;
    use super::{LogLevel, LoggerConfig};

    #[test]
    fn default_config_is_plain_info_level() {
        let config = LoggerConfig::default();
        assert_eq!(config.min_level, LogLevel::Info);
        assert!(!config.human_friendly);
    }

    #[test]
    fn parses_config_level_names() {
        assert_eq!(LogLevel::from_config_value("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_config_value(" WARN "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config_value("trace"), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::from_config_value("loud"), None);
    }

    #[test]
    fn threshold_drops_more_verbose_lines() {
        let (logger, sink) = memory_logger(LogLevel::Debug);

        logger.debug(Some("tests::logger"), "debug message");
        logger.verbose(Some("tests::logger"), "verbose message");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[DEBUG]"));
        assert!(!logger.enabled(LogLevel::Verbose));
    }

    #[test]
    fn renders_context_and_json_payload() {
        let (logger, sink) = memory_logger(LogLevel::Info);

        logger.log(
            LogLevel::Info,
            Some("pool::broadcast"),
            "stop broadcast",
            Some(json!({"user":"oss","stops_sent":2})),
        );

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO] [pool::broadcast] stop broadcast"));
        assert!(lines[0].contains("payload={\"stops_sent\":2,\"user\":\"oss\"}"));
        assert!(lines[0].starts_with("20"));
    }

    #[test]
    fn clones_share_the_same_sink() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        let clone = logger.clone();

        logger.warn(None, "from original");
        clone.error(Some(""), "from clone");

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[WARN] from original"));
        assert!(lines[1].contains("[ERROR] from clone"));
    }
}
