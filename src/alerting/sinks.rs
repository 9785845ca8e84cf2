//! Alert output sinks.
//!
//! Three sinks: colored console, rolling text log, rolling JSON log
//! (one wire-format object per line). Sink failures are counted by
//! the alert manager and never propagate into the pipeline.

use std::io::Write;
use std::path::Path;

use colored::Colorize;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::config::SinkKind;
use crate::error::{IdsError, Result};
use crate::types::{Alert, Severity};

pub trait AlertSink {
    fn kind(&self) -> SinkKind;
    fn emit(&mut self, alert: &Alert) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Writes colored one-liners to stdout.
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for ConsoleSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Console
    }

    fn emit(&mut self, alert: &Alert) -> Result<()> {
        let severity = alert.severity.to_string().to_uppercase();
        let severity = match alert.severity {
            Severity::Low => severity.green(),
            Severity::Medium => severity.yellow(),
            Severity::High => severity.red(),
            Severity::Critical => severity.red().bold(),
        };
        println!(
            "[{:12.6}] [{severity}] {} {}: {}",
            alert.timestamp,
            format!("{:#x}", alert.can_id),
            alert.alert_type,
            alert.details
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        std::io::stdout()
            .flush()
            .map_err(|e| IdsError::Sink(format!("console flush: {e}")))
    }
}

/// Appends human-readable lines to a daily-rolling text log.
pub struct TextLogSink {
    appender: RollingFileAppender,
}

impl TextLogSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            appender: RollingFileAppender::new(Rotation::DAILY, dir, "alerts.log"),
        }
    }
}

impl AlertSink for TextLogSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Text
    }

    fn emit(&mut self, alert: &Alert) -> Result<()> {
        let context = serde_json::Value::Object(alert.context.clone());
        writeln!(
            self.appender,
            "{} [{}] id={:#x} type={} details={} context={}",
            chrono::Utc::now().to_rfc3339(),
            alert.severity.to_string().to_uppercase(),
            alert.can_id,
            alert.alert_type,
            alert.details,
            context,
        )
        .map_err(|e| IdsError::Sink(format!("text log: {e}")))
    }

    fn flush(&mut self) -> Result<()> {
        self.appender
            .flush()
            .map_err(|e| IdsError::Sink(format!("text log flush: {e}")))
    }
}

/// Appends one wire-format JSON object per line to a daily-rolling
/// log.
pub struct JsonLogSink {
    appender: RollingFileAppender,
}

impl JsonLogSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            appender: RollingFileAppender::new(Rotation::DAILY, dir, "alerts.json"),
        }
    }
}

impl AlertSink for JsonLogSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Json
    }

    fn emit(&mut self, alert: &Alert) -> Result<()> {
        let line = serde_json::to_string(&alert.to_wire())?;
        writeln!(self.appender, "{line}").map_err(|e| IdsError::Sink(format!("json log: {e}")))
    }

    fn flush(&mut self) -> Result<()> {
        self.appender
            .flush()
            .map_err(|e| IdsError::Sink(format!("json log flush: {e}")))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Captures emitted alerts for assertions; can be told to fail.
    pub struct RecordingSink {
        pub kind: SinkKind,
        pub emitted: Arc<Mutex<Vec<Alert>>>,
        pub fail: bool,
    }

    impl RecordingSink {
        pub fn new(kind: SinkKind) -> (Self, Arc<Mutex<Vec<Alert>>>) {
            let emitted = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    kind,
                    emitted: emitted.clone(),
                    fail: false,
                },
                emitted,
            )
        }
    }

    impl AlertSink for RecordingSink {
        fn kind(&self) -> SinkKind {
            self.kind
        }

        fn emit(&mut self, alert: &Alert) -> Result<()> {
            if self.fail {
                return Err(IdsError::Sink("injected failure".into()));
            }
            self.emitted.lock().unwrap().push(alert.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
