use crate::errors::SignalBenchError;
use crate::log_retention::enforce_total_budget;
use crate::runtime::Terminal;
use crate::types::LogLevel;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub component: &'a str,
    pub level: LogLevel,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), SignalBenchError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| SignalBenchError::Io(e.to_string()))?;
            }
        }
        let line = serde_json::to_string(&LogEvent {
            component: event.component,
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| SignalBenchError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SignalBenchError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| SignalBenchError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| SignalBenchError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = enforce_total_budget(parent, self.budget_bytes, &self.path)?;
            }
        }

        Ok(())
    }
}

/// Logging capability handed to every component at construction.
///
/// Records go to the terminal as one structured line and, when a sink is
/// attached, to a JSONL file. Failures never reach the caller.
#[derive(Clone)]
pub struct RunLogger {
    component: String,
    min_level: LogLevel,
    terminal: Arc<dyn Terminal>,
    sink: Option<JsonlLogger>,
}

impl RunLogger {
    pub fn new(component: &str, min_level: LogLevel, terminal: Arc<dyn Terminal>) -> Self {
        Self {
            component: component.to_string(),
            min_level,
            terminal,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: JsonlLogger) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn for_component(&self, component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..self.clone()
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn log(&self, level: LogLevel, event_type: &str, payload: Value) {
        if level < self.min_level {
            return;
        }
        let line = structured_line(&self.component, level, event_type, &payload);
        let _ = self.terminal.write_line(&line);

        if let Some(sink) = &self.sink {
            let event = LogEvent {
                component: &self.component,
                level,
                event_type,
                payload,
            };
            if let Err(err) = sink.append(&event) {
                let _ = self.terminal.write_line(&structured_line(
                    &self.component,
                    LogLevel::Warn,
                    "logging.sink.failed",
                    &Value::String(err.to_string()),
                ));
            }
        }
    }

    pub fn debug(&self, event_type: &str, payload: Value) {
        self.log(LogLevel::Debug, event_type, payload);
    }

    pub fn info(&self, event_type: &str, payload: Value) {
        self.log(LogLevel::Info, event_type, payload);
    }

    pub fn warn(&self, event_type: &str, payload: Value) {
        self.log(LogLevel::Warn, event_type, payload);
    }

    pub fn error(&self, event_type: &str, payload: Value) {
        self.log(LogLevel::Error, event_type, payload);
    }
}

pub fn structured_line(component: &str, level: LogLevel, event_type: &str, payload: &Value) -> String {
    let rendered = match payload {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    format!(
        "component={component} level={} event={event_type} payload={} ",
        level.as_str(),
        rendered.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
