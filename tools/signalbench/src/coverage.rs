use crate::errors::SignalBenchError;
use crate::logging::RunLogger;
use crate::runtime::FileSystem;
use crate::types::TopicStatus;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;

pub const CSV_HEADER: &str = "topic,payload_type,status";
const PAYLOAD_TYPE: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    NotRunning,
    Unexpected,
    AlreadyObserved,
    Discovered,
    MissingSchema,
    InvalidPayload,
}

pub struct CoverageTracker {
    expected: Vec<String>,
    expected_set: HashSet<String>,
    observed: Vec<String>,
    observed_set: HashSet<String>,
    accepting: bool,
    messages_seen: u64,
    log: RunLogger,
}

impl CoverageTracker {
    pub fn new(expected: Vec<String>, log: RunLogger) -> Self {
        let mut expected_set = HashSet::new();
        let expected = expected
            .into_iter()
            .filter(|topic| expected_set.insert(topic.clone()))
            .collect();
        Self {
            expected,
            expected_set,
            observed: Vec::new(),
            observed_set: HashSet::new(),
            accepting: false,
            messages_seen: 0,
            log,
        }
    }

    pub fn expected(&self) -> &[String] {
        &self.expected
    }

    pub fn observed(&self) -> &[String] {
        &self.observed
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn messages_seen(&self) -> u64 {
        self.messages_seen
    }

    /// Clears the previous run and starts counting observations.
    pub fn begin_run(&mut self) {
        self.observed.clear();
        self.observed_set.clear();
        self.messages_seen = 0;
        self.accepting = true;
    }

    /// Freezes the record; later deliveries are ignored.
    pub fn finish(&mut self) {
        self.accepting = false;
    }

    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Observation {
        if !self.accepting {
            self.log
                .debug("tester.topic.ignored", json!({ "topic": topic, "reason": "not running" }));
            return Observation::NotRunning;
        }
        if !self.expected_set.contains(topic) {
            self.log.warn("tester.topic.unexpected", json!({ "topic": topic }));
            return Observation::Unexpected;
        }

        self.messages_seen += 1;
        if self.observed_set.contains(topic) {
            return Observation::AlreadyObserved;
        }

        let value = match serde_json::from_slice::<Value>(payload) {
            Ok(value) => value,
            Err(err) => {
                self.log.warn(
                    "tester.payload.invalid",
                    json!({ "topic": topic, "error": err.to_string() }),
                );
                return Observation::InvalidPayload;
            }
        };
        if !has_schema(&value) {
            self.log
                .warn("tester.payload.missing_schema", json!({ "topic": topic }));
            return Observation::MissingSchema;
        }

        self.observed.push(topic.to_string());
        self.observed_set.insert(topic.to_string());
        self.log.info(
            "tester.topic.discovered",
            json!({ "topic": topic, "schema": schema_of(&value) }),
        );
        Observation::Discovered
    }

    pub fn coverage_percent(&self) -> Option<f64> {
        percent(self.observed.len(), self.expected.len())
    }

    pub fn finalize(&self) -> Result<CoverageReport, SignalBenchError> {
        if self.expected.is_empty() {
            return Err(SignalBenchError::EmptyExpectedSet);
        }
        let rows = self
            .expected
            .iter()
            .map(|topic| ReportRow {
                topic: topic.clone(),
                status: if self.observed_set.contains(topic) {
                    TopicStatus::Ok
                } else {
                    TopicStatus::Nok
                },
            })
            .collect::<Vec<_>>();
        let not_found = rows
            .iter()
            .filter(|row| row.status == TopicStatus::Nok)
            .map(|row| row.topic.clone())
            .collect();
        Ok(CoverageReport {
            found: self.observed.len(),
            total: self.expected.len(),
            coverage_percent: percent(self.observed.len(), self.expected.len()).unwrap_or(0.0),
            rows,
            not_found,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub topic: String,
    pub status: TopicStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    pub rows: Vec<ReportRow>,
    pub found: usize,
    pub total: usize,
    pub coverage_percent: f64,
    pub not_found: Vec<String>,
}

impl CoverageReport {
    pub fn render_csv(&self) -> String {
        let mut out = String::new();
        out.push_str(CSV_HEADER);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&format!(
                "{},{},{}\n",
                csv_field(&row.topic),
                PAYLOAD_TYPE,
                row.status.as_str()
            ));
        }
        out.push_str(&format!(
            "\nNumber of MQTT topics found: {} || Total number of MQTT topics in JSON file: {}\n",
            self.found, self.total
        ));
        out.push_str(&format!("Test coverage: {:.1} %\n", self.coverage_percent));
        out.push_str("\nTopics which were not found:\n");
        for topic in &self.not_found {
            out.push_str(topic);
            out.push('\n');
        }
        out
    }
}

pub fn write_report(
    fs: &dyn FileSystem,
    path: &Path,
    report: &CoverageReport,
) -> Result<(), SignalBenchError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs.create_dir_all(parent)?;
        }
    }
    fs.write_string(path, &report.render_csv())
}

/// A payload counts when its record (the first element if it is an array)
/// carries a non-empty `schema` field.
pub fn has_schema(payload: &Value) -> bool {
    match schema_of(payload) {
        None | Some(Value::Null) => false,
        Some(Value::Object(fields)) => !fields.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(text)) => !text.is_empty(),
        Some(_) => true,
    }
}

fn schema_of(payload: &Value) -> Option<&Value> {
    let record = match payload {
        Value::Array(items) => items.first()?,
        other => other,
    };
    record.get("schema")
}

fn percent(found: usize, total: usize) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((1000.0 * found as f64 / total as f64).round() / 10.0)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
