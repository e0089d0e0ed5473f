//! Trace descriptor loading and publish cadence derivation.
//!
//! A trace file looks like:
//!
//! ```json
//! { "trace": [ { "traceLengthSeconds": 60, "topics": [
//!     { "topic": "mqtt/DME/Torque_1_KCAN", "count": 60, "result": [ { "schema": {} } ] }
//! ] } ] }
//! ```
//!
//! All cadence arithmetic is done in tenths of a second so that one player
//! tick maps to exactly one unit.

use crate::errors::SignalBenchError;
use crate::runtime::FileSystem;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

pub const TENTHS_PER_SECOND: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceTopic {
    pub name: String,
    pub target_count: u32,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceDescriptor {
    pub topics: Vec<TraceTopic>,
    pub total_duration_seconds: f64,
    schedule: PublishSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTopic {
    pub topic_index: usize,
    pub period_tenths: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSchedule {
    entries: Vec<ScheduledTopic>,
    duration_tenths: u64,
}

impl PublishSchedule {
    pub fn entries(&self) -> &[ScheduledTopic] {
        &self.entries
    }

    pub fn duration_tenths(&self) -> u64 {
        self.duration_tenths
    }

    /// Indexes of the topics due on `tick`. Tick zero is never due; every
    /// topic fires on tick 1 and then once per period.
    pub fn due_at(&self, tick: u64) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .filter(move |entry| tick > 0 && (tick - 1) % entry.period_tenths == 0)
            .map(|entry| entry.topic_index)
    }
}

impl TraceDescriptor {
    pub fn schedule(&self) -> &PublishSchedule {
        &self.schedule
    }

    pub fn period_seconds(&self, topic_index: usize) -> Option<f64> {
        self.schedule
            .entries
            .iter()
            .find(|entry| entry.topic_index == topic_index)
            .map(|entry| entry.period_tenths as f64 / TENTHS_PER_SECOND as f64)
    }

    /// Topic names starting with `prefix`, de-duplicated in trace order.
    pub fn expected_topics(&self, prefix: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.topics
            .iter()
            .filter(|topic| topic.name.starts_with(prefix))
            .filter(|topic| seen.insert(topic.name.clone()))
            .map(|topic| topic.name.clone())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawTraceFile {
    trace: Option<Vec<RawTrace>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrace {
    trace_length_seconds: Option<f64>,
    topics: Option<Vec<RawTopic>>,
}

#[derive(Debug, Deserialize)]
struct RawTopic {
    topic: Option<String>,
    count: Option<i64>,
    result: Option<Value>,
}

pub fn load_trace(fs: &dyn FileSystem, path: &Path) -> Result<TraceDescriptor, SignalBenchError> {
    let text = fs
        .read_to_string(path)
        .map_err(|e| SignalBenchError::TraceNotFound(format!("{}: {e}", path.display())))?;
    parse_trace(&text)
        .map_err(|e| match e {
            SignalBenchError::MalformedTrace(reason) => {
                SignalBenchError::MalformedTrace(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
}

pub fn parse_trace(text: &str) -> Result<TraceDescriptor, SignalBenchError> {
    let raw: RawTraceFile =
        serde_json::from_str(text).map_err(|e| SignalBenchError::MalformedTrace(e.to_string()))?;
    let first = raw
        .trace
        .and_then(|entries| entries.into_iter().next())
        .ok_or_else(|| malformed("`trace` must be a non-empty array"))?;

    let total_duration_seconds = first
        .trace_length_seconds
        .ok_or_else(|| malformed("missing `traceLengthSeconds`"))?;
    if !total_duration_seconds.is_finite() || total_duration_seconds <= 0.0 {
        return Err(malformed(&format!(
            "`traceLengthSeconds` must be greater than zero, got {total_duration_seconds}"
        )));
    }

    let raw_topics = first.topics.ok_or_else(|| malformed("missing `topics`"))?;
    let mut topics = Vec::with_capacity(raw_topics.len());
    for (idx, raw_topic) in raw_topics.into_iter().enumerate() {
        let name = raw_topic
            .topic
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| malformed(&format!("topic #{idx}: missing `topic`")))?;
        let count = raw_topic
            .count
            .ok_or_else(|| malformed(&format!("topic `{name}`: missing `count`")))?;
        if count <= 0 {
            return Err(malformed(&format!(
                "topic `{name}`: `count` must be at least 1, got {count}"
            )));
        }
        let target_count = u32::try_from(count)
            .map_err(|_| malformed(&format!("topic `{name}`: `count` {count} is too large")))?;
        let payload = raw_topic
            .result
            .ok_or_else(|| malformed(&format!("topic `{name}`: missing `result`")))?;
        topics.push(TraceTopic {
            name,
            target_count,
            payload,
        });
    }

    let schedule = derive_schedule(&topics, total_duration_seconds)?;
    Ok(TraceDescriptor {
        topics,
        total_duration_seconds,
        schedule,
    })
}

/// Period of a topic in tenths of a second: the trace length divided by the
/// repeat count, rounded to one decimal.
pub fn period_tenths(total_duration_seconds: f64, target_count: u32) -> u64 {
    let tenths = total_duration_seconds * TENTHS_PER_SECOND as f64 / f64::from(target_count);
    tenths.round() as u64
}

fn derive_schedule(
    topics: &[TraceTopic],
    total_duration_seconds: f64,
) -> Result<PublishSchedule, SignalBenchError> {
    let mut entries = Vec::with_capacity(topics.len());
    for (topic_index, topic) in topics.iter().enumerate() {
        let period = period_tenths(total_duration_seconds, topic.target_count);
        if period == 0 {
            return Err(malformed(&format!(
                "topic `{}`: {} repeats in {total_duration_seconds}s gives a period below 0.1s",
                topic.name, topic.target_count
            )));
        }
        entries.push(ScheduledTopic {
            topic_index,
            period_tenths: period,
        });
    }
    Ok(PublishSchedule {
        entries,
        duration_tenths: (total_duration_seconds * TENTHS_PER_SECOND as f64).round() as u64,
    })
}

fn malformed(reason: &str) -> SignalBenchError {
    SignalBenchError::MalformedTrace(reason.to_string())
}
