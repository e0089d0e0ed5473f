use crate::bus::{drain_inbox, Inbox, MessageBus};
use crate::config::AppConfig;
use crate::coverage::{write_report, CoverageReport, CoverageTracker};
use crate::errors::SignalBenchError;
use crate::logging::RunLogger;
use crate::protocol::PLAYER_STATUS;
use crate::runtime::ProductionRuntime;
use crate::sequencer::{SequencerSettings, StepOutcome, TestSequencer};
use crate::trace::TraceDescriptor;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Topics the tester must see, or `EmptyExpectedSet` when the prefix filter
/// leaves nothing to measure.
pub fn expected_topics(
    cfg: &AppConfig,
    trace: &TraceDescriptor,
) -> Result<Vec<String>, SignalBenchError> {
    let expected = trace.expected_topics(&cfg.tester.topic_prefix);
    if expected.is_empty() {
        return Err(SignalBenchError::EmptyExpectedSet);
    }
    Ok(expected)
}

/// Bus handles and runtime seams one tester run works through.
pub struct TesterContext<'a> {
    pub bus: &'a dyn MessageBus,
    pub inbox: &'a mut Inbox,
    pub runtime: &'a ProductionRuntime,
    pub log: &'a RunLogger,
}

/// Drives one start/observe/stop cycle against the player and writes the
/// coverage report to `report_path`. The bus is closed before returning.
pub fn run_tester(
    cfg: &AppConfig,
    trace_name: &str,
    expected: Vec<String>,
    report_path: &Path,
    mut ctx: TesterContext<'_>,
) -> Result<CoverageReport, SignalBenchError> {
    let result = drive(cfg, trace_name, expected, report_path, &mut ctx);
    if let Err(err) = ctx.bus.close() {
        ctx.log
            .warn("tester.bus.close_failed", json!({ "error": err.to_string() }));
    }
    if let Err(err) = &result {
        ctx.log
            .error("tester.failed", json!({ "error": err.to_string() }));
    }
    result
}

fn drive(
    cfg: &AppConfig,
    trace_name: &str,
    expected: Vec<String>,
    report_path: &Path,
    ctx: &mut TesterContext<'_>,
) -> Result<CoverageReport, SignalBenchError> {
    let (bus, runtime, log) = (ctx.bus, ctx.runtime, ctx.log);
    for topic in &expected {
        bus.subscribe(topic)?;
    }
    bus.subscribe(PLAYER_STATUS)?;

    let settings = SequencerSettings {
        trace_name: trace_name.to_string(),
        speed: cfg.tester.speed,
        poll_interval: Duration::from_millis(cfg.tester.poll_interval_ms),
        settle: Duration::from_millis(cfg.tester.settle_ms),
    };
    let tracker = CoverageTracker::new(expected, log.clone());
    let mut sequencer = TestSequencer::new(settings, tracker, log.clone());

    let interval = Duration::from_millis(cfg.tester.loop_interval_ms.max(1));
    let clock = runtime.clock.as_ref();
    let mut deadline = clock.now();
    let report = loop {
        for message in drain_inbox(&mut *ctx.inbox)? {
            sequencer.on_message(&message);
        }
        if let StepOutcome::Finished(report) = sequencer.step(clock.now(), bus)? {
            break report;
        }
        deadline += interval;
        let now = clock.now();
        if now > deadline {
            deadline = now;
        }
        clock.sleep_until(deadline)?;
    };

    write_report(runtime.file_system.as_ref(), report_path, &report)?;
    log.info(
        "tester.report.written",
        json!({
            "path": report_path.display().to_string(),
            "found": report.found,
            "total": report.total,
            "coverage_percent": report.coverage_percent,
        }),
    );
    if !report.not_found.is_empty() {
        log.info(
            "tester.report.not_found",
            json!({ "topics": report.not_found }),
        );
    }
    Ok(report)
}
