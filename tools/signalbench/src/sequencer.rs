use crate::bus::{BusMessage, MessageBus};
use crate::coverage::{CoverageReport, CoverageTracker};
use crate::errors::SignalBenchError;
use crate::fsm::validate_sequence_transition;
use crate::logging::RunLogger;
use crate::protocol::{decode_status, PlayerCommand, StatusMessage, PLAYER_STATUS};
use crate::types::TestSequenceState;
use serde_json::json;
use std::time::{Duration, SystemTime};

/// Seconds of trace left below which the run is considered over.
pub const END_OF_TRACE_MARGIN_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimer {
    started: SystemTime,
    timeout: Duration,
}

impl PollTimer {
    pub fn start(now: SystemTime, timeout: Duration) -> Self {
        Self {
            started: now,
            timeout,
        }
    }

    pub fn is_elapsed(&self, now: SystemTime) -> bool {
        now.duration_since(self.started)
            .map(|waited| waited >= self.timeout)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequencerSettings {
    pub trace_name: String,
    pub speed: f64,
    pub poll_interval: Duration,
    pub settle: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Continue,
    Finished(CoverageReport),
}

pub struct TestSequencer {
    state: TestSequenceState,
    settings: SequencerSettings,
    tracker: CoverageTracker,
    latest_status: Option<StatusMessage>,
    timer: Option<PollTimer>,
    missed_polls: u32,
    log: RunLogger,
}

impl TestSequencer {
    pub fn new(settings: SequencerSettings, tracker: CoverageTracker, log: RunLogger) -> Self {
        Self {
            state: TestSequenceState::Idle,
            settings,
            tracker,
            latest_status: None,
            timer: None,
            missed_polls: 0,
            log,
        }
    }

    pub fn state(&self) -> TestSequenceState {
        self.state
    }

    pub fn tracker(&self) -> &CoverageTracker {
        &self.tracker
    }

    pub fn missed_polls(&self) -> u32 {
        self.missed_polls
    }

    /// Routes one delivery: status snapshots replace the previous one, every
    /// other topic goes to the coverage tracker.
    pub fn on_message(&mut self, message: &BusMessage) {
        if message.topic == PLAYER_STATUS {
            match decode_status(&message.payload) {
                Ok(status) => self.latest_status = Some(status),
                Err(err) => self
                    .log
                    .warn("tester.status.invalid", json!({ "error": err.to_string() })),
            }
            return;
        }
        self.tracker.on_message(&message.topic, &message.payload);
    }

    pub fn step(
        &mut self,
        now: SystemTime,
        bus: &dyn MessageBus,
    ) -> Result<StepOutcome, SignalBenchError> {
        match self.state {
            TestSequenceState::Idle => {
                if !self.tracker.expected().is_empty() {
                    self.log.info(
                        "tester.sequence.waiting",
                        json!({
                            "trace_name": self.settings.trace_name,
                            "expected_topics": self.tracker.expected().len(),
                        }),
                    );
                    self.timer = Some(PollTimer::start(now, self.settings.settle));
                    self.transition(TestSequenceState::Started)?;
                }
            }
            TestSequenceState::Started => {
                if self.timer.is_some_and(|timer| !timer.is_elapsed(now)) {
                    return Ok(StepOutcome::Continue);
                }
                self.tracker.begin_run();
                self.latest_status = None;
                let command = PlayerCommand::Start {
                    trace_name: self.settings.trace_name.clone(),
                    speed: self.settings.speed,
                };
                if let Err(err) = bus.publish(command.topic(), &command.encode()?) {
                    self.tracker.finish();
                    self.log
                        .warn("tester.start.failed", json!({ "error": err.to_string() }));
                    return Ok(StepOutcome::Continue);
                }
                self.log.info(
                    "tester.player.started",
                    json!({
                        "trace_name": self.settings.trace_name,
                        "speed": self.settings.speed,
                    }),
                );
                self.timer = Some(PollTimer::start(now, self.settings.poll_interval));
                self.transition(TestSequenceState::Running)?;
            }
            TestSequenceState::Running => {
                if self.timer.is_some_and(|timer| !timer.is_elapsed(now)) {
                    return Ok(StepOutcome::Continue);
                }
                self.timer = Some(PollTimer::start(now, self.settings.poll_interval));
                self.poll_status(bus)?;
            }
            TestSequenceState::Stopped => {
                let report = self.tracker.finalize()?;
                return Ok(StepOutcome::Finished(report));
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn poll_status(&mut self, bus: &dyn MessageBus) -> Result<(), SignalBenchError> {
        let Some(status) = self.latest_status.take() else {
            self.missed_polls = self.missed_polls.saturating_add(1);
            self.log.debug(
                "tester.status.missing",
                json!({ "missed_polls": self.missed_polls }),
            );
            return Ok(());
        };

        let remaining = status.remaining_seconds();
        self.log.info(
            "tester.status",
            json!({
                "status": status.status.as_str(),
                "time_remaining": round_tenths(remaining),
                "time_elapsed": round_tenths(status.time_elapsed),
                "coverage_percent": self.tracker.coverage_percent(),
            }),
        );
        if remaining >= END_OF_TRACE_MARGIN_SECS {
            return Ok(());
        }

        let stop = PlayerCommand::Stop;
        if let Err(err) = bus.publish(stop.topic(), &stop.encode()?) {
            self.log
                .warn("tester.stop.failed", json!({ "error": err.to_string() }));
        }
        self.tracker.finish();
        self.log.info(
            "tester.player.stopped",
            json!({ "observed": self.tracker.observed().len() }),
        );
        self.transition(TestSequenceState::Stopped)
    }

    fn transition(&mut self, next: TestSequenceState) -> Result<(), SignalBenchError> {
        validate_sequence_transition(self.state, next)?;
        self.log.debug(
            "tester.sequence.transition",
            json!({ "from": self.state.as_str(), "to": next.as_str() }),
        );
        self.state = next;
        Ok(())
    }
}

fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::{PollTimer, SequencerSettings, StepOutcome, TestSequencer};
    use crate::bus::{BusMessage, FakeBus};
    use crate::coverage::CoverageTracker;
    use crate::logging::RunLogger;
    use crate::protocol::{PlayerCommand, StatusMessage, PLAYER_START, PLAYER_STATUS, PLAYER_STOP};
    use crate::runtime::FakeTerminal;
    use crate::types::{LogLevel, PlayerRunState, TestSequenceState, TopicStatus};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    const GOOD: &[u8] = br#"[ { "schema": { "message": "DME" } } ]"#;

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    fn sequencer(topics: &[&str]) -> (TestSequencer, FakeTerminal) {
        let terminal = FakeTerminal::new();
        let log = RunLogger::new("tester", LogLevel::Debug, Arc::new(terminal.clone()));
        let tracker = CoverageTracker::new(
            topics.iter().map(|t| t.to_string()).collect(),
            log.clone(),
        );
        let settings = SequencerSettings {
            trace_name: "trace-01".to_string(),
            speed: 1.0,
            poll_interval: Duration::from_secs(1),
            settle: Duration::ZERO,
        };
        (TestSequencer::new(settings, tracker, log), terminal)
    }

    fn status(elapsed_ticks: u64, length: f64) -> BusMessage {
        let status = StatusMessage::from_ticks(PlayerRunState::Playing, elapsed_ticks, length);
        BusMessage::new(PLAYER_STATUS, status.encode().expect("encode"))
    }

    fn run_until_running(sequencer: &mut TestSequencer, bus: &FakeBus) {
        sequencer.step(at(0), bus).expect("idle");
        sequencer.step(at(0), bus).expect("started");
        assert_eq!(sequencer.state(), TestSequenceState::Running);
    }

    #[test]
    fn poll_timer_elapses_after_timeout() {
        let timer = PollTimer::start(at(1000), Duration::from_secs(1));
        assert!(!timer.is_elapsed(at(1999)));
        assert!(timer.is_elapsed(at(2000)));
        assert!(!timer.is_elapsed(at(0)));
    }

    #[test]
    fn idle_waits_for_a_topic_list() {
        let (bus, _inbox) = FakeBus::new(8);
        let (mut sequencer, _) = sequencer(&[]);
        for millis in [0, 1000, 2000] {
            assert_eq!(
                sequencer.step(at(millis), &bus).expect("step"),
                StepOutcome::Continue
            );
            assert_eq!(sequencer.state(), TestSequenceState::Idle);
        }
        assert!(bus.published().is_empty());
    }

    #[test]
    fn started_issues_a_tagged_start_command_after_settling() {
        let (bus, _inbox) = FakeBus::new(8);
        let (mut sequencer, _) = sequencer(&["mqtt/a"]);
        sequencer.settings.settle = Duration::from_millis(500);

        sequencer.step(at(0), &bus).expect("idle");
        assert_eq!(sequencer.state(), TestSequenceState::Started);
        sequencer.step(at(200), &bus).expect("settling");
        assert!(bus.published().is_empty());

        sequencer.step(at(500), &bus).expect("start");
        assert_eq!(sequencer.state(), TestSequenceState::Running);
        let sent = bus.published_on(PLAYER_START);
        assert_eq!(sent.len(), 1);
        let command: PlayerCommand = serde_json::from_slice(&sent[0].payload).expect("command");
        assert_eq!(
            command,
            PlayerCommand::Start {
                trace_name: "trace-01".to_string(),
                speed: 1.0
            }
        );
        assert!(sequencer.tracker().is_accepting());
    }

    #[test]
    fn failed_start_publish_is_retried_on_the_next_step() {
        let (bus, _inbox) = FakeBus::new(8);
        bus.fail_topic(PLAYER_START);
        let (mut sequencer, _) = sequencer(&["mqtt/a"]);
        sequencer.step(at(0), &bus).expect("idle");
        sequencer.step(at(0), &bus).expect("start fails");
        assert_eq!(sequencer.state(), TestSequenceState::Started);
        assert!(!sequencer.tracker().is_accepting());
    }

    #[test]
    fn missing_status_replies_are_not_failures() {
        let (bus, _inbox) = FakeBus::new(8);
        let (mut sequencer, terminal) = sequencer(&["mqtt/a"]);
        run_until_running(&mut sequencer, &bus);

        for poll in 1..=5 {
            sequencer.step(at(poll * 1000), &bus).expect("poll");
            assert_eq!(sequencer.state(), TestSequenceState::Running);
        }
        assert_eq!(sequencer.missed_polls(), 5);
        assert!(bus.published_on(PLAYER_STOP).is_empty());
        assert!(!terminal
            .written_lines()
            .iter()
            .any(|line| line.contains("level=error") || line.contains("level=warn")));
    }

    #[test]
    fn status_is_only_sampled_when_the_poll_timer_elapses() {
        let (bus, _inbox) = FakeBus::new(8);
        let (mut sequencer, _) = sequencer(&["mqtt/a"]);
        run_until_running(&mut sequencer, &bus);

        sequencer.on_message(&status(599, 60.0));
        sequencer.step(at(500), &bus).expect("too early");
        assert_eq!(sequencer.state(), TestSequenceState::Running);

        sequencer.step(at(1000), &bus).expect("poll");
        assert_eq!(sequencer.state(), TestSequenceState::Stopped);
        assert_eq!(bus.published_on(PLAYER_STOP).len(), 1);
    }

    #[test]
    fn plenty_of_time_left_keeps_running_and_uses_the_latest_snapshot() {
        let (bus, _inbox) = FakeBus::new(8);
        let (mut sequencer, _) = sequencer(&["mqtt/a"]);
        run_until_running(&mut sequencer, &bus);

        sequencer.on_message(&status(599, 60.0));
        sequencer.on_message(&status(100, 60.0));
        sequencer.step(at(1000), &bus).expect("poll");
        assert_eq!(sequencer.state(), TestSequenceState::Running);
        assert_eq!(sequencer.missed_polls(), 0);

        sequencer.step(at(2000), &bus).expect("stale snapshot consumed");
        assert_eq!(sequencer.missed_polls(), 1);
    }

    #[test]
    fn malformed_status_is_discarded() {
        let (bus, _inbox) = FakeBus::new(8);
        let (mut sequencer, terminal) = sequencer(&["mqtt/a"]);
        run_until_running(&mut sequencer, &bus);

        sequencer.on_message(&BusMessage::new(PLAYER_STATUS, b"{broken".to_vec()));
        sequencer.step(at(1000), &bus).expect("poll");
        assert_eq!(sequencer.state(), TestSequenceState::Running);
        assert_eq!(sequencer.missed_polls(), 1);
        assert!(terminal
            .written_lines()
            .iter()
            .any(|line| line.contains("event=tester.status.invalid")));
    }

    #[test]
    fn full_run_reports_coverage_and_ignores_late_messages() {
        let (bus, _inbox) = FakeBus::new(8);
        let (mut sequencer, _) = sequencer(&["mqtt/a", "mqtt/b", "mqtt/c"]);

        sequencer.on_message(&BusMessage::new("mqtt/c", GOOD.to_vec()));
        run_until_running(&mut sequencer, &bus);

        sequencer.on_message(&BusMessage::new("mqtt/a", GOOD.to_vec()));
        sequencer.on_message(&BusMessage::new("mqtt/b", br#"[ { "schema": {} } ]"#.to_vec()));
        sequencer.on_message(&status(595, 60.0));
        sequencer.step(at(1000), &bus).expect("stop");
        assert_eq!(sequencer.state(), TestSequenceState::Stopped);

        sequencer.on_message(&BusMessage::new("mqtt/c", GOOD.to_vec()));
        let StepOutcome::Finished(report) = sequencer.step(at(1100), &bus).expect("report") else {
            panic!("expected a finished run");
        };
        let statuses = report
            .rows
            .iter()
            .map(|row| (row.topic.as_str(), row.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("mqtt/a", TopicStatus::Ok),
                ("mqtt/b", TopicStatus::Nok),
                ("mqtt/c", TopicStatus::Nok)
            ]
        );
        assert_eq!(report.coverage_percent, 33.3);
    }
}
