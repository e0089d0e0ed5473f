use signalbench::bus::{BusEvent, BusMessage, FakeBus};
use signalbench::config::AppConfig;
use signalbench::logging::RunLogger;
use signalbench::protocol::{PlayerCommand, StatusMessage, PLAYER_START, PLAYER_STATUS, PLAYER_STOP};
use signalbench::runtime::{FakeClock, FakeTerminal, ProductionFileSystem, ProductionRuntime};
use signalbench::tester::{expected_topics, run_tester, TesterContext};
use signalbench::trace::load_trace;
use signalbench::types::{LogLevel, PlayerRunState};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

fn runtime() -> (ProductionRuntime, FakeTerminal) {
    let terminal = FakeTerminal::new();
    (
        ProductionRuntime {
            clock: Arc::new(FakeClock::default()),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(terminal.clone()),
        },
        terminal,
    )
}

fn message(topic: &str, payload: &str) -> BusEvent {
    BusEvent::Message(BusMessage::new(topic, payload.as_bytes().to_vec()))
}

fn status(elapsed_ticks: u64) -> BusEvent {
    let status = StatusMessage::from_ticks(PlayerRunState::Playing, elapsed_ticks, 60.0);
    BusEvent::Message(BusMessage::new(
        PLAYER_STATUS,
        status.encode().expect("encode"),
    ))
}

fn engine_expected(cfg: &AppConfig) -> Vec<String> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/traces/engine.json");
    let trace = load_trace(&ProductionFileSystem, &path).expect("fixture trace");
    expected_topics(cfg, &trace).expect("expected topics")
}

#[test]
fn coverage_run_writes_csv_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = AppConfig::default();
    let expected = engine_expected(&cfg);
    let report_path = dir.path().join("out").join("test-result-engine.csv");
    let (runtime, terminal) = runtime();
    let log = RunLogger::new("tester", LogLevel::Info, runtime.terminal.clone());

    let (bus, mut inbox) = FakeBus::new(64);
    bus.reply_on_publish(
        PLAYER_START,
        vec![
            message("mqtt/engine/rpm", r#"[ { "schema": { "message": "EngineSpeed" } } ]"#),
            message("mqtt/engine/rpm", r#"[ { "schema": { "message": "EngineSpeed" } } ]"#),
            message("mqtt/cabin/door", r#"[ { "schema": { "message": "DoorState" } } ]"#),
            message("mqtt/engine/temp", "not json"),
            status(595),
        ],
    );
    bus.reply_on_publish(
        PLAYER_STOP,
        vec![message("mqtt/engine/temp", r#"[ { "schema": { "late": true } } ]"#)],
    );

    bus.deliver("mqtt/engine/temp", r#"[ { "schema": { "early": true } } ]"#.as_bytes().to_vec());

    let report = run_tester(
        &cfg,
        "engine",
        expected,
        &report_path,
        TesterContext {
            bus: &bus,
            inbox: &mut inbox,
            runtime: &runtime,
            log: &log,
        },
    )
    .expect("report");

    assert_eq!(report.found, 2);
    assert_eq!(report.total, 3);
    assert_eq!(report.not_found, vec!["mqtt/engine/temp".to_string()]);
    assert!(bus.is_closed());
    let start = bus.published_on(PLAYER_START);
    let command: PlayerCommand = serde_json::from_slice(&start[0].payload).expect("start");
    assert_eq!(
        command,
        PlayerCommand::Start {
            trace_name: "engine".to_string(),
            speed: 1.0
        }
    );

    let csv = fs::read_to_string(&report_path).expect("csv written");
    assert_eq!(
        csv,
        "topic,payload_type,status\n\
         mqtt/engine/rpm,json,OK\n\
         mqtt/engine/temp,json,NOK\n\
         mqtt/cabin/door,json,OK\n\
         \n\
         Number of MQTT topics found: 2 || Total number of MQTT topics in JSON file: 3\n\
         Test coverage: 66.7 %\n\
         \n\
         Topics which were not found:\n\
         mqtt/engine/temp\n"
    );
    assert!(terminal
        .written_lines()
        .iter()
        .any(|line| line.contains("event=tester.report.written")));
}
