use signalbench::bus::{BusEvent, BusMessage, FakeBus};
use signalbench::logging::RunLogger;
use signalbench::player::{run_player, PlayerOptions};
use signalbench::protocol::{decode_status, PlayerCommand, PLAYER_START, PLAYER_STATUS, PLAYER_STOP};
use signalbench::runtime::{FakeClock, FakeTerminal, ProductionFileSystem};
use signalbench::scheduler::ReplayScheduler;
use signalbench::trace::load_trace;
use signalbench::types::{LogLevel, PlayerRunState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn engine_trace() -> ReplayScheduler {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/traces/engine.json");
    ReplayScheduler::new(load_trace(&ProductionFileSystem, &path).expect("fixture trace"))
}

fn options(max_ticks: u64) -> PlayerOptions {
    PlayerOptions {
        tick: Duration::from_millis(100),
        trace_name: None,
        max_ticks: Some(max_ticks),
    }
}

fn logger() -> RunLogger {
    RunLogger::new("player", LogLevel::Info, Arc::new(FakeTerminal::new()))
}

fn start_event() -> BusEvent {
    let payload = PlayerCommand::Start {
        trace_name: "engine".to_string(),
        speed: 1.0,
    }
    .encode()
    .expect("encode");
    BusEvent::Message(BusMessage::new(PLAYER_START, payload))
}

#[test]
fn one_full_pass_publishes_each_topic_close_to_its_count() {
    let (bus, mut inbox) = FakeBus::new(64);
    bus.inject(start_event());
    let clock = FakeClock::default();
    let mut scheduler = engine_trace();

    let summary = run_player(
        &mut scheduler,
        &bus,
        &mut inbox,
        &clock,
        &options(601),
        &logger(),
    )
    .expect("run");

    assert_eq!(summary.completed_passes, 1);
    assert_eq!(bus.published_on("mqtt/engine/rpm").len(), 60);
    assert!(bus.published_on("mqtt/engine/temp").len().abs_diff(7) <= 1);
    assert_eq!(bus.published_on("mqtt/cabin/door").len(), 1);
    assert!(bus.published_on("diag/heartbeat").len().abs_diff(600) <= 1);
    assert_eq!(bus.published_on(PLAYER_STATUS).len(), 601);
}

#[test]
fn status_follows_elapsed_time_and_resets_after_stop() {
    let (bus, mut inbox) = FakeBus::new(64);
    bus.inject(start_event());
    for _ in 0..4 {
        bus.reply_on_publish(PLAYER_STATUS, Vec::new());
    }
    bus.reply_on_publish(
        PLAYER_STATUS,
        vec![BusEvent::Message(BusMessage::new(PLAYER_STOP, Vec::new()))],
    );
    let clock = FakeClock::default();
    let mut scheduler = engine_trace();

    run_player(&mut scheduler, &bus, &mut inbox, &clock, &options(8), &logger()).expect("run");

    let statuses = bus
        .published_on(PLAYER_STATUS)
        .iter()
        .map(|message| decode_status(&message.payload).expect("status"))
        .collect::<Vec<_>>();
    let elapsed = statuses
        .iter()
        .map(|status| status.time_elapsed)
        .collect::<Vec<_>>();
    assert_eq!(elapsed, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.0, 0.0, 0.0]);
    assert_eq!(statuses[4].status, PlayerRunState::Playing);
    assert_eq!(statuses[5].status, PlayerRunState::Stopped);
    assert!(statuses.iter().all(|status| status.trace_length == 60.0));
    assert_eq!(scheduler.state(), PlayerRunState::Stopped);
}

#[test]
fn legacy_empty_start_payload_stops_the_player() {
    let (bus, mut inbox) = FakeBus::new(64);
    bus.inject(start_event());
    bus.reply_on_publish(
        PLAYER_STATUS,
        vec![BusEvent::Message(BusMessage::new(PLAYER_START, b"".to_vec()))],
    );
    let clock = FakeClock::default();
    let mut scheduler = engine_trace();

    run_player(&mut scheduler, &bus, &mut inbox, &clock, &options(3), &logger()).expect("run");

    assert_eq!(scheduler.state(), PlayerRunState::Stopped);
    assert_eq!(scheduler.ticks(), 0);
}

#[test]
fn restart_mid_trace_rewinds_the_schedule() {
    let (bus, mut inbox) = FakeBus::new(64);
    bus.inject(start_event());
    for _ in 0..14 {
        bus.reply_on_publish(PLAYER_STATUS, Vec::new());
    }
    bus.reply_on_publish(PLAYER_STATUS, vec![start_event()]);
    let clock = FakeClock::default();
    let mut scheduler = engine_trace();

    run_player(&mut scheduler, &bus, &mut inbox, &clock, &options(26), &logger()).expect("run");

    // Ticks 1 and 11 of the first pass, then tick 1 again after the restart.
    assert_eq!(bus.published_on("mqtt/engine/rpm").len(), 3);
    assert_eq!(scheduler.ticks(), 11);
}
