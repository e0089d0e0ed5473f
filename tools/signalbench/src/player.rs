use crate::bus::{drain_inbox, BusMessage, Inbox, MessageBus};
use crate::errors::SignalBenchError;
use crate::logging::RunLogger;
use crate::protocol::{decode_command, PlayerCommand, PLAYER_START, PLAYER_STATUS, PLAYER_STOP};
use crate::runtime::Clock;
use crate::scheduler::{ReplayScheduler, TickPlan};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerOptions {
    pub tick: Duration,
    /// When set, start commands naming a different trace are logged.
    pub trace_name: Option<String>,
    /// Stop the loop after this many ticks; `None` runs until the bus fails.
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerSummary {
    pub ticks: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub completed_passes: u64,
}

/// Runs the fixed-rate replay loop. Each tick drains pending commands, then
/// publishes status followed by every topic that falls due.
pub fn run_player(
    scheduler: &mut ReplayScheduler,
    bus: &dyn MessageBus,
    inbox: &mut Inbox,
    clock: &dyn Clock,
    options: &PlayerOptions,
    log: &RunLogger,
) -> Result<PlayerSummary, SignalBenchError> {
    if options.tick.is_zero() {
        return Err(SignalBenchError::InvalidConfig(
            "player tick must be greater than zero".to_string(),
        ));
    }

    let payloads = scheduler
        .trace()
        .topics
        .iter()
        .map(|topic| {
            serde_json::to_vec(&topic.payload).map_err(|e| {
                SignalBenchError::Protocol(format!("cannot encode payload for {}: {e}", topic.name))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    bus.subscribe(PLAYER_START)?;
    bus.subscribe(PLAYER_STOP)?;
    log.info(
        "player.ready",
        json!({
            "topics": scheduler.trace().topics.len(),
            "trace_length": scheduler.trace().total_duration_seconds,
            "tick_ms": options.tick.as_millis() as u64,
        }),
    );

    let mut summary = PlayerSummary::default();
    let mut deadline = clock.now();
    while options.max_ticks.map_or(true, |max| summary.ticks < max) {
        let messages = match drain_inbox(inbox) {
            Ok(messages) => messages,
            Err(err) => {
                log.error("player.bus.lost", json!({ "error": err.to_string() }));
                return Err(err);
            }
        };
        let commands = decode_commands(&messages, options, log);
        let plan = scheduler.tick(&commands);
        publish_plan(scheduler, &plan, &payloads, bus, log, &mut summary);
        summary.ticks += 1;

        deadline += options.tick;
        let now = clock.now();
        if now > deadline {
            // Missed ticks are skipped, not replayed back to back.
            log.debug("player.tick.overrun", json!({ "tick": plan.tick }));
            deadline = now;
        }
        clock.sleep_until(deadline)?;
    }

    summary.completed_passes = scheduler.completed_passes();
    log.info(
        "player.finished",
        json!({
            "ticks": summary.ticks,
            "published": summary.published,
            "publish_failures": summary.publish_failures,
            "completed_passes": summary.completed_passes,
        }),
    );
    Ok(summary)
}

fn decode_commands(
    messages: &[BusMessage],
    options: &PlayerOptions,
    log: &RunLogger,
) -> Vec<PlayerCommand> {
    let mut commands = Vec::new();
    for message in messages {
        if message.topic != PLAYER_START && message.topic != PLAYER_STOP {
            log.debug("player.message.ignored", json!({ "topic": message.topic }));
            continue;
        }
        let command = match decode_command(&message.topic, &message.payload) {
            Ok(command) => command,
            Err(err) => {
                log.warn(
                    "player.command.invalid",
                    json!({ "topic": message.topic, "error": err.to_string() }),
                );
                continue;
            }
        };
        if let (PlayerCommand::Start { trace_name, .. }, Some(configured)) =
            (&command, options.trace_name.as_deref())
        {
            if trace_name != configured {
                log.warn(
                    "player.trace_name.mismatch",
                    json!({ "requested": trace_name, "loaded": configured }),
                );
            }
        }
        log.info("player.command.received", json!({ "command": command }));
        commands.push(command);
    }
    commands
}

fn publish_plan(
    scheduler: &ReplayScheduler,
    plan: &TickPlan,
    payloads: &[Vec<u8>],
    bus: &dyn MessageBus,
    log: &RunLogger,
    summary: &mut PlayerSummary,
) {
    for transition in plan.transitions.iter().filter(|t| t.changed()) {
        log.info(
            "player.state.changed",
            json!({ "from": transition.from.as_str(), "to": transition.to.as_str() }),
        );
    }

    match plan.status.encode() {
        Ok(status) => {
            if let Err(err) = bus.publish(PLAYER_STATUS, &status) {
                summary.publish_failures += 1;
                log.warn("player.status.failed", json!({ "error": err.to_string() }));
            }
        }
        Err(err) => log.warn("player.status.failed", json!({ "error": err.to_string() })),
    }

    for &topic_index in &plan.due {
        let (Some(topic), Some(payload)) = (scheduler.topic(topic_index), payloads.get(topic_index))
        else {
            continue;
        };
        match bus.publish(&topic.name, payload) {
            Ok(()) => {
                summary.published += 1;
                log.debug(
                    "player.topic.published",
                    json!({ "topic": topic.name, "tick": plan.tick }),
                );
            }
            Err(err) => {
                summary.publish_failures += 1;
                log.warn(
                    "player.topic.failed",
                    json!({ "topic": topic.name, "error": err.to_string() }),
                );
            }
        }
    }

    if plan.completed {
        log.info(
            "player.trace.completed",
            json!({ "passes": scheduler.completed_passes() }),
        );
    }
}
