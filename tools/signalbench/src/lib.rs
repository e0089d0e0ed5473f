pub mod bus;
pub mod config;
pub mod coverage;
pub mod errors;
pub mod fsm;
pub mod log_retention;
pub mod logging;
pub mod player;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod sequencer;
pub mod tester;
pub mod trace;
pub mod types;

use bus::{MessageBus, MqttBus};
use clap::{error::ErrorKind, Parser, Subcommand, ValueEnum};
use config::{load_config, resolve_path, AppConfig, CliOverrides, EnvMap};
use errors::SignalBenchError;
use logging::{JsonlLogger, RunLogger};
use player::{run_player, PlayerOptions};
use runtime::ProductionRuntime;
use scheduler::ReplayScheduler;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tester::{expected_topics, run_tester, TesterContext};
use trace::{load_trace, TraceDescriptor};
use types::LogLevel;

#[derive(Debug, Clone, Parser)]
#[command(name = "signalbench")]
#[command(about = "Replay recorded pub/sub traces and measure topic coverage")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub host: Option<String>,
    #[arg(long, global = true)]
    pub port: Option<u16>,
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<CliLogLevel>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Replay a trace on the bus, driven by start/stop commands.
    Play {
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Exit after this many ticks instead of running until interrupted.
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Run one trace through a player and write the coverage report.
    Test {
        #[arg(long)]
        trace_name: Option<String>,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Print the publish schedule derived from a trace file.
    Inspect {
        #[arg(long)]
        trace: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<CliLogLevel> for LogLevel {
    fn from(value: CliLogLevel) -> Self {
        match value {
            CliLogLevel::Debug => LogLevel::Debug,
            CliLogLevel::Info => LogLevel::Info,
            CliLogLevel::Warn => LogLevel::Warn,
            CliLogLevel::Error => LogLevel::Error,
        }
    }
}

impl Cli {
    fn overrides(&self, cwd: &Path) -> CliOverrides {
        let mut overrides = CliOverrides {
            config_path: self.config.as_deref().map(|path| resolve_path(cwd, path)),
            host: self.host.clone(),
            port: self.port,
            log_path: self.log_file.clone(),
            log_level: self.log_level.map(Into::into),
            ..CliOverrides::default()
        };
        match &self.command {
            CliCommand::Play { trace, .. } | CliCommand::Inspect { trace } => {
                overrides.trace_path = trace.clone();
            }
            CliCommand::Test {
                trace_name,
                speed,
                input_dir,
                output_dir,
            } => {
                overrides.trace_name = trace_name.clone();
                overrides.speed = *speed;
                overrides.input_dir = input_dir.clone();
                overrides.output_dir = output_dir.clone();
            }
        }
        overrides
    }
}

pub fn run() -> Result<i32, SignalBenchError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| SignalBenchError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, SignalBenchError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(SignalBenchError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);
    let cfg = load_config(&cli.overrides(cwd), &env_map, runtime.file_system.as_ref())?;

    match cli.command {
        CliCommand::Inspect { .. } => inspect(&cfg, cwd, runtime),
        CliCommand::Play { max_ticks, .. } => play(&cfg, cwd, runtime, max_ticks),
        CliCommand::Test { .. } => test(&cfg, cwd, runtime),
    }
}

fn inspect(cfg: &AppConfig, cwd: &Path, runtime: &ProductionRuntime) -> Result<i32, SignalBenchError> {
    let path = resolve_path(cwd, &cfg.player.trace_path);
    let trace = load_trace(runtime.file_system.as_ref(), &path)?;
    let terminal = runtime.terminal.as_ref();

    terminal.write_line(&format!(
        "trace={} length_s={} topics={}",
        path.display(),
        trace.total_duration_seconds,
        trace.topics.len()
    ))?;
    for (idx, topic) in trace.topics.iter().enumerate() {
        terminal.write_line(&format!(
            "topic={} count={} period_s={:.1}",
            topic.name,
            topic.target_count,
            trace.period_seconds(idx).unwrap_or_default()
        ))?;
    }
    terminal.write_line(&format!(
        "expected_topics={} prefix={}",
        trace.expected_topics(&cfg.tester.topic_prefix).len(),
        cfg.tester.topic_prefix
    ))?;
    Ok(0)
}

fn play(
    cfg: &AppConfig,
    cwd: &Path,
    runtime: &ProductionRuntime,
    max_ticks: Option<u64>,
) -> Result<i32, SignalBenchError> {
    let log = build_logger(cfg, "player", cwd, runtime);
    let path = resolve_path(cwd, &cfg.player.trace_path);
    let trace = match load_trace(runtime.file_system.as_ref(), &path) {
        Ok(trace) => trace,
        Err(err) => {
            log.error("player.trace.invalid", json!({ "error": err.to_string() }));
            return Err(err);
        }
    };
    log_schedule(&trace, &log);

    let settings = cfg.mqtt_settings(&cfg.bus.player_client_id);
    let (bus, mut inbox) = MqttBus::connect(&settings, log.for_component("bus"))?;
    let mut scheduler = ReplayScheduler::new(trace);
    let options = PlayerOptions {
        tick: Duration::from_millis(cfg.player.tick_ms),
        trace_name: cfg.player.trace_name.clone(),
        max_ticks,
    };
    let result = run_player(
        &mut scheduler,
        &bus,
        &mut inbox,
        runtime.clock.as_ref(),
        &options,
        &log,
    );
    if let Err(err) = bus.close() {
        log.warn("player.bus.close_failed", json!({ "error": err.to_string() }));
    }
    result.map(|_| 0)
}

fn test(cfg: &AppConfig, cwd: &Path, runtime: &ProductionRuntime) -> Result<i32, SignalBenchError> {
    let log = build_logger(cfg, "tester", cwd, runtime);
    let trace_name = cfg.tester_trace_name()?.to_string();
    let input_path = resolve_path(cwd, &cfg.tester_input_path(&trace_name));
    let expected = match load_trace(runtime.file_system.as_ref(), &input_path)
        .and_then(|trace| expected_topics(cfg, &trace))
    {
        Ok(expected) => expected,
        Err(err) => {
            log.error(
                "tester.trace.invalid",
                json!({ "path": input_path.display().to_string(), "error": err.to_string() }),
            );
            return Err(err);
        }
    };
    let report_path = resolve_path(cwd, &cfg.tester_report_path(&trace_name));
    log.info(
        "tester.trace.loaded",
        json!({
            "trace_name": trace_name,
            "path": input_path.display().to_string(),
            "expected_topics": expected.len(),
        }),
    );

    let settings = cfg.mqtt_settings(&cfg.bus.tester_client_id);
    let (bus, mut inbox) = MqttBus::connect(&settings, log.for_component("bus"))?;
    let report = run_tester(
        cfg,
        &trace_name,
        expected,
        &report_path,
        TesterContext {
            bus: &bus,
            inbox: &mut inbox,
            runtime,
            log: &log,
        },
    )?;
    runtime.terminal.write_line(&format!(
        "coverage={:.1}% found={} total={} report={}",
        report.coverage_percent,
        report.found,
        report.total,
        report_path.display()
    ))?;
    Ok(0)
}

fn build_logger(cfg: &AppConfig, component: &str, cwd: &Path, runtime: &ProductionRuntime) -> RunLogger {
    let log = RunLogger::new(component, cfg.logging.min_level, runtime.terminal.clone());
    match &cfg.logging.path {
        Some(path) => log.with_sink(JsonlLogger {
            path: resolve_path(cwd, path),
            max_payload_bytes: cfg.logging.max_payload_bytes,
            budget_bytes: cfg.logging.budget_bytes,
        }),
        None => log,
    }
}

fn log_schedule(trace: &TraceDescriptor, log: &RunLogger) {
    let periods = trace
        .topics
        .iter()
        .enumerate()
        .map(|(idx, topic)| json!({ "topic": topic.name, "period_s": trace.period_seconds(idx) }))
        .collect::<Vec<_>>();
    log.info(
        "player.trace.loaded",
        json!({
            "topics": trace.topics.len(),
            "trace_length": trace.total_duration_seconds,
            "periods": periods,
        }),
    );
}

fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}
