use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalBenchError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("trace not found: {0}")]
    TraceNotFound(String),
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("expected topic set is empty; coverage is undefined")]
    EmptyExpectedSet,
    #[error("bus error: {0}")]
    Bus(String),
    #[error("bus reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}
