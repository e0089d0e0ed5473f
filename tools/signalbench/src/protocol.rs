use crate::errors::SignalBenchError;
use crate::trace::TENTHS_PER_SECOND;
use crate::types::PlayerRunState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PLAYER_START: &str = "signalPlayer/start";
pub const PLAYER_STOP: &str = "signalPlayer/stop";
pub const PLAYER_STATUS: &str = "signalPlayer/status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerCommand {
    Start { trace_name: String, speed: f64 },
    Stop,
}

impl PlayerCommand {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Start { .. } => PLAYER_START,
            Self::Stop => PLAYER_STOP,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalBenchError> {
        serde_json::to_vec(self).map_err(|e| SignalBenchError::Protocol(e.to_string()))
    }
}

/// Start payload used by older testers: no `kind` discriminator.
#[derive(Debug, Deserialize)]
struct UntaggedStart {
    trace_name: String,
    #[serde(default = "default_speed")]
    speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

/// Decodes a command delivered on one of the player command topics.
///
/// Older testers signal stop with an empty payload on the start topic and
/// send start without a `kind` field; both forms are still accepted.
pub fn decode_command(topic: &str, payload: &[u8]) -> Result<PlayerCommand, SignalBenchError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| SignalBenchError::Protocol(format!("command payload is not utf-8: {e}")))?
        .trim();

    match topic {
        PLAYER_START => {
            if text.is_empty() || text == "\"\"" {
                return Ok(PlayerCommand::Stop);
            }
            let value = parse_value(text)?;
            if value.get("kind").is_some() {
                return serde_json::from_value(value)
                    .map_err(|e| SignalBenchError::Protocol(format!("invalid command: {e}")));
            }
            let start: UntaggedStart = serde_json::from_value(value)
                .map_err(|e| SignalBenchError::Protocol(format!("invalid start command: {e}")))?;
            Ok(PlayerCommand::Start {
                trace_name: start.trace_name,
                speed: start.speed,
            })
        }
        PLAYER_STOP => {
            let tagged = serde_json::from_str::<Value>(text)
                .ok()
                .filter(|value| value.get("kind").is_some());
            match tagged.map(serde_json::from_value::<PlayerCommand>) {
                Some(Ok(PlayerCommand::Start { .. })) => Err(SignalBenchError::Protocol(
                    "start command received on the stop topic".to_string(),
                )),
                Some(Err(e)) => Err(SignalBenchError::Protocol(format!("invalid command: {e}"))),
                Some(Ok(PlayerCommand::Stop)) | None => Ok(PlayerCommand::Stop),
            }
        }
        other => Err(SignalBenchError::Protocol(format!(
            "`{other}` is not a player command topic"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: PlayerRunState,
    pub time_elapsed: f64,
    pub trace_length: f64,
}

impl StatusMessage {
    pub fn from_ticks(status: PlayerRunState, ticks: u64, trace_length: f64) -> Self {
        Self {
            status,
            time_elapsed: ticks as f64 / TENTHS_PER_SECOND as f64,
            trace_length,
        }
    }

    pub fn remaining_seconds(&self) -> f64 {
        self.trace_length - self.time_elapsed
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalBenchError> {
        serde_json::to_vec(self).map_err(|e| SignalBenchError::Protocol(e.to_string()))
    }
}

pub fn decode_status(payload: &[u8]) -> Result<StatusMessage, SignalBenchError> {
    serde_json::from_slice(payload)
        .map_err(|e| SignalBenchError::Protocol(format!("invalid status message: {e}")))
}

fn parse_value(text: &str) -> Result<Value, SignalBenchError> {
    serde_json::from_str(text).map_err(|e| {
        SignalBenchError::Protocol(format!(
            "invalid json: {e}; input={}",
            text.chars().take(256).collect::<String>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::{
        decode_command, decode_status, PlayerCommand, StatusMessage, PLAYER_START, PLAYER_STATUS,
        PLAYER_STOP,
    };
    use crate::types::PlayerRunState;

    #[test]
    fn tagged_commands_go_to_their_own_topics() {
        let start = PlayerCommand::Start {
            trace_name: "trace-01".to_string(),
            speed: 1.0,
        };
        assert_eq!(start.topic(), PLAYER_START);
        assert_eq!(PlayerCommand::Stop.topic(), PLAYER_STOP);

        let bytes = start.encode().expect("encode");
        assert_eq!(
            String::from_utf8(bytes.clone()).expect("utf8"),
            r#"{"kind":"start","trace_name":"trace-01","speed":1.0}"#
        );
        assert_eq!(decode_command(PLAYER_START, &bytes).expect("decode"), start);
        let stop = PlayerCommand::Stop.encode().expect("encode");
        assert_eq!(
            decode_command(PLAYER_STOP, &stop).expect("decode"),
            PlayerCommand::Stop
        );
    }

    #[test]
    fn legacy_start_and_empty_stop_are_understood() {
        let start = decode_command(PLAYER_START, br#"{"trace_name":"trace-02","speed":2.0}"#)
            .expect("legacy start");
        assert_eq!(
            start,
            PlayerCommand::Start {
                trace_name: "trace-02".to_string(),
                speed: 2.0
            }
        );
        assert_eq!(
            decode_command(PLAYER_START, b"").expect("legacy stop"),
            PlayerCommand::Stop
        );
        assert_eq!(
            decode_command(PLAYER_STOP, b"whatever").expect("stop topic"),
            PlayerCommand::Stop
        );
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(decode_command(PLAYER_START, b"{not json").is_err());
        assert!(decode_command(PLAYER_START, br#"{"speed": 1.0}"#).is_err());
        assert!(decode_command(PLAYER_START, br#"{"kind":"rewind"}"#).is_err());
        assert!(decode_command(PLAYER_STOP, br#"{"kind":"start","trace_name":"t","speed":1.0}"#).is_err());
        assert!(decode_command(PLAYER_STATUS, b"{}").is_err());
        assert!(decode_command(PLAYER_START, &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn status_reports_elapsed_in_tenths_and_remaining_time() {
        let status = StatusMessage::from_ticks(PlayerRunState::Playing, 595, 60.0);
        assert_eq!(status.time_elapsed, 59.5);
        assert_eq!(status.remaining_seconds(), 0.5);

        let bytes = status.encode().expect("encode");
        assert_eq!(
            String::from_utf8(bytes.clone()).expect("utf8"),
            r#"{"status":"playing","time_elapsed":59.5,"trace_length":60.0}"#
        );
        assert_eq!(decode_status(&bytes).expect("decode"), status);
        assert!(decode_status(br#"{"status":"paused","time_elapsed":1,"trace_length":2}"#).is_err());
    }
}
