use crate::errors::SignalBenchError;
use crate::protocol::PlayerCommand;
use crate::types::{PlayerRunState, TestSequenceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerTransition {
    pub from: PlayerRunState,
    pub to: PlayerRunState,
    pub reset_ticks: bool,
}

impl PlayerTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Start always rewinds the tick counter, even when already playing.
/// Commands received in the wrong state leave the state untouched.
pub fn apply_command(state: PlayerRunState, command: &PlayerCommand) -> PlayerTransition {
    use PlayerRunState as S;

    match (state, command) {
        (_, PlayerCommand::Start { .. }) => PlayerTransition {
            from: state,
            to: S::Playing,
            reset_ticks: true,
        },
        (S::Playing, PlayerCommand::Stop) => PlayerTransition {
            from: state,
            to: S::Stopped,
            reset_ticks: true,
        },
        (S::Stopped, PlayerCommand::Stop) => PlayerTransition {
            from: state,
            to: S::Stopped,
            reset_ticks: false,
        },
    }
}

pub fn validate_sequence_transition(
    from: TestSequenceState,
    to: TestSequenceState,
) -> Result<(), SignalBenchError> {
    use TestSequenceState as S;

    let allowed = matches!(
        (from, to),
        (S::Idle, S::Started)
            | (S::Started, S::Running)
            | (S::Running, S::Stopped)
            | (S::Stopped, S::Idle)
    );

    if !allowed {
        return Err(SignalBenchError::InvalidConfig(format!(
            "illegal test sequence transition: {:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}
