use crate::fsm::{apply_command, PlayerTransition};
use crate::protocol::{PlayerCommand, StatusMessage};
use crate::trace::{TraceDescriptor, TraceTopic};
use crate::types::PlayerRunState;

/// What one 100 ms tick decided. The plan is fully computed before anything
/// is published, so commands arriving mid-publish only affect the next tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickPlan {
    pub tick: u64,
    pub transitions: Vec<PlayerTransition>,
    pub status: StatusMessage,
    pub due: Vec<usize>,
    pub completed: bool,
}

pub struct ReplayScheduler {
    trace: TraceDescriptor,
    state: PlayerRunState,
    ticks: u64,
    completed_passes: u64,
}

impl ReplayScheduler {
    pub fn new(trace: TraceDescriptor) -> Self {
        Self {
            trace,
            state: PlayerRunState::Stopped,
            ticks: 0,
            completed_passes: 0,
        }
    }

    pub fn state(&self) -> PlayerRunState {
        self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn completed_passes(&self) -> u64 {
        self.completed_passes
    }

    pub fn trace(&self) -> &TraceDescriptor {
        &self.trace
    }

    pub fn topic(&self, topic_index: usize) -> Option<&TraceTopic> {
        self.trace.topics.get(topic_index)
    }

    pub fn apply(&mut self, command: &PlayerCommand) -> PlayerTransition {
        let transition = apply_command(self.state, command);
        self.state = transition.to;
        if transition.reset_ticks {
            self.ticks = 0;
        }
        transition
    }

    pub fn tick(&mut self, commands: &[PlayerCommand]) -> TickPlan {
        let transitions = commands
            .iter()
            .map(|command| self.apply(command))
            .collect::<Vec<_>>();

        let evaluated = self.ticks;
        let status = StatusMessage::from_ticks(
            self.state,
            evaluated,
            self.trace.total_duration_seconds,
        );

        let mut due = Vec::new();
        let mut completed = false;
        if self.state == PlayerRunState::Playing {
            due.extend(self.trace.schedule().due_at(evaluated));
            self.ticks += 1;
            if self.ticks > self.trace.schedule().duration_tenths() {
                self.ticks = 0;
                self.completed_passes += 1;
                completed = true;
            }
        }

        TickPlan {
            tick: evaluated,
            transitions,
            status,
            due,
            completed,
        }
    }
}
