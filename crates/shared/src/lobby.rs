use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, ClockEvent},
    domain::{ClockId, ClockState, GameConfig, LobbyId, LobbyPhase},
    error::GametimeError,
};

/// What a caller asks for when creating a clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSpec {
    pub name: String,
    pub initial_time: Duration,
    pub increment: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub active_clock_id: ClockId,
    pub next_clock_id: ClockId,
    pub running: bool,
    /// Creation order, which is also the cyclic handoff order.
    pub clocks: Vec<Clock>,
}

impl GameState {
    pub fn clock(&self, clock_id: &ClockId) -> Option<&Clock> {
        self.clocks.iter().find(|clock| &clock.id == clock_id)
    }

    pub fn position(&self, clock_id: &ClockId) -> Option<usize> {
        self.clocks.iter().position(|clock| &clock.id == clock_id)
    }

    /// The clock following `index`, wrapping to the first after the last.
    fn clock_after(&self, index: usize) -> &Clock {
        &self.clocks[(index + 1) % self.clocks.len()]
    }

    pub fn running_clocks(&self) -> impl Iterator<Item = &Clock> {
        self.clocks
            .iter()
            .filter(|clock| clock.state() == ClockState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lobby {
    pub id: LobbyId,
    /// Bumped by every committed update; the compare-and-swap key.
    pub version: u64,
    pub state: GameState,
    #[serde(default)]
    pub config: GameConfig,
}

/// A single log append addressed by position, as a store applies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPush {
    pub clock_index: usize,
    pub clock_id: ClockId,
    pub event: ClockEvent,
}

/// The complete effect of one lobby transition: log appends plus pointer sets.
/// A store must make all of it visible at once or none of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyUpdate {
    pub pushes: Vec<EventPush>,
    pub active_clock_id: ClockId,
    pub next_clock_id: ClockId,
    pub running: bool,
}

impl Lobby {
    /// Builds a fresh, not-yet-started lobby with newly minted ids.
    pub fn new(specs: Vec<ClockSpec>) -> Result<Self, GametimeError> {
        if specs.is_empty() {
            return Err(GametimeError::Validation(
                "a lobby needs at least one clock".into(),
            ));
        }

        let mut clocks = Vec::with_capacity(specs.len());
        for (position, spec) in specs.into_iter().enumerate() {
            let name = spec.name.trim();
            if name.is_empty() {
                return Err(GametimeError::Validation(format!(
                    "clock {} needs a name",
                    position + 1
                )));
            }
            if spec.initial_time <= Duration::zero() {
                return Err(GametimeError::Validation(format!(
                    "clock {name} needs a positive starting time"
                )));
            }
            if spec.increment < Duration::zero() {
                return Err(GametimeError::Validation(format!(
                    "clock {name} cannot have a negative increment"
                )));
            }
            clocks.push(Clock::new(
                ClockId::random(),
                name,
                spec.initial_time,
                spec.increment,
            ));
        }

        Self::from_clocks(LobbyId::random(), clocks)
    }

    /// Assembles a lobby around existing clocks. The first clock moves first.
    pub fn from_clocks(id: LobbyId, clocks: Vec<Clock>) -> Result<Self, GametimeError> {
        let Some(first) = clocks.first() else {
            return Err(GametimeError::Validation(
                "a lobby needs at least one clock".into(),
            ));
        };

        let mut seen = HashSet::new();
        for clock in &clocks {
            if !seen.insert(&clock.id) {
                return Err(GametimeError::DuplicateId(clock.id.to_string()));
            }
        }

        let active_clock_id = first.id.clone();
        let next_clock_id = clocks[1 % clocks.len()].id.clone();
        Ok(Self {
            id,
            version: 0,
            state: GameState {
                active_clock_id,
                next_clock_id,
                running: false,
                clocks,
            },
            config: GameConfig::default(),
        })
    }

    pub fn phase(&self) -> LobbyPhase {
        if self.state.running {
            LobbyPhase::Running
        } else if self
            .state
            .clocks
            .iter()
            .all(|clock| clock.timeline.events().is_empty())
        {
            LobbyPhase::NotStarted
        } else {
            LobbyPhase::Paused
        }
    }

    pub fn clock(&self, clock_id: &ClockId) -> Option<&Clock> {
        self.state.clock(clock_id)
    }

    /// Starts the active clock and marks the lobby running.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<LobbyUpdate, GametimeError> {
        if self.state.running {
            return Err(GametimeError::AlreadyRunning(self.id.clone()));
        }

        let mut state = self.state.clone();
        let index = state
            .position(&state.active_clock_id)
            .ok_or_else(|| GametimeError::ClockNotFound(state.active_clock_id.clone()))?;
        let event = state.clocks[index].start(now)?;
        state.running = true;

        let update = LobbyUpdate {
            pushes: vec![EventPush {
                clock_index: index,
                clock_id: state.clocks[index].id.clone(),
                event,
            }],
            active_clock_id: state.active_clock_id.clone(),
            next_clock_id: state.next_clock_id.clone(),
            running: true,
        };
        self.state = state;
        Ok(update)
    }

    /// Hands control from the pressed (active) clock to the next one.
    ///
    /// All steps are computed against a working copy; `self` changes only when every
    /// step succeeded, so a failed press never leaves a half-applied state behind.
    pub fn advance(
        &mut self,
        pressed: &ClockId,
        now: DateTime<Utc>,
    ) -> Result<LobbyUpdate, GametimeError> {
        if !self.state.running {
            return Err(GametimeError::LobbyPaused(self.id.clone()));
        }
        let stop_index = self
            .state
            .position(pressed)
            .ok_or_else(|| GametimeError::ClockNotFound(pressed.clone()))?;
        if *pressed != self.state.active_clock_id
            || self.state.clocks[stop_index].state() != ClockState::Running
        {
            return Err(GametimeError::ClockNotActive(pressed.clone()));
        }

        let mut state = self.state.clone();
        let stop_event = state.clocks[stop_index].stop_with_handoff(now)?;

        let start_index = state
            .position(&state.next_clock_id)
            .ok_or_else(|| GametimeError::ClockNotFound(state.next_clock_id.clone()))?;
        let start_event = state.clocks[start_index].start(now)?;

        let upcoming = state.clock_after(start_index).id.clone();
        state.active_clock_id = state.clocks[start_index].id.clone();
        state.next_clock_id = upcoming;

        let update = LobbyUpdate {
            pushes: vec![
                EventPush {
                    clock_index: stop_index,
                    clock_id: pressed.clone(),
                    event: stop_event,
                },
                EventPush {
                    clock_index: start_index,
                    clock_id: state.active_clock_id.clone(),
                    event: start_event,
                },
            ],
            active_clock_id: state.active_clock_id.clone(),
            next_clock_id: state.next_clock_id.clone(),
            running: true,
        };
        self.state = state;
        Ok(update)
    }

    /// Replays an update computed elsewhere. Every append is validated, and nothing is
    /// changed unless the whole update applies.
    pub fn apply_update(&mut self, update: &LobbyUpdate) -> Result<(), GametimeError> {
        let mut state = self.state.clone();
        for push in &update.pushes {
            let clock = state
                .clocks
                .get_mut(push.clock_index)
                .filter(|clock| clock.id == push.clock_id)
                .ok_or_else(|| GametimeError::ClockNotFound(push.clock_id.clone()))?;
            clock.timeline.push(push.event.clone())?;
        }
        for clock_id in [&update.active_clock_id, &update.next_clock_id] {
            if state.position(clock_id).is_none() {
                return Err(GametimeError::ClockNotFound(clock_id.clone()));
            }
        }
        state.active_clock_id = update.active_clock_id.clone();
        state.next_clock_id = update.next_clock_id.clone();
        state.running = update.running;
        self.state = state;
        Ok(())
    }

    /// Checks the structural invariants of a lobby's game state.
    pub fn check_invariants(&self) -> Result<(), GametimeError> {
        let state = &self.state;
        let invalid = |message: String| Err(GametimeError::Validation(message));

        if state.clocks.is_empty() {
            return invalid(format!("lobby {} has no clocks", self.id));
        }
        for clock_id in [&state.active_clock_id, &state.next_clock_id] {
            if state.position(clock_id).is_none() {
                return invalid(format!("lobby {} does not own clock {clock_id}", self.id));
            }
        }
        if state.clocks.len() > 1 && state.active_clock_id == state.next_clock_id {
            return invalid(format!(
                "lobby {} has the same active and next clock",
                self.id
            ));
        }

        let running: Vec<&Clock> = state.running_clocks().collect();
        match (state.running, running.as_slice()) {
            (false, []) => Ok(()),
            (true, [only]) if only.id == state.active_clock_id => Ok(()),
            (true, [only]) => invalid(format!(
                "clock {} is running but {} is active",
                only.id, state.active_clock_id
            )),
            (true, []) => invalid(format!("lobby {} is running with no clock running", self.id)),
            (false, _) => invalid(format!("lobby {} is paused with a clock running", self.id)),
            (true, _) => invalid(format!(
                "lobby {} has {} clocks running",
                self.id,
                running.len()
            )),
        }
    }
}

#[cfg(test)]
#[path = "tests/lobby_tests.rs"]
mod tests;
