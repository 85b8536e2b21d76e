use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClockId, ClockState},
    error::GametimeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockEventKind {
    Start,
    Stop,
}

impl ClockEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClockEventKind::Start => "START",
            ClockEventKind::Stop => "STOP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "START" => Some(ClockEventKind::Start),
            "STOP" => Some(ClockEventKind::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for ClockEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClockEventKind::Start => "start",
            ClockEventKind::Stop => "stop",
        })
    }
}

/// One state change of a clock. `remaining_at_event` is captured when the event is
/// created and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEvent {
    pub kind: ClockEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "remaining_ms", with = "crate::millis")]
    pub remaining_at_event: Duration,
}

/// Append-only START/STOP log for a single clock.
///
/// Kinds strictly alternate, starting from an implicit STOPPED origin. Every append
/// goes through [`ClockTimeline::push`], so a timeline cannot hold two consecutive
/// events of the same kind no matter how it was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimelineRecord")]
pub struct ClockTimeline {
    #[serde(rename = "initial_ms", with = "crate::millis")]
    initial: Duration,
    events: Vec<ClockEvent>,
}

#[derive(Deserialize)]
struct TimelineRecord {
    #[serde(with = "crate::millis")]
    initial_ms: Duration,
    events: Vec<ClockEvent>,
}

impl TryFrom<TimelineRecord> for ClockTimeline {
    type Error = GametimeError;

    fn try_from(value: TimelineRecord) -> Result<Self, Self::Error> {
        ClockTimeline::from_events(value.initial_ms, value.events)
    }
}

impl ClockTimeline {
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    /// Rebuilds a timeline from persisted events, rejecting any sequence that breaks
    /// alternation.
    pub fn from_events(
        initial: Duration,
        events: impl IntoIterator<Item = ClockEvent>,
    ) -> Result<Self, GametimeError> {
        let mut timeline = Self::new(initial);
        for event in events {
            timeline.push(event)?;
        }
        Ok(timeline)
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn events(&self) -> &[ClockEvent] {
        &self.events
    }

    pub fn last_event(&self) -> Option<&ClockEvent> {
        self.events.last()
    }

    pub fn state(&self) -> ClockState {
        match self.events.last() {
            Some(event) if event.kind == ClockEventKind::Start => ClockState::Running,
            _ => ClockState::Stopped,
        }
    }

    /// Remaining time as of `now`. Not floored at zero: an overrun clock reports a
    /// negative duration.
    pub fn remaining_now(&self, now: DateTime<Utc>) -> Duration {
        match self.events.last() {
            None => self.initial,
            Some(event) if event.kind == ClockEventKind::Stop => event.remaining_at_event,
            Some(start) => start.remaining_at_event - elapsed_since(start.timestamp, now),
        }
    }

    pub fn append_start(&mut self, now: DateTime<Utc>) -> Result<ClockEvent, GametimeError> {
        self.ensure_state(ClockState::Stopped, ClockEventKind::Start)?;
        let event = ClockEvent {
            kind: ClockEventKind::Start,
            timestamp: self.chronological(now),
            remaining_at_event: self.remaining_now(now),
        };
        self.push(event.clone())?;
        Ok(event)
    }

    pub fn append_stop(&mut self, now: DateTime<Utc>) -> Result<ClockEvent, GametimeError> {
        self.append_stop_with_credit(now, Duration::zero())
    }

    /// Stops the clock and folds `credit` into the recorded remaining time before the
    /// event is stored.
    pub(crate) fn append_stop_with_credit(
        &mut self,
        now: DateTime<Utc>,
        credit: Duration,
    ) -> Result<ClockEvent, GametimeError> {
        self.ensure_state(ClockState::Running, ClockEventKind::Stop)?;
        let event = ClockEvent {
            kind: ClockEventKind::Stop,
            timestamp: self.chronological(now),
            remaining_at_event: self.remaining_now(now) + credit,
        };
        self.push(event.clone())?;
        Ok(event)
    }

    /// The single validated append. Used for fresh transitions and for replaying
    /// events that were computed elsewhere.
    pub fn push(&mut self, event: ClockEvent) -> Result<(), GametimeError> {
        let expected = match self.state() {
            ClockState::Stopped => ClockEventKind::Start,
            ClockState::Running => ClockEventKind::Stop,
        };
        if event.kind != expected {
            return Err(GametimeError::InvalidTransition {
                state: self.state(),
                attempted: event.kind,
            });
        }
        self.events.push(event);
        Ok(())
    }

    fn ensure_state(
        &self,
        required: ClockState,
        attempted: ClockEventKind,
    ) -> Result<(), GametimeError> {
        let state = self.state();
        if state != required {
            return Err(GametimeError::InvalidTransition { state, attempted });
        }
        Ok(())
    }

    // Event timestamps never move backwards, even if the caller's clock does.
    fn chronological(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.events.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        }
    }
}

fn elapsed_since(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).max(Duration::zero())
}

/// A named countdown timer. `increment` is credited only when control is handed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    pub id: ClockId,
    pub name: String,
    #[serde(rename = "increment_ms", with = "crate::millis")]
    pub increment: Duration,
    pub timeline: ClockTimeline,
}

impl Clock {
    pub fn new(
        id: ClockId,
        name: impl Into<String>,
        initial_time: Duration,
        increment: Duration,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            increment,
            timeline: ClockTimeline::new(initial_time),
        }
    }

    pub fn initial_time(&self) -> Duration {
        self.timeline.initial()
    }

    pub fn state(&self) -> ClockState {
        self.timeline.state()
    }

    pub fn remaining_now(&self, now: DateTime<Utc>) -> Duration {
        self.timeline.remaining_now(now)
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<ClockEvent, GametimeError> {
        self.timeline.append_start(now)
    }

    /// Stops a running clock as part of a handoff, crediting `increment`.
    pub fn stop_with_handoff(&mut self, now: DateTime<Utc>) -> Result<ClockEvent, GametimeError> {
        self.timeline.append_stop_with_credit(now, self.increment)
    }
}
