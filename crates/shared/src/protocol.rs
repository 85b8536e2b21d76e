use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClockId, ClockState, LobbyId, LobbyPhase},
    lobby::Lobby,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClock {
    pub name: String,
    pub initial_time_secs: u64,
    #[serde(default)]
    pub increment_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLobbyRequest {
    pub clocks: Vec<NewClock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub clock_id: ClockId,
    pub name: String,
    pub position: usize,
    pub state: ClockState,
    /// Negative once the clock has overrun.
    pub remaining_ms: i64,
    pub increment_ms: i64,
    pub initial_ms: i64,
    pub is_active: bool,
    pub is_next: bool,
}

/// Read model of a lobby as seen by viewers at one instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LobbySnapshot {
    pub lobby_id: LobbyId,
    pub version: u64,
    pub phase: LobbyPhase,
    pub running: bool,
    pub active_clock_id: ClockId,
    pub next_clock_id: ClockId,
    pub clocks: Vec<ClockSnapshot>,
    pub taken_at: DateTime<Utc>,
}

impl LobbySnapshot {
    pub fn at(lobby: &Lobby, now: DateTime<Utc>) -> Self {
        let state = &lobby.state;
        let clocks = state
            .clocks
            .iter()
            .enumerate()
            .map(|(position, clock)| ClockSnapshot {
                clock_id: clock.id.clone(),
                name: clock.name.clone(),
                position,
                state: clock.state(),
                remaining_ms: clock.remaining_now(now).num_milliseconds(),
                increment_ms: clock.increment.num_milliseconds(),
                initial_ms: clock.initial_time().num_milliseconds(),
                is_active: clock.id == state.active_clock_id,
                is_next: clock.id == state.next_clock_id,
            })
            .collect();

        Self {
            lobby_id: lobby.id.clone(),
            version: lobby.version,
            phase: lobby.phase(),
            running: state.running,
            active_clock_id: state.active_clock_id.clone(),
            next_clock_id: state.next_clock_id.clone(),
            clocks,
            taken_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyEventKind {
    LobbyUpdated,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    LobbyUpdated { lobby_id: LobbyId },
    Heartbeat,
}

impl ServerEvent {
    pub fn of_kind(kind: LobbyEventKind, lobby_id: &LobbyId) -> Self {
        match kind {
            LobbyEventKind::LobbyUpdated => ServerEvent::LobbyUpdated {
                lobby_id: lobby_id.clone(),
            },
            LobbyEventKind::Heartbeat => ServerEvent::Heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::lobby::ClockSpec;

    #[test]
    fn snapshot_reports_live_remaining_time() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut lobby = Lobby::new(vec![
            ClockSpec {
                name: "white".into(),
                initial_time: Duration::seconds(10),
                increment: Duration::seconds(2),
            },
            ClockSpec {
                name: "black".into(),
                initial_time: Duration::seconds(10),
                increment: Duration::seconds(2),
            },
        ])
        .expect("lobby");
        lobby.start(t0).expect("start");

        let snapshot = LobbySnapshot::at(&lobby, t0 + Duration::seconds(13));
        assert_eq!(snapshot.phase, LobbyPhase::Running);
        assert_eq!(snapshot.clocks[0].state, ClockState::Running);
        assert_eq!(snapshot.clocks[0].remaining_ms, -3_000);
        assert!(snapshot.clocks[0].is_active);
        assert!(snapshot.clocks[1].is_next);
        assert_eq!(snapshot.clocks[1].remaining_ms, 10_000);
        assert_eq!(snapshot.clocks[1].increment_ms, 2_000);
    }

    #[test]
    fn server_events_use_tagged_json() {
        let event = ServerEvent::of_kind(LobbyEventKind::LobbyUpdated, &LobbyId::from("l-1"));
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "lobby_updated");
        assert_eq!(json["payload"]["lobby_id"], "l-1");

        let heartbeat = serde_json::to_value(ServerEvent::Heartbeat).expect("json");
        assert_eq!(heartbeat["type"], "heartbeat");
    }
}
