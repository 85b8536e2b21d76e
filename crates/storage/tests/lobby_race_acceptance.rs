use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use shared::{
    domain::{ClockState, LobbyId},
    error::GametimeError,
    lobby::{ClockSpec, Lobby},
};
use storage::{LobbyStore, MemoryLobbyStore, Storage};

fn lobby_of(names: &[&str]) -> Lobby {
    Lobby::new(
        names
            .iter()
            .map(|name| ClockSpec {
                name: (*name).into(),
                initial_time: Duration::seconds(60),
                increment: Duration::seconds(2),
            })
            .collect(),
    )
    .expect("lobby")
}

async fn file_store(dir: &tempfile::TempDir) -> Storage {
    let path = dir.path().join("race.db");
    let url = format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"));
    Storage::new(&url).await.expect("db")
}

async fn simultaneous_presses_move_the_lobby_once(store: Arc<dyn LobbyStore>) {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let lobby = lobby_of(&["A", "B"]);
    let a = lobby.state.clocks[0].id.clone();
    let b = lobby.state.clocks[1].id.clone();
    store.create(&lobby).await.expect("create");
    store.apply_start(&lobby.id, t0).await.expect("start");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let a = a.clone();
        handles.push(tokio::spawn(async move {
            store.apply_advance(&a, t0 + Duration::seconds(3)).await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => wins += 1,
            Err(GametimeError::Conflict(_)) | Err(GametimeError::ClockNotActive(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(wins, 1);

    let stored = store.get_by_id(&lobby.id).await.expect("reload");
    assert_eq!(stored.version, 2);
    assert_eq!(stored.state.active_clock_id, b);
    assert_eq!(stored.clock(&a).expect("a").timeline.events().len(), 2);
    assert_eq!(stored.clock(&b).expect("b").timeline.events().len(), 1);
    stored.check_invariants().expect("invariants");
}

async fn readers_never_see_two_running_clocks(store: Arc<dyn LobbyStore>) {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let lobby = lobby_of(&["A", "B", "C"]);
    let lobby_id: LobbyId = lobby.id.clone();
    store.create(&lobby).await.expect("create");
    store.apply_start(&lobby_id, t0).await.expect("start");

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let lobby_id = lobby_id.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let snapshot = store.get_by_id(&lobby_id).await.expect("read");
                let running: Vec<_> = snapshot.state.running_clocks().collect();
                assert_eq!(running.len(), 1);
                assert_eq!(running[0].id, snapshot.state.active_clock_id);
                assert_eq!(running[0].state(), ClockState::Running);
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut pressers = Vec::new();
    for worker in 0..3_i64 {
        let store = store.clone();
        let lobby_id = lobby_id.clone();
        pressers.push(tokio::spawn(async move {
            for step in 0..10_i64 {
                let current = store.get_by_id(&lobby_id).await.expect("read");
                let now = t0 + Duration::milliseconds(step * 10 + worker);
                match store.apply_advance(&current.state.active_clock_id, now).await {
                    Ok(_)
                    | Err(GametimeError::Conflict(_))
                    | Err(GametimeError::ClockNotActive(_)) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        }));
    }

    for handle in pressers.into_iter().chain(readers) {
        handle.await.expect("join");
    }

    let stored = store.get_by_id(&lobby_id).await.expect("reload");
    stored.check_invariants().expect("invariants");
    let total_events: u64 = stored
        .state
        .clocks
        .iter()
        .map(|clock| clock.timeline.events().len() as u64)
        .sum();
    // One START for the lobby, then a STOP and a START per committed press.
    assert_eq!(total_events, 1 + 2 * (stored.version - 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_serializes_simultaneous_presses() {
    simultaneous_presses_move_the_lobby_once(Arc::new(MemoryLobbyStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_serializes_simultaneous_presses() {
    let dir = tempfile::tempdir().expect("tempdir");
    simultaneous_presses_move_the_lobby_once(Arc::new(file_store(&dir).await)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_snapshots_have_a_single_runner() {
    readers_never_see_two_running_clocks(Arc::new(MemoryLobbyStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_snapshots_have_a_single_runner() {
    let dir = tempfile::tempdir().expect("tempdir");
    readers_never_see_two_running_clocks(Arc::new(file_store(&dir).await)).await;
}
