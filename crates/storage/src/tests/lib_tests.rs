use super::*;
use chrono::TimeZone;
use shared::{domain::ClockState, lobby::ClockSpec};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn secs(n: i64) -> Duration {
    Duration::seconds(n)
}

fn two_clock_lobby(increment: i64) -> Lobby {
    Lobby::new(vec![
        ClockSpec {
            name: "A".into(),
            initial_time: secs(60),
            increment: secs(increment),
        },
        ClockSpec {
            name: "B".into(),
            initial_time: secs(60),
            increment: secs(increment),
        },
    ])
    .expect("lobby")
}

async fn stores() -> Vec<(&'static str, Box<dyn LobbyStore>)> {
    let sqlite = Storage::new("sqlite::memory:").await.expect("db");
    vec![
        ("sqlite", Box::new(sqlite) as Box<dyn LobbyStore>),
        ("memory", Box::new(MemoryLobbyStore::new())),
    ]
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("gametime.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn created_lobby_reads_back_by_id_and_by_clock() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(5);
        store.create(&lobby).await.expect("create");

        let by_id = store.get_by_id(&lobby.id).await.expect("by id");
        assert_eq!(by_id, lobby, "{name}");

        let second_clock = &lobby.state.clocks[1].id;
        let by_clock = store.get_by_clock_id(second_clock).await.expect("by clock");
        assert_eq!(by_clock, lobby, "{name}");
    }
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(0);
        store.create(&lobby).await.expect("create");

        let err = store.create(&lobby).await.expect_err("duplicate lobby");
        assert_eq!(err, GametimeError::DuplicateId(lobby.id.to_string()), "{name}");

        let mut reused_clock = two_clock_lobby(0);
        reused_clock.state.clocks[0] = lobby.state.clocks[0].clone();
        reused_clock.state.active_clock_id = lobby.state.clocks[0].id.clone();
        let err = store.create(&reused_clock).await.expect_err("duplicate clock");
        assert!(matches!(err, GametimeError::DuplicateId(_)), "{name}");
        assert!(matches!(
            store.get_by_id(&reused_clock.id).await,
            Err(GametimeError::LobbyNotFound(_))
        ));
    }
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    for (name, store) in stores().await {
        let missing_lobby = LobbyId::from("nope");
        let missing_clock = ClockId::from("nope");
        assert_eq!(
            store.get_by_id(&missing_lobby).await.expect_err("lobby"),
            GametimeError::LobbyNotFound(missing_lobby.clone()),
            "{name}"
        );
        assert_eq!(
            store.get_by_clock_id(&missing_clock).await.expect_err("clock"),
            GametimeError::ClockNotFound(missing_clock.clone()),
            "{name}"
        );
        assert!(matches!(
            store.apply_start(&missing_lobby, t0()).await,
            Err(GametimeError::LobbyNotFound(_))
        ));
        assert!(matches!(
            store.apply_advance(&missing_clock, t0()).await,
            Err(GametimeError::ClockNotFound(_))
        ));
    }
}

#[tokio::test]
async fn start_then_advance_persists_the_handoff() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(10);
        let a = lobby.state.clocks[0].id.clone();
        let b = lobby.state.clocks[1].id.clone();
        store.create(&lobby).await.expect("create");

        let started = store.apply_start(&lobby.id, t0()).await.expect("start");
        assert!(started.state.running, "{name}");
        assert_eq!(started.version, 1, "{name}");

        let advanced = store
            .apply_advance(&a, t0() + secs(5))
            .await
            .expect("advance");
        assert_eq!(advanced.version, 2, "{name}");
        assert_eq!(advanced.state.active_clock_id, b, "{name}");
        assert_eq!(advanced.state.next_clock_id, a, "{name}");

        let reloaded = store.get_by_id(&lobby.id).await.expect("reload");
        assert_eq!(reloaded, advanced, "{name}");
        let clock_a = reloaded.clock(&a).expect("a");
        assert_eq!(clock_a.state(), ClockState::Stopped);
        assert_eq!(clock_a.remaining_now(t0() + secs(30)), secs(65), "{name}");
        let clock_b = reloaded.clock(&b).expect("b");
        assert_eq!(clock_b.state(), ClockState::Running);
        assert_eq!(clock_b.remaining_now(t0() + secs(5)), secs(60), "{name}");
    }
}

#[tokio::test]
async fn rejected_transitions_leave_the_store_untouched() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(0);
        let a = lobby.state.clocks[0].id.clone();
        let b = lobby.state.clocks[1].id.clone();
        store.create(&lobby).await.expect("create");

        let err = store.apply_advance(&a, t0()).await.expect_err("not started");
        assert_eq!(err, GametimeError::LobbyPaused(lobby.id.clone()), "{name}");

        store.apply_start(&lobby.id, t0()).await.expect("start");
        let err = store
            .apply_start(&lobby.id, t0())
            .await
            .expect_err("second start");
        assert_eq!(err, GametimeError::AlreadyRunning(lobby.id.clone()), "{name}");

        let before = store.get_by_id(&lobby.id).await.expect("before");
        for _ in 0..2 {
            let err = store
                .apply_advance(&b, t0() + secs(1))
                .await
                .expect_err("wrong presser");
            assert_eq!(err, GametimeError::ClockNotActive(b.clone()), "{name}");
            assert_eq!(store.get_by_id(&lobby.id).await.expect("after"), before);
        }
    }
}

#[tokio::test]
async fn stale_version_commit_is_a_conflict() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(0);
        let a = lobby.state.clocks[0].id.clone();
        store.create(&lobby).await.expect("create");
        store.apply_start(&lobby.id, t0()).await.expect("start");

        let mut first_reader = store.get_by_id(&lobby.id).await.expect("read");
        let mut second_reader = first_reader.clone();
        let first = first_reader.advance(&a, t0() + secs(1)).expect("compute");
        let second = second_reader.advance(&a, t0() + secs(2)).expect("compute");

        store
            .commit(&lobby.id, first_reader.version, &first)
            .await
            .expect("first commit wins");
        let err = store
            .commit(&lobby.id, second_reader.version, &second)
            .await
            .expect_err("second commit loses");
        assert_eq!(err, GametimeError::Conflict(lobby.id.clone()), "{name}");

        let stored = store.get_by_id(&lobby.id).await.expect("reload");
        assert_eq!(stored.version, 2, "{name}");
        assert_eq!(stored.clock(&a).expect("a").timeline.events().len(), 2);
    }
}

#[tokio::test]
async fn commit_rejects_updates_for_foreign_clocks() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(0);
        let other = two_clock_lobby(0);
        store.create(&lobby).await.expect("create");
        store.create(&other).await.expect("create other");

        let mut foreign = other.clone();
        let update = foreign.start(t0()).expect("compute");
        let err = store
            .commit(&lobby.id, lobby.version, &update)
            .await
            .expect_err("foreign clock");
        assert!(matches!(err, GametimeError::ClockNotFound(_)), "{name}");
        assert_eq!(store.get_by_id(&lobby.id).await.expect("reload"), lobby);
    }
}

#[tokio::test]
async fn single_clock_lobby_self_handoff_accumulates_increment() {
    for (name, store) in stores().await {
        let lobby = Lobby::new(vec![ClockSpec {
            name: "solo".into(),
            initial_time: secs(30),
            increment: secs(5),
        }])
        .expect("lobby");
        let solo = lobby.state.active_clock_id.clone();
        store.create(&lobby).await.expect("create");
        store.apply_start(&lobby.id, t0()).await.expect("start");

        for _ in 0..3 {
            store.apply_advance(&solo, t0()).await.expect("press");
        }
        let stored = store.get_by_id(&lobby.id).await.expect("reload");
        let clock = stored.clock(&solo).expect("solo");
        assert_eq!(clock.state(), ClockState::Running, "{name}");
        assert_eq!(clock.remaining_now(t0()), secs(45), "{name}");
        assert_eq!(stored.state.next_clock_id, solo, "{name}");
    }
}

#[tokio::test]
async fn overrun_survives_a_round_trip() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(0);
        let a = lobby.state.clocks[0].id.clone();
        store.create(&lobby).await.expect("create");
        store.apply_start(&lobby.id, t0()).await.expect("start");
        store
            .apply_advance(&a, t0() + secs(75))
            .await
            .expect("late press");

        let stored = store.get_by_id(&lobby.id).await.expect("reload");
        let stop = stored
            .clock(&a)
            .and_then(|clock| clock.timeline.last_event())
            .expect("stop event")
            .clone();
        assert_eq!(stop.remaining_at_event, secs(-15), "{name}");
    }
}

#[tokio::test]
async fn submillisecond_overrun_is_kept_exactly() {
    for (name, store) in stores().await {
        let lobby = two_clock_lobby(0);
        let a = lobby.state.clocks[0].id.clone();
        store.create(&lobby).await.expect("create");
        store.apply_start(&lobby.id, t0()).await.expect("start");
        let pressed_at = t0() + secs(60) + Duration::microseconds(500);
        let committed = store.apply_advance(&a, pressed_at).await.expect("late press");

        let stored = store.get_by_id(&lobby.id).await.expect("reload");
        assert_eq!(stored, committed, "{name}");
        let stop = stored
            .clock(&a)
            .and_then(|clock| clock.timeline.last_event())
            .expect("stop event");
        assert_eq!(stop.remaining_at_event, Duration::microseconds(-500), "{name}");
        assert_eq!(stop.timestamp, pressed_at, "{name}");
    }
}

#[tokio::test]
async fn lists_lobbies_in_creation_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = two_clock_lobby(0);
    storage.create(&first).await.expect("create");
    let ids = storage.list_lobby_ids().await.expect("list");
    assert_eq!(ids, vec![first.id]);
}
