use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shared::{
    clock::{Clock, ClockEvent, ClockEventKind, ClockTimeline},
    domain::{ClockId, GameConfig, LobbyId},
    error::GametimeError,
    lobby::{GameState, Lobby, LobbyUpdate},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

mod memory;

pub use memory::MemoryLobbyStore;

pub type StoreResult<T> = std::result::Result<T, GametimeError>;

/// Durable home of every lobby and the serialization point for its mutations.
///
/// Implementations provide reads and one conditional write, `commit`, which applies a
/// [`LobbyUpdate`] only if the stored lobby is still at `expected_version`. The
/// provided `apply_*` methods are read, compute, commit: when two callers race on
/// the same lobby exactly one commit lands and the other gets
/// [`GametimeError::Conflict`].
#[async_trait]
pub trait LobbyStore: Send + Sync {
    async fn create(&self, lobby: &Lobby) -> StoreResult<()>;

    async fn get_by_id(&self, lobby_id: &LobbyId) -> StoreResult<Lobby>;

    async fn get_by_clock_id(&self, clock_id: &ClockId) -> StoreResult<Lobby>;

    /// Applies `update` atomically and returns the lobby as stored afterwards.
    async fn commit(
        &self,
        lobby_id: &LobbyId,
        expected_version: u64,
        update: &LobbyUpdate,
    ) -> StoreResult<Lobby>;

    async fn apply_start(&self, lobby_id: &LobbyId, now: DateTime<Utc>) -> StoreResult<Lobby> {
        let mut lobby = self.get_by_id(lobby_id).await?;
        let expected_version = lobby.version;
        let update = lobby.start(now)?;
        self.commit(&lobby.id, expected_version, &update).await
    }

    async fn apply_advance(&self, clock_id: &ClockId, now: DateTime<Utc>) -> StoreResult<Lobby> {
        let mut lobby = self.get_by_clock_id(clock_id).await?;
        let expected_version = lobby.version;
        let update = lobby.advance(clock_id, now)?;
        self.commit(&lobby.id, expected_version, &update).await
    }
}

/// SQLite-backed lobby store.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool_options = if is_in_memory(database_url) {
            // Every connection to an in-memory URL opens a separate, empty database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run lobby migrations")?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn list_lobby_ids(&self) -> Result<Vec<LobbyId>> {
        let rows = sqlx::query("SELECT id FROM lobbies ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| LobbyId(r.get::<String, _>(0)))
            .collect())
    }
}

#[async_trait]
impl LobbyStore for Storage {
    async fn create(&self, lobby: &Lobby) -> StoreResult<()> {
        lobby.check_invariants()?;
        let config_json = serde_json::to_string(&lobby.config)
            .map_err(|e| GametimeError::Validation(format!("unserializable lobby config: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        sqlx::query(
            "INSERT INTO lobbies (id, version, active_clock_id, next_clock_id, running, config_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(lobby.id.as_str())
        .bind(i64::try_from(lobby.version).unwrap_or(i64::MAX))
        .bind(lobby.state.active_clock_id.as_str())
        .bind(lobby.state.next_clock_id.as_str())
        .bind(lobby.state.running)
        .bind(config_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error(e, lobby.id.as_str()))?;

        for (position, clock) in lobby.state.clocks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO clocks (id, lobby_id, position, name, increment_ns, initial_ns)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(clock.id.as_str())
            .bind(lobby.id.as_str())
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(clock.name.as_str())
            .bind(nanos(clock.increment)?)
            .bind(nanos(clock.initial_time())?)
            .execute(&mut *tx)
            .await
            .map_err(|e| insert_error(e, clock.id.as_str()))?;

            for event in clock.timeline.events() {
                insert_event(&mut tx, &clock.id, event).await?;
            }
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn get_by_id(&self, lobby_id: &LobbyId) -> StoreResult<Lobby> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let lobby = load_lobby(&mut tx, lobby_id)
            .await?
            .ok_or_else(|| GametimeError::LobbyNotFound(lobby_id.clone()))?;
        tx.commit().await.map_err(unavailable)?;
        Ok(lobby)
    }

    async fn get_by_clock_id(&self, clock_id: &ClockId) -> StoreResult<Lobby> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let lobby_id: Option<String> = sqlx::query_scalar("SELECT lobby_id FROM clocks WHERE id = ?")
            .bind(clock_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;
        let lobby_id = LobbyId(lobby_id.ok_or_else(|| GametimeError::ClockNotFound(clock_id.clone()))?);
        let lobby = load_lobby(&mut tx, &lobby_id)
            .await?
            .ok_or_else(|| GametimeError::ClockNotFound(clock_id.clone()))?;
        tx.commit().await.map_err(unavailable)?;
        Ok(lobby)
    }

    async fn commit(
        &self,
        lobby_id: &LobbyId,
        expected_version: u64,
        update: &LobbyUpdate,
    ) -> StoreResult<Lobby> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let updated = sqlx::query(
            "UPDATE lobbies
             SET version = version + 1, active_clock_id = ?, next_clock_id = ?, running = ?,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND version = ?",
        )
        .bind(update.active_clock_id.as_str())
        .bind(update.next_clock_id.as_str())
        .bind(update.running)
        .bind(lobby_id.as_str())
        .bind(i64::try_from(expected_version).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?
        .rows_affected();

        if updated == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM lobbies WHERE id = ?")
                .bind(lobby_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
            return Err(match exists {
                Some(_) => GametimeError::Conflict(lobby_id.clone()),
                None => GametimeError::LobbyNotFound(lobby_id.clone()),
            });
        }

        for push in &update.pushes {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT lobby_id FROM clocks WHERE id = ? AND position = ?")
                    .bind(push.clock_id.as_str())
                    .bind(i64::try_from(push.clock_index).unwrap_or(i64::MAX))
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(unavailable)?;
            if owner.as_deref() != Some(lobby_id.as_str()) {
                return Err(GametimeError::ClockNotFound(push.clock_id.clone()));
            }
            insert_event(&mut tx, &push.clock_id, &push.event).await?;
        }

        // Reloading inside the transaction re-validates every touched timeline; a bad
        // update rolls back with the dropped transaction.
        let lobby = load_lobby(&mut tx, lobby_id)
            .await?
            .ok_or_else(|| GametimeError::LobbyNotFound(lobby_id.clone()))?;
        tx.commit().await.map_err(unavailable)?;
        Ok(lobby)
    }
}

async fn insert_event(
    conn: &mut SqliteConnection,
    clock_id: &ClockId,
    event: &ClockEvent,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO clock_events (clock_id, seq, kind, at, remaining_ns)
         VALUES (?1, (SELECT COALESCE(MAX(seq), -1) + 1 FROM clock_events WHERE clock_id = ?1), ?2, ?3, ?4)",
    )
    .bind(clock_id.as_str())
    .bind(event.kind.as_str())
    .bind(event.timestamp)
    .bind(nanos(event.remaining_at_event)?)
    .execute(&mut *conn)
    .await
    .map_err(unavailable)?;
    Ok(())
}

async fn load_lobby(conn: &mut SqliteConnection, lobby_id: &LobbyId) -> StoreResult<Option<Lobby>> {
    let Some(row) = sqlx::query(
        "SELECT version, active_clock_id, next_clock_id, running, config_json
         FROM lobbies WHERE id = ?",
    )
    .bind(lobby_id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(unavailable)?
    else {
        return Ok(None);
    };

    let clock_rows = sqlx::query(
        "SELECT id, name, increment_ns, initial_ns
         FROM clocks WHERE lobby_id = ?
         ORDER BY position ASC",
    )
    .bind(lobby_id.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(unavailable)?;

    let event_rows = sqlx::query(
        "SELECT e.clock_id, e.kind, e.at, e.remaining_ns
         FROM clock_events e
         INNER JOIN clocks c ON c.id = e.clock_id
         WHERE c.lobby_id = ?
         ORDER BY c.position ASC, e.seq ASC",
    )
    .bind(lobby_id.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(unavailable)?;

    let mut events_by_clock: HashMap<String, Vec<ClockEvent>> = HashMap::new();
    for r in event_rows {
        let raw_kind = r.get::<String, _>(1);
        let kind = ClockEventKind::parse(&raw_kind)
            .ok_or_else(|| corrupt(lobby_id, format!("unknown event kind {raw_kind}")))?;
        events_by_clock
            .entry(r.get::<String, _>(0))
            .or_default()
            .push(ClockEvent {
                kind,
                timestamp: r.get::<DateTime<Utc>, _>(2),
                remaining_at_event: Duration::nanoseconds(r.get::<i64, _>(3)),
            });
    }

    let mut clocks = Vec::with_capacity(clock_rows.len());
    for r in clock_rows {
        let id = r.get::<String, _>(0);
        let initial = Duration::nanoseconds(r.get::<i64, _>(3));
        let timeline =
            ClockTimeline::from_events(initial, events_by_clock.remove(&id).unwrap_or_default())
                .map_err(|e| corrupt(lobby_id, format!("clock {id}: {e}")))?;
        clocks.push(Clock {
            id: ClockId(id),
            name: r.get::<String, _>(1),
            increment: Duration::nanoseconds(r.get::<i64, _>(2)),
            timeline,
        });
    }

    let config: GameConfig = serde_json::from_str(&row.get::<String, _>(4))
        .map_err(|e| corrupt(lobby_id, format!("config: {e}")))?;

    Ok(Some(Lobby {
        id: lobby_id.clone(),
        version: u64::try_from(row.get::<i64, _>(0)).unwrap_or_default(),
        state: GameState {
            active_clock_id: ClockId(row.get::<String, _>(1)),
            next_clock_id: ClockId(row.get::<String, _>(2)),
            running: row.get::<bool, _>(3),
            clocks,
        },
        config,
    }))
}

/// Durations are stored as whole nanoseconds so a reload reproduces them exactly.
fn nanos(duration: Duration) -> StoreResult<i64> {
    duration
        .num_nanoseconds()
        .ok_or_else(|| GametimeError::Validation(format!("duration {duration} is too long to store")))
}

fn unavailable(err: sqlx::Error) -> GametimeError {
    GametimeError::StoreUnavailable(err.to_string())
}

fn corrupt(lobby_id: &LobbyId, detail: String) -> GametimeError {
    GametimeError::StoreUnavailable(format!("stored lobby {lobby_id} is unreadable: {detail}"))
}

fn insert_error(err: sqlx::Error, id: &str) -> GametimeError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return GametimeError::DuplicateId(id.to_string());
        }
    }
    unavailable(err)
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
