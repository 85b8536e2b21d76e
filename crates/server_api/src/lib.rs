use std::{collections::HashMap, future::Future, sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{ClockId, LobbyId},
    error::{ApiError, GametimeError},
    lobby::{ClockSpec, Lobby, LobbyUpdate},
    protocol::{CreateLobbyRequest, NewClock},
};
use storage::{LobbyStore, StoreResult};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

pub mod notify;

pub use notify::{LobbyBroadcaster, NoopSink, NotificationSink, Subscription};

/// How long one request may spend talking to the store, and how often a lost
/// compare-and-swap is recomputed against fresh state before giving up.
///
/// `confirm_within` bounds the extra read that settles whether a commit still in
/// flight when the budget ran out actually landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub budget: StdDuration,
    pub max_conflict_retries: u32,
    pub confirm_within: StdDuration,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            budget: StdDuration::from_secs(30),
            max_conflict_retries: 3,
            confirm_within: StdDuration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn LobbyStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub limits: RequestLimits,
    pub now: fn() -> DateTime<Utc>,
}

impl ApiContext {
    pub fn new(store: Arc<dyn LobbyStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            notifier,
            limits: RequestLimits::default(),
            now: Utc::now,
        }
    }

    pub fn with_limits(mut self, limits: RequestLimits) -> Self {
        self.limits = limits;
        self
    }
}

pub async fn create_lobby(ctx: &ApiContext, request: CreateLobbyRequest) -> Result<Lobby, ApiError> {
    let specs = request
        .clocks
        .into_iter()
        .map(clock_spec)
        .collect::<Result<Vec<_>, _>>()?;
    let lobby = Lobby::new(specs)?;

    within_budget(ctx, "create_lobby", ctx.store.create(&lobby)).await?;
    info!(
        lobby_id = %lobby.id,
        clocks = lobby.state.clocks.len(),
        "lobby created"
    );
    Ok(lobby)
}

pub async fn get_lobby(ctx: &ApiContext, lobby_id: &LobbyId) -> Result<Lobby, ApiError> {
    within_budget(ctx, "get_lobby", ctx.store.get_by_id(lobby_id)).await
}

/// Starts the lobby's active clock.
///
/// Dropping the future before the commit is issued cancels the start. Once issued,
/// the commit runs to completion on its own task and viewers are notified if it
/// lands, whether or not the caller is still waiting.
pub async fn start_lobby(ctx: &ApiContext, lobby_id: &LobbyId) -> Result<Lobby, ApiError> {
    let lobby = mutate(ctx, Change::Start(lobby_id)).await?;
    info!(%lobby_id, version = lobby.version, "lobby started");
    Ok(lobby)
}

/// Presses `clock_id`, handing the turn to the next clock.
///
/// Each attempt reads the current time afresh, so a retried press is timed
/// against the state it actually commits on. Cancellation behaves as for
/// [`start_lobby`].
pub async fn press_clock(ctx: &ApiContext, clock_id: &ClockId) -> Result<Lobby, ApiError> {
    let lobby = mutate(ctx, Change::Press(clock_id)).await?;
    info!(
        lobby_id = %lobby.id,
        %clock_id,
        active_clock_id = %lobby.state.active_clock_id,
        version = lobby.version,
        "clock pressed"
    );
    Ok(lobby)
}

#[derive(Clone, Copy)]
enum Change<'a> {
    Start(&'a LobbyId),
    Press(&'a ClockId),
}

impl Change<'_> {
    fn operation(self) -> &'static str {
        match self {
            Change::Start(_) => "start_lobby",
            Change::Press(_) => "press_clock",
        }
    }

    async fn load(self, store: &dyn LobbyStore) -> StoreResult<Lobby> {
        match self {
            Change::Start(lobby_id) => store.get_by_id(lobby_id).await,
            Change::Press(clock_id) => store.get_by_clock_id(clock_id).await,
        }
    }

    fn compute(self, lobby: &mut Lobby, now: DateTime<Utc>) -> StoreResult<LobbyUpdate> {
        match self {
            Change::Start(_) => lobby.start(now),
            Change::Press(clock_id) => lobby.advance(clock_id, now),
        }
    }
}

/// Read, compute, commit under one deadline, recomputing after a lost
/// compare-and-swap up to `max_conflict_retries` times.
async fn mutate(ctx: &ApiContext, change: Change<'_>) -> Result<Lobby, ApiError> {
    let operation = change.operation();
    let limits = ctx.limits;
    let deadline = Instant::now() + limits.budget;
    let mut retries = 0;

    loop {
        let outcome = match timeout_at(deadline, change.load(ctx.store.as_ref())).await {
            Err(_) => Err(out_of_time(operation, limits.budget)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(read)) => {
                let mut next = read.clone();
                match change.compute(&mut next, (ctx.now)()) {
                    Ok(update) => commit_detached(ctx, operation, read, update, deadline).await,
                    Err(err) => Err(err),
                }
            }
        };

        match outcome {
            Ok(lobby) => return Ok(lobby),
            Err(err) if err.is_retryable() && retries < limits.max_conflict_retries => {
                retries += 1;
                warn!(operation, retries, error = %err, "lost a concurrent update, retrying");
            }
            Err(err) => {
                debug!(operation, code = ?err.code(), error = %err, "request rejected");
                return Err(err.into());
            }
        }
    }
}

/// Commits on a task of its own that notifies viewers itself, so a change that
/// lands is announced exactly once even when the caller has stopped waiting.
async fn commit_detached(
    ctx: &ApiContext,
    operation: &'static str,
    read: Lobby,
    update: LobbyUpdate,
    deadline: Instant,
) -> StoreResult<Lobby> {
    let store = Arc::clone(&ctx.store);
    let notifier = Arc::clone(&ctx.notifier);
    let limits = ctx.limits;

    let task = tokio::spawn(async move {
        let commit = store.commit(&read.id, read.version, &update);
        let committed = match timeout_at(deadline, commit).await {
            Ok(result) => result,
            Err(_) => confirm_landed(store.as_ref(), &read, &update, limits.confirm_within)
                .await
                .inspect(|_| info!(operation, lobby_id = %read.id, "commit confirmed after the budget ran out"))
                .ok_or_else(|| out_of_time(operation, limits.budget)),
        };
        if let Ok(lobby) = &committed {
            notifier.notify(&lobby.id);
        }
        committed
    });

    task.await.map_err(|err| {
        GametimeError::StoreUnavailable(format!("{operation} commit did not complete: {err}"))
    })?
}

/// Re-reads the lobby and reports it if `update` is part of its history.
async fn confirm_landed(
    store: &dyn LobbyStore,
    read: &Lobby,
    update: &LobbyUpdate,
    within: StdDuration,
) -> Option<Lobby> {
    let stored = timeout(within, store.get_by_id(&read.id)).await.ok()?.ok()?;
    landed(read, update, &stored).then_some(stored)
}

/// Whether every event `update` appends to `read` sits at its expected position in `stored`.
fn landed(read: &Lobby, update: &LobbyUpdate, stored: &Lobby) -> bool {
    if stored.version <= read.version {
        return false;
    }
    let mut appended: HashMap<usize, usize> = HashMap::new();
    update.pushes.iter().all(|push| {
        let offset = appended.entry(push.clock_index).or_default();
        let index = read
            .state
            .clocks
            .get(push.clock_index)
            .map_or(0, |clock| clock.timeline.events().len())
            + *offset;
        *offset += 1;
        stored
            .state
            .clocks
            .get(push.clock_index)
            .and_then(|clock| clock.timeline.events().get(index))
            == Some(&push.event)
    })
}

async fn within_budget<T>(
    ctx: &ApiContext,
    operation: &'static str,
    request: impl Future<Output = StoreResult<T>>,
) -> Result<T, ApiError> {
    let outcome = match timeout(ctx.limits.budget, request).await {
        Ok(outcome) => outcome,
        Err(_) => Err(out_of_time(operation, ctx.limits.budget)),
    };
    outcome.map_err(|err| {
        debug!(operation, code = ?err.code(), error = %err, "request rejected");
        err.into()
    })
}

fn out_of_time(operation: &str, budget: StdDuration) -> GametimeError {
    warn!(operation, ?budget, "request ran out of time");
    GametimeError::StoreUnavailable(format!("{operation} did not finish within {budget:?}"))
}

fn clock_spec(clock: NewClock) -> Result<ClockSpec, GametimeError> {
    Ok(ClockSpec {
        initial_time: seconds(clock.initial_time_secs, "initial_time_secs")?,
        increment: seconds(clock.increment_secs, "increment_secs")?,
        name: clock.name,
    })
}

fn seconds(value: u64, field: &str) -> Result<Duration, GametimeError> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| GametimeError::Validation(format!("{field} is out of range")))
}
