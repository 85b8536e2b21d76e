use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use shared::{
    domain::{ClockId, LobbyId},
    error::GametimeError,
    lobby::{Lobby, LobbyUpdate},
};
use tokio::sync::RwLock;

use crate::{LobbyStore, StoreResult};

#[derive(Default)]
struct MemoryState {
    lobbies: HashMap<LobbyId, Lobby>,
    clock_owners: HashMap<ClockId, LobbyId>,
}

/// Process-local lobby store. Clones share the same maps.
#[derive(Clone, Default)]
pub struct MemoryLobbyStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryLobbyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LobbyStore for MemoryLobbyStore {
    async fn create(&self, lobby: &Lobby) -> StoreResult<()> {
        lobby.check_invariants()?;
        let mut state = self.state.write().await;
        if state.lobbies.contains_key(&lobby.id) {
            return Err(GametimeError::DuplicateId(lobby.id.to_string()));
        }
        if let Some(clock) = lobby
            .state
            .clocks
            .iter()
            .find(|clock| state.clock_owners.contains_key(&clock.id))
        {
            return Err(GametimeError::DuplicateId(clock.id.to_string()));
        }

        for clock in &lobby.state.clocks {
            state
                .clock_owners
                .insert(clock.id.clone(), lobby.id.clone());
        }
        state.lobbies.insert(lobby.id.clone(), lobby.clone());
        Ok(())
    }

    async fn get_by_id(&self, lobby_id: &LobbyId) -> StoreResult<Lobby> {
        self.state
            .read()
            .await
            .lobbies
            .get(lobby_id)
            .cloned()
            .ok_or_else(|| GametimeError::LobbyNotFound(lobby_id.clone()))
    }

    async fn get_by_clock_id(&self, clock_id: &ClockId) -> StoreResult<Lobby> {
        let state = self.state.read().await;
        state
            .clock_owners
            .get(clock_id)
            .and_then(|lobby_id| state.lobbies.get(lobby_id))
            .cloned()
            .ok_or_else(|| GametimeError::ClockNotFound(clock_id.clone()))
    }

    async fn commit(
        &self,
        lobby_id: &LobbyId,
        expected_version: u64,
        update: &LobbyUpdate,
    ) -> StoreResult<Lobby> {
        let mut state = self.state.write().await;
        let stored = state
            .lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| GametimeError::LobbyNotFound(lobby_id.clone()))?;
        if stored.version != expected_version {
            return Err(GametimeError::Conflict(lobby_id.clone()));
        }

        let mut next = stored.clone();
        next.apply_update(update)?;
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }
}
