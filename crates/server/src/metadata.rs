use std::collections::HashMap;

use async_trait::async_trait;
use cloudplay_protocol::GameMetadata;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only (from the broker's side) lookup of game launch metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, game_id: &str) -> Result<Option<GameMetadata>, MetadataError>;
}

/// Metadata held in memory, seeded from `[[games]]`.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    games: RwLock<HashMap<String, GameMetadata>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later entries with the same `game_id` replace earlier ones.
    pub fn from_games(games: impl IntoIterator<Item = GameMetadata>) -> Self {
        let games = games
            .into_iter()
            .map(|md| (md.game_id.clone(), md))
            .collect();
        Self {
            games: RwLock::new(games),
        }
    }

    pub async fn insert(&self, metadata: GameMetadata) {
        self.games
            .write()
            .await
            .insert(metadata.game_id.clone(), metadata);
    }

    pub async fn remove(&self, game_id: &str) -> Option<GameMetadata> {
        self.games.write().await.remove(game_id)
    }

    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, game_id: &str) -> Result<Option<GameMetadata>, MetadataError> {
        Ok(self.games.read().await.get(game_id).cloned())
    }
}
