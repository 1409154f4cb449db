pub mod allocator;
pub mod broker;
pub mod config;
pub mod grpc;
pub mod metadata;
pub mod session;
pub mod signaling;
pub mod tls;
pub mod web;

use std::sync::Arc;

use anyhow::Result;
use cloudplay_protocol::CloudplayConfig;

use crate::broker::Broker;
use crate::metadata::InMemoryMetadataStore;
use crate::session::InMemorySessionStore;
use crate::signaling::ChannelRegistry;

/// Wire the in-memory stores, the configured allocator and a fresh channel
/// registry into a broker.
pub fn build_broker(config: &CloudplayConfig) -> Result<Arc<Broker>> {
    let allocator = allocator::build_allocator(&config.allocator)?;
    let metadata = InMemoryMetadataStore::from_games(config.games.iter().cloned());
    Ok(Arc::new(Broker::new(
        Arc::new(InMemorySessionStore::new()),
        Arc::new(metadata),
        allocator,
        ChannelRegistry::new(config.signaling.queue_capacity),
    )))
}
