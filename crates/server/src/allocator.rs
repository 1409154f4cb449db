use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cloudplay_protocol::{AllocatorConfig, AllocatorKind};
use serde::{Deserialize, Serialize};

/// Handle to a game-execution host bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedServer {
    /// Host identity; also the secondary session lookup key.
    pub id: String,
    /// Reachable address, when the allocator knows one.
    pub address: Option<String>,
}

impl AllocatedServer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("no free game host available")]
    Exhausted,
    #[error("host '{0}' is not managed by this allocator")]
    UnknownHost(String),
    #[error("allocator does not support releasing hosts")]
    ReleaseUnsupported,
    #[error("allocation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("allocation failed: {0}")]
    Rejected(String),
}

/// Acquires a game-execution host for a new session. No retry contract.
#[async_trait]
pub trait Allocator: Send + Sync {
    async fn allocate(&self) -> Result<AllocatedServer, AllocatorError>;

    /// Hand a host back after its session ends or a create fails.
    async fn release(&self, server: &AllocatedServer) -> Result<(), AllocatorError>;
}

/// Always returns the same host.
pub struct FixedAllocator {
    host: String,
}

impl FixedAllocator {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl Allocator for FixedAllocator {
    async fn allocate(&self) -> Result<AllocatedServer, AllocatorError> {
        Ok(AllocatedServer::new(self.host.clone()))
    }

    async fn release(&self, _server: &AllocatedServer) -> Result<(), AllocatorError> {
        Ok(())
    }
}

/// Finite set of hosts; each is handed out to at most one session at a time.
pub struct HostPool {
    hosts: Vec<String>,
    in_use: Mutex<HashSet<String>>,
}

impl HostPool {
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut seen = HashSet::new();
        let hosts = hosts
            .into_iter()
            .map(Into::into)
            .filter(|h: &String| seen.insert(h.clone()))
            .collect();
        Self {
            hosts,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn available(&self) -> usize {
        let in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        self.hosts.len() - in_use.len()
    }
}

#[async_trait]
impl Allocator for HostPool {
    async fn allocate(&self) -> Result<AllocatedServer, AllocatorError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let host = self
            .hosts
            .iter()
            .find(|h| !in_use.contains(*h))
            .ok_or(AllocatorError::Exhausted)?;
        in_use.insert(host.clone());
        Ok(AllocatedServer::new(host.clone()))
    }

    async fn release(&self, server: &AllocatedServer) -> Result<(), AllocatorError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        if !self.hosts.contains(&server.id) {
            return Err(AllocatorError::UnknownHost(server.id.clone()));
        }
        in_use.remove(&server.id);
        Ok(())
    }
}

#[derive(Serialize)]
struct AllocationRequest<'a> {
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocationResponse {
    #[serde(default)]
    game_server_name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    ports: Vec<AllocationPort>,
}

#[derive(Debug, Deserialize)]
struct AllocationPort {
    #[serde(default)]
    port: u16,
}

/// Allocates hosts from an Agones fleet through the allocator service's
/// REST endpoint.
pub struct AgonesAllocator {
    client: reqwest::Client,
    url: String,
    namespace: String,
}

impl AgonesAllocator {
    pub fn new(addr: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build allocator HTTP client")?;
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        Ok(Self {
            client,
            url: format!("{base}/gameserverallocation"),
            namespace: namespace.into(),
        })
    }
}

#[async_trait]
impl Allocator for AgonesAllocator {
    async fn allocate(&self) -> Result<AllocatedServer, AllocatorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&AllocationRequest {
                namespace: &self.namespace,
            })
            .send()
            .await?
            .error_for_status()?;
        let allocation: AllocationResponse = response.json().await?;

        if allocation.game_server_name.is_empty() {
            return Err(AllocatorError::Rejected(
                "response carried no gameServerName".to_string(),
            ));
        }
        let address = match (allocation.address.is_empty(), allocation.ports.first()) {
            (false, Some(port)) => Some(format!("{}:{}", allocation.address, port.port)),
            (false, None) => Some(allocation.address),
            (true, _) => None,
        };
        tracing::info!(
            host_id = %allocation.game_server_name,
            address = address.as_deref().unwrap_or("-"),
            "Allocated game server"
        );
        Ok(AllocatedServer {
            id: allocation.game_server_name,
            address,
        })
    }

    async fn release(&self, _server: &AllocatedServer) -> Result<(), AllocatorError> {
        // Allocated game servers shut themselves down when the game exits.
        Err(AllocatorError::ReleaseUnsupported)
    }
}

/// Build the allocator selected by `[allocator]`.
pub fn build_allocator(config: &AllocatorConfig) -> Result<Arc<dyn Allocator>> {
    let allocator: Arc<dyn Allocator> = match config.kind {
        AllocatorKind::Fixed => {
            let host = config
                .hosts
                .first()
                .context("allocator.hosts is empty")?;
            tracing::info!(host_id = %host, "Using fixed allocator");
            Arc::new(FixedAllocator::new(host.clone()))
        }
        AllocatorKind::Pool => {
            tracing::info!(hosts = config.hosts.len(), "Using host pool allocator");
            Arc::new(HostPool::new(config.hosts.iter().cloned()))
        }
        AllocatorKind::Agones => {
            let addr = config
                .agones_addr
                .as_deref()
                .context("allocator.agones_addr is required for the agones allocator")?;
            tracing::info!(%addr, namespace = %config.agones_namespace, "Using Agones allocator");
            Arc::new(AgonesAllocator::new(addr, config.agones_namespace.clone())?)
        }
    };
    Ok(allocator)
}
