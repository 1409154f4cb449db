use serde::{Deserialize, Serialize};

use crate::messages::GameMetadata;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudplayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    /// Seed entries for the in-memory game metadata store
    #[serde(default)]
    pub games: Vec<GameMetadata>,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Player-facing HTTP/WebSocket port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Host-facing gRPC port
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    /// Serve the player-facing endpoint over TLS
    #[serde(default)]
    pub tls: bool,
    /// Path to TLS certificate (self-signed if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (self-signed if absent)
    pub tls_key: Option<String>,
    /// Answer CORS preflights for any origin
    #[serde(default = "default_true")]
    pub cors_allow_any_origin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Capacity of each per-session signaling queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound on waiting for a host's answer (0 = the connection's lifetime)
    #[serde(default)]
    pub answer_timeout_secs: u64,
    /// WatchSession poll period
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// Always hand out the first configured host
    #[default]
    Fixed,
    /// Hand out free hosts from `hosts`, returned on session delete
    Pool,
    /// Allocate through an Agones allocator service
    Agones,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default)]
    pub kind: AllocatorKind,
    /// Host identities for `fixed` and `pool`
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    /// `host:port` of the Agones allocator service
    pub agones_addr: Option<String>,
    #[serde(default = "default_agones_namespace")]
    pub agones_namespace: String,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_port: default_http_port(),
            grpc_port: default_grpc_port(),
            tls: false,
            tls_cert: None,
            tls_key: None,
            cors_allow_any_origin: true,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            answer_timeout_secs: 0,
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            kind: AllocatorKind::default(),
            hosts: default_hosts(),
            agones_addr: None,
            agones_namespace: default_agones_namespace(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl CloudplayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- TLS cert/key ---
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !self.server.tls {
                    issues.push(
                        "WARNING: tls_cert/tls_key are set but server.tls is false; \
                         they will be ignored."
                            .to_string(),
                    );
                }
                for (what, path) in [("tls_cert", cert), ("tls_key", key)] {
                    if !std::path::Path::new(path).exists() {
                        issues.push(format!("ERROR: {what} '{path}' does not exist."));
                    }
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                issues.push(
                    "WARNING: only one of tls_cert/tls_key is set. Both must be set for \
                     custom TLS, or omit both for a self-signed certificate."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        // --- Ports ---
        if self.server.http_port == 0 {
            issues.push("ERROR: server.http_port must be between 1 and 65535, got 0.".to_string());
        }
        if self.server.grpc_port == 0 {
            issues.push("ERROR: server.grpc_port must be between 1 and 65535, got 0.".to_string());
        }
        if self.server.http_port != 0 && self.server.http_port == self.server.grpc_port {
            issues.push(format!(
                "ERROR: server.http_port and server.grpc_port are both {}.",
                self.server.http_port
            ));
        }

        // --- Signaling ---
        if self.signaling.queue_capacity == 0 {
            issues.push("ERROR: signaling.queue_capacity must be >= 1.".to_string());
        }
        if self.signaling.watch_interval_ms < 10 {
            issues.push(format!(
                "ERROR: signaling.watch_interval_ms must be at least 10, got {}.",
                self.signaling.watch_interval_ms
            ));
        }

        // --- Allocator ---
        match self.allocator.kind {
            AllocatorKind::Fixed | AllocatorKind::Pool => {
                if self.allocator.hosts.is_empty() {
                    issues.push(
                        "ERROR: allocator.hosts must list at least one host for the \
                         fixed and pool allocators."
                            .to_string(),
                    );
                }
                if self.allocator.hosts.iter().any(|h| h.trim().is_empty()) {
                    issues.push("ERROR: allocator.hosts contains an empty host id.".to_string());
                }
                if self.allocator.kind == AllocatorKind::Fixed && self.allocator.hosts.len() > 1 {
                    issues.push(
                        "WARNING: allocator.kind is 'fixed' but several hosts are listed; \
                         only the first is used."
                            .to_string(),
                    );
                }
            }
            AllocatorKind::Agones => {
                if self.allocator.agones_addr.as_deref().is_none_or(str::is_empty) {
                    issues.push(
                        "ERROR: allocator.agones_addr is required when allocator.kind is 'agones'."
                            .to_string(),
                    );
                }
            }
        }

        // --- Games ---
        let mut seen = std::collections::HashSet::new();
        for game in &self.games {
            if game.game_id.trim().is_empty() {
                issues.push("ERROR: a [[games]] entry has an empty game_id.".to_string());
            } else if !seen.insert(game.game_id.as_str()) {
                issues.push(format!(
                    "WARNING: game '{}' is listed more than once; the last entry wins.",
                    game.game_id
                ));
            }
            if game.command.trim().is_empty() {
                issues.push(format!(
                    "ERROR: game '{}' has an empty command.",
                    game.game_id
                ));
            }
        }
        if self.games.is_empty() {
            issues.push(
                "WARNING: no [[games]] configured; every new game request will return 404."
                    .to_string(),
            );
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_grpc_port() -> u16 {
    50501
}
fn default_true() -> bool {
    true
}
fn default_queue_capacity() -> usize {
    10
}
fn default_watch_interval_ms() -> u64 {
    1000
}
fn default_hosts() -> Vec<String> {
    vec!["localhost".to_string()]
}
fn default_agones_namespace() -> String {
    "default".to_string()
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
