//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the session is opened against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Administrative scope: create/drop/list databases, shutdown.
    Server,
    /// One database: record CRUD, commands, transactions.
    Database { name: String, kind: DatabaseKind },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Graph,
    Document,
}

impl DatabaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseKind::Graph => "graph",
            DatabaseKind::Document => "document",
        }
    }
}

/// Transport knobs applied when the socket is opened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub nodelay: bool,
    pub connect_timeout_ms: Option<u64>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            connect_timeout_ms: Some(10_000),
        }
    }
}

/// Decoder safety limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Upper bound on any single length-prefixed payload the decoder will
    /// allocate for. Larger prefixes are treated as stream corruption.
    pub max_payload_bytes: usize,
    /// Size of each read from the socket into the tail buffer.
    pub read_chunk_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 64 * 1024 * 1024,
            read_chunk_bytes: 64 * 1024,
        }
    }
}

/// Reconnect backoff (exponential, capped).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 5_000,
        }
    }
}

impl BackoffPolicy {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Full connection configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connection: Target,
    /// Default per-call deadline in milliseconds.
    pub timeout_ms: u64,
    /// Minimum server protocol version the client will talk to.
    pub min_protocol: i16,
    /// Reconnect (with backoff) after a transport failure instead of
    /// staying disconnected.
    pub reconnect: bool,
    /// Client name sent in the handshake.
    pub client_name: String,
    /// Driver version string sent in the handshake.
    pub driver_version: String,
    pub socket: SocketOptions,
    pub limits: Limits,
    pub backoff: BackoffPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2424,
            user: "admin".to_string(),
            password: "admin".to_string(),
            connection: Target::Server,
            timeout_ms: 5_000,
            min_protocol: 28,
            reconnect: false,
            client_name: "orientdb-client".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            socket: SocketOptions::default(),
            limits: Limits::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl Config {
    pub fn server(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn database(
        host: impl Into<String>,
        port: u16,
        name: impl Into<String>,
        kind: DatabaseKind,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            connection: Target::Database {
                name: name.into(),
                kind,
            },
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_database(&self) -> bool {
        matches!(self.connection, Target::Database { .. })
    }
}
