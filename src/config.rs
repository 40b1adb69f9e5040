//! Server configuration
//!
//! Parses and validates the echo server configuration from YAML files.
//! serde does the parsing and type conversion; `validate()` rejects values
//! the session manager cannot run with before anything is constructed.

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::manager::SessionManagerConfig;
use crate::session::SessionConfig;

/// Full supervisor-facing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // Accept / capacity
    // ============================================
    /// Accept address, `host:port`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Hard cap on concurrently active sessions.
    #[serde(default = "default_max_session_count")]
    pub max_session_count: usize,

    /// Recycle bin capacity (clean sessions kept for reuse).
    #[serde(default = "default_recycled_session_count")]
    pub recycled_session_count: usize,

    /// Cap on concurrent graceful shutdowns; overflow is force-reset.
    #[serde(default = "default_max_stopping_sessions")]
    pub max_stopping_sessions: usize,

    /// OS listen queue hint.
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,

    /// When set, stop accepting after this many connections; once the last
    /// session finishes the manager reports it has run out of work.
    #[serde(default)]
    pub max_accepted_total: Option<u64>,

    // ============================================
    // Per-session transfer settings
    // ============================================
    /// Cyclic buffer bytes per session.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Per-operation transfer cap in bytes.
    #[serde(default = "default_max_transfer_size")]
    pub max_transfer_size: usize,

    /// SO_RCVBUF override.
    #[serde(default)]
    pub socket_recv_buffer_size: Option<i32>,

    /// SO_SNDBUF override.
    #[serde(default)]
    pub socket_send_buffer_size: Option<i32>,

    /// TCP_NODELAY override.
    #[serde(default)]
    pub no_delay: Option<bool>,

    /// Per-session idle cap in milliseconds; unset disables the timer.
    #[serde(default)]
    pub inactivity_timeout_ms: Option<u64>,

    // ============================================
    // Execution layout
    // ============================================
    /// Dedicated session I/O threads. 0 runs sessions on the supervisor
    /// runtime with a single shared recycle bin.
    #[serde(default)]
    pub session_threads: usize,
}

fn default_endpoint() -> String {
    // RFC 862 echo port.
    "0.0.0.0:7".to_string()
}

fn default_max_session_count() -> usize {
    10_000
}

fn default_recycled_session_count() -> usize {
    100
}

fn default_max_stopping_sessions() -> usize {
    100
}

fn default_listen_backlog() -> u32 {
    128
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_transfer_size() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&contents).with_context(|| format!("In config file {}", path.display()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.endpoint.is_empty(), "endpoint cannot be empty");
        anyhow::ensure!(
            self.max_session_count >= 1,
            "max_session_count must be >= 1"
        );
        anyhow::ensure!(self.buffer_size >= 1, "buffer_size must be >= 1");
        anyhow::ensure!(
            self.max_transfer_size >= 1,
            "max_transfer_size must be >= 1"
        );
        if let Some(size) = self.socket_recv_buffer_size {
            anyhow::ensure!(size >= 0, "socket_recv_buffer_size must be >= 0");
        }
        if let Some(size) = self.socket_send_buffer_size {
            anyhow::ensure!(size >= 0, "socket_send_buffer_size must be >= 0");
        }
        Ok(())
    }

    /// Resolve the accept endpoint to a socket address.
    pub fn resolve_endpoint(&self) -> Result<SocketAddr> {
        self.endpoint
            .to_socket_addrs()
            .with_context(|| format!("Cannot resolve endpoint: {}", self.endpoint))?
            .next()
            .with_context(|| format!("Endpoint resolves to no address: {}", self.endpoint))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_size: self.buffer_size,
            max_transfer_size: self.max_transfer_size,
            socket_recv_buffer_size: self.socket_recv_buffer_size,
            socket_send_buffer_size: self.socket_send_buffer_size,
            no_delay: self.no_delay,
            inactivity_timeout: self.inactivity_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn manager_config(&self) -> Result<SessionManagerConfig> {
        Ok(SessionManagerConfig {
            endpoint: self.resolve_endpoint()?,
            max_session_count: self.max_session_count,
            recycled_session_count: self.recycled_session_count,
            max_stopping_sessions: self.max_stopping_sessions,
            listen_backlog: self.listen_backlog,
            max_accepted_total: self.max_accepted_total,
            session: self.session_config(),
        })
    }

    /// Save configuration to a YAML file. Useful for generating templates.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yaml::to_string(&self).context("Failed to serialize config to YAML")?;
        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;
        Ok(())
    }
}
