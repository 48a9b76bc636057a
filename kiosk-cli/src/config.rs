//! Configuration
//!
//! `kiosk.toml` with `[server]`, `[handshake]`, `[cycle]` and `[worker]`
//! sections. Every field is optional; missing fields take the defaults
//! below, and command-line flags override both.

use kiosk_core::{ClientConfig, MultiEvalConfig, ServerConfig};
use kiosk_ipc::DEFAULT_PORT;
use kiosk_logic::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: IpAddr,
    pub port: u16,
    /// Peers that must handshake before work starts
    pub expected_peers: usize,
    pub send_timeout_ms: u64,
    /// 0 disables alive broadcasts
    pub alive_interval_ms: u64,
    pub reconnect_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            expected_peers: 1,
            send_timeout_ms: 5_000,
            alive_interval_ms: 10_000,
            reconnect_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSection {
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            retries: 20,
            retry_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleSection {
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// Upper bound for one project evaluation
    pub eval_timeout_ms: u64,
}

impl Default for CycleSection {
    fn default() -> Self {
        Self {
            retries: 60,
            retry_delay_ms: 1_000,
            poll_interval_ms: 100,
            eval_timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Evaluation command; the project is appended as last argument
    pub command: Vec<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "test -e \"$0\"".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    pub server: ServerSection,
    pub handshake: HandshakeSection,
    pub cycle: CycleSection,
    pub worker: WorkerSection,
}

impl KioskConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            send_timeout: Duration::from_millis(self.server.send_timeout_ms),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn multi_eval_config(&self) -> MultiEvalConfig {
        MultiEvalConfig {
            server: self.server_config(),
            reconnect_grace: Duration::from_millis(self.server.reconnect_grace_ms),
            alive_interval: match self.server.alive_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_millis(self.handshake.retry_delay_ms),
            send_timeout: Duration::from_millis(self.server.send_timeout_ms),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn handshake_policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            self.handshake.retries,
            Duration::from_millis(self.handshake.retry_delay_ms),
        )
    }

    pub fn cycle_policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            self.cycle.retries,
            Duration::from_millis(self.cycle.retry_delay_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cycle.poll_interval_ms)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle.eval_timeout_ms)
    }
}
