//! Peer Supervisor
//!
//! Spawns local peer processes that connect back to this server over TCP
//! and reaps them when done.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hidden flag that turns the binary into an evaluation worker
pub const WORKER_FLAG: &str = "--kiosk-worker";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn peer: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Peer {pid} did not exit within {waited:?}")]
    ShutdownTimeout { pid: u32, waited: Duration },
}

/// What a spawned peer runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Evaluation worker for the MultiEval server
    Evaluator,
    /// Multi-robot measurement instance
    Robot,
}

impl PeerRole {
    /// Arguments that start `self` against `server`
    pub fn args(self, server: SocketAddr, config: Option<&Path>) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = config {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        match self {
            PeerRole::Evaluator => {
                args.push(WORKER_FLAG.to_string());
                args.push("--connect".to_string());
                args.push(server.to_string());
            }
            PeerRole::Robot => {
                args.push("robot".to_string());
                args.push("--connect".to_string());
                args.push(server.to_string());
            }
        }
        args
    }
}

/// Spawned peer process
pub struct PeerHandle {
    child: Child,
    role: Option<PeerRole>,
}

impl PeerHandle {
    /// Spawn this executable as `role`
    pub fn spawn(
        role: PeerRole,
        server: SocketAddr,
        config: Option<&Path>,
    ) -> Result<Self, SupervisorError> {
        let binary = env::current_exe()?;
        let mut handle = Self::spawn_binary(&binary, &role.args(server, config))?;
        handle.role = Some(role);
        Ok(handle)
    }

    /// Spawn an arbitrary binary (tests, external peers)
    pub fn spawn_binary(binary: &Path, args: &[String]) -> Result<Self, SupervisorError> {
        let child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!(pid = child.id(), binary = %binary.display(), "Peer spawned");
        Ok(Self { child, role: None })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.role
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait up to `timeout` for the peer to exit on its own
    pub fn wait_exit(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::ShutdownTimeout {
                    pid: self.pid(),
                    waited: timeout,
                });
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn kill(&mut self) -> Result<(), SupervisorError> {
        self.child.kill()?;
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Pool of local peers
pub struct Supervisor {
    peers: Vec<PeerHandle>,
    config_path: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            peers: Vec::new(),
            config_path,
        }
    }

    /// Spawn `count` peers of `role` pointed at `server`
    pub fn spawn(
        &mut self,
        role: PeerRole,
        count: usize,
        server: SocketAddr,
    ) -> Result<(), SupervisorError> {
        for _ in 0..count {
            let handle = PeerHandle::spawn(role, server, self.config_path.as_deref())?;
            info!(pid = handle.pid(), ?role, "Local peer started");
            self.peers.push(handle);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.peers.iter().map(PeerHandle::pid).collect()
    }

    /// Drop peers that already exited, returning their pids
    pub fn reap(&mut self) -> Vec<u32> {
        let mut exited = Vec::new();
        self.peers.retain_mut(|peer| {
            if peer.is_alive() {
                true
            } else {
                exited.push(peer.pid());
                false
            }
        });
        if !exited.is_empty() {
            warn!(?exited, "Local peers exited");
        }
        exited
    }

    /// Give every peer `grace` to exit after the server said so, then kill
    /// the rest
    pub fn shutdown(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for mut peer in self.peers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = peer.wait_exit(remaining) {
                warn!(error = %e, "Killing peer");
                let _ = peer.kill();
            }
        }
    }
}
