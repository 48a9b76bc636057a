//! MultiEval Server
//!
//! A [`CommunicationServer`] whose peers are tracked by logical identity
//! `(ip, pid)` instead of by socket. A peer that drops and reconnects within
//! `reconnect_grace` keeps its idle state and subprocess pid; a peer on the
//! terminated list is refused whenever it comes back.

use crate::error::CommError;
use crate::handler::{HandlerId, PeerIdentity};
use crate::server::{CommunicationServer, Inbound, LostPeer, ServerConfig};
use fxhash::{FxHashMap, FxHashSet};
use kiosk_ipc::{Signal, SignalKind, SignalRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MultiEvalConfig {
    pub server: ServerConfig,
    /// How long a lost peer's record survives waiting for a reconnect
    pub reconnect_grace: Duration,
    /// Interval between `ServerAlive` broadcasts, `None` disables them
    pub alive_interval: Option<Duration>,
}

impl Default for MultiEvalConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            reconnect_grace: Duration::from_secs(30),
            alive_interval: Some(Duration::from_secs(10)),
        }
    }
}

/// Last known state of one logical peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    pub idle: bool,
    /// Evaluation subprocess announced with `Process`
    pub subprocess_pid: Option<u32>,
    pub address: SocketAddr,
    /// Live handler, `None` while waiting for a reconnect
    pub handler: Option<HandlerId>,
    pub lost_at: Option<Instant>,
}

pub struct MultiEvalServer {
    server: CommunicationServer,
    records: FxHashMap<PeerIdentity, PeerRecord>,
    bound: FxHashMap<HandlerId, PeerIdentity>,
    terminated: FxHashSet<PeerIdentity>,
    lost: Vec<LostPeer>,
    config: MultiEvalConfig,
    last_alive_broadcast: Instant,
}

impl MultiEvalServer {
    pub fn bind(
        addr: SocketAddr,
        config: MultiEvalConfig,
        registry: Arc<SignalRegistry>,
    ) -> Result<Self, CommError> {
        let server = CommunicationServer::bind(addr, config.server.clone(), registry)?;
        Ok(Self {
            server,
            records: FxHashMap::default(),
            bound: FxHashMap::default(),
            terminated: FxHashSet::default(),
            lost: Vec::new(),
            config,
            last_alive_broadcast: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &CommunicationServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut CommunicationServer {
        &mut self.server
    }

    /// Run one tick and reconcile the identity registry with the live
    /// handlers. Returns whether any signal was processed.
    pub fn process_signals(&mut self, timeout: Duration) -> bool {
        let processed = self.server.process_signals(timeout);

        self.bind_new_handlers();
        self.absorb_lost();
        self.sync_idle();
        self.prune_expired();
        self.maybe_broadcast_alive();

        processed
    }

    fn bind_new_handlers(&mut self) {
        let fresh: Vec<(HandlerId, PeerIdentity, SocketAddr, bool)> = self
            .server
            .handlers()
            .filter(|h| h.is_handshaked() && !self.bound.contains_key(&h.id()))
            .filter_map(|h| {
                h.identity()
                    .map(|identity| (h.id(), identity, h.peer_addr(), h.is_idle()))
            })
            .collect();

        for (id, identity, address, idle_now) in fresh {
            if self.terminated.contains(&identity) {
                warn!(handler = %id, peer = %identity, "Refusing terminated peer");
                self.server.close_handler(id, "peer terminated");
                // Mark as seen so the refusal is logged once
                self.bound.insert(id, identity);
                continue;
            }

            match self.records.get_mut(&identity) {
                Some(record) => {
                    if let Some(previous) = record.handler.replace(id) {
                        if previous != id {
                            self.bound.remove(&previous);
                            debug!(old = %previous, new = %id, peer = %identity, "Identity moved to new handler");
                        }
                    }
                    let idle = record.idle || idle_now;
                    record.lost_at = None;
                    record.address = address;
                    record.idle = idle;
                    if let Some(handler) = self.server.handler_mut(id) {
                        handler.set_idle(idle);
                    }
                    info!(handler = %id, peer = %identity, idle, "Peer reconnected");
                }
                None => {
                    self.records.insert(
                        identity,
                        PeerRecord {
                            identity,
                            idle: idle_now,
                            subprocess_pid: None,
                            address,
                            handler: Some(id),
                            lost_at: None,
                        },
                    );
                    info!(handler = %id, peer = %identity, "Peer registered");
                }
            }
            self.bound.insert(id, identity);
        }

        // Process reports are registry bookkeeping, everything else goes on
        for inbound in self.server.take_results_of(SignalKind::Process) {
            self.record_process(&inbound);
        }
    }

    fn record_process(&mut self, inbound: &Inbound) {
        let payload = inbound.signal.payload_str();
        let Some(identity) = inbound.identity else {
            warn!(handler = %inbound.handler, "Process report before handshake");
            return;
        };
        let Some(record) = self.records.get_mut(&identity) else {
            return;
        };
        match payload.trim().parse::<u32>() {
            Ok(pid) => {
                debug!(peer = %identity, subprocess = pid, "Subprocess reported");
                record.subprocess_pid = Some(pid);
            }
            Err(_) => warn!(peer = %identity, payload = %payload, "Invalid process id"),
        }
    }

    fn absorb_lost(&mut self) {
        let now = Instant::now();
        for lost in self.server.drain_lost() {
            let identity = self.bound.remove(&lost.handler);
            if let Some(record) = identity.and_then(|identity| self.records.get_mut(&identity)) {
                if record.handler == Some(lost.handler) {
                    record.handler = None;
                    record.lost_at = Some(now);
                    info!(
                        peer = %record.identity,
                        grace = ?self.config.reconnect_grace,
                        "Peer lost, waiting for reconnect"
                    );
                }
            }
            self.lost.push(lost);
        }
    }

    fn sync_idle(&mut self) {
        for (id, identity) in &self.bound {
            let Some(handler) = self.server.handler(*id) else {
                continue;
            };
            if let Some(record) = self.records.get_mut(identity) {
                if record.handler == Some(*id) {
                    record.idle = handler.is_idle();
                }
            }
        }
    }

    fn prune_expired(&mut self) {
        let grace = self.config.reconnect_grace;
        self.records.retain(|identity, record| match record.lost_at {
            Some(lost_at) if lost_at.elapsed() >= grace => {
                info!(peer = %identity, "Peer record expired");
                false
            }
            _ => true,
        });
    }

    fn maybe_broadcast_alive(&mut self) {
        let Some(interval) = self.config.alive_interval else {
            return;
        };
        if self.last_alive_broadcast.elapsed() >= interval {
            self.server.broadcast_alive();
            self.last_alive_broadcast = Instant::now();
        }
    }

    /// Send `Evaluate` to the first idle peer, otherwise the last one
    pub fn dispatch_evaluate(&mut self, project: &str) -> Result<HandlerId, CommError> {
        let id = self.server.send_evaluate(project)?;
        if let Some(record) = self
            .bound
            .get(&id)
            .and_then(|identity| self.records.get_mut(identity))
        {
            record.idle = false;
        }
        Ok(id)
    }

    /// Tell a logical peer to exit and refuse it from now on
    pub fn terminate(&mut self, identity: PeerIdentity) -> bool {
        self.terminated.insert(identity);
        let handlers: Vec<HandlerId> = self
            .server
            .handlers()
            .filter(|h| h.identity() == Some(identity) && h.is_connected())
            .map(|h| h.id())
            .collect();

        for id in &handlers {
            if let Err(e) = self.server.send_to(*id, &Signal::empty(SignalKind::Exit)) {
                debug!(handler = %id, error = %e, "Exit not delivered");
            }
            self.server.close_handler(*id, "peer terminated");
        }
        self.records.remove(&identity);
        info!(peer = %identity, handlers = handlers.len(), "Peer terminated");
        !handlers.is_empty()
    }

    pub fn is_terminated(&self, identity: &PeerIdentity) -> bool {
        self.terminated.contains(identity)
    }

    pub fn record(&self, identity: &PeerIdentity) -> Option<&PeerRecord> {
        self.records.get(identity)
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// Identity bound to a live handler
    pub fn identity_of(&self, id: HandlerId) -> Option<PeerIdentity> {
        self.bound.get(&id).copied()
    }

    pub fn idle_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.handler.is_some() && r.idle)
            .count()
    }

    pub fn wait_for_first_connection(
        &mut self,
        expected: usize,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<(), CommError> {
        self.server
            .wait_for_first_connection(expected, retries, retry_delay)?;
        self.bind_new_handlers();
        Ok(())
    }

    pub fn pop_result(&mut self) -> Option<Inbound> {
        self.server.pop_result()
    }

    /// Handlers lost since the last call
    pub fn drain_lost(&mut self) -> Vec<LostPeer> {
        std::mem::take(&mut self.lost)
    }

    pub fn shutdown(&mut self) {
        self.server.shutdown();
        self.bound.clear();
    }
}
