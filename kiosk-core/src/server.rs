//! Communication Server
//!
//! Owns the listening socket and every accepted [`ConnectionHandler`], and
//! drives all of them from one bounded `poll(2)` per tick. Everything runs on
//! the caller's thread; no call blocks longer than its timeout.

use crate::error::CommError;
use crate::handler::{ConnectionHandler, HandlerId, HandlerInfo, PeerIdentity, Role};
use crate::poll::{self, Interest};
use kiosk_ipc::{Signal, SignalKind, SignalRegistry};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Server tuning
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound for flushing one broadcast to one peer
    pub send_timeout: Duration,
    /// Poll granularity inside long waits
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Signal received from a peer, tagged with its handler
#[derive(Debug, Clone)]
pub struct Inbound {
    pub handler: HandlerId,
    pub identity: Option<PeerIdentity>,
    pub signal: Signal,
}

/// Handler removed after its connection dropped
#[derive(Debug, Clone)]
pub struct LostPeer {
    pub handler: HandlerId,
    pub identity: Option<PeerIdentity>,
    pub peer_addr: SocketAddr,
    pub reason: Option<String>,
}

/// Dispatch policy: the first idle candidate, otherwise the last one.
///
/// Callers rely on the fallback landing on the most recently added peer when
/// every peer is busy, so this is deliberately not round-robin.
pub fn pick_dispatch_target<T>(candidates: &[T], is_idle: impl Fn(&T) -> bool) -> Option<&T> {
    candidates
        .iter()
        .find(|candidate| is_idle(candidate))
        .or_else(|| candidates.last())
}

pub struct CommunicationServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handlers: Vec<ConnectionHandler>,
    inbox: VecDeque<Inbound>,
    lost: Vec<LostPeer>,
    next_id: u64,
    own_pid: u32,
    config: ServerConfig,
    registry: Arc<SignalRegistry>,
}

impl CommunicationServer {
    /// Bind a non-blocking listener
    pub fn bind(
        addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<SignalRegistry>,
    ) -> Result<Self, CommError> {
        let listener = TcpListener::bind(addr).map_err(|source| CommError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Signal server listening");

        Ok(Self {
            listener,
            local_addr,
            handlers: Vec::new(),
            inbox: VecDeque::new(),
            lost: Vec::new(),
            next_id: 1,
            own_pid: std::process::id(),
            config,
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    /// Run one multiplexer tick.
    ///
    /// Waits up to `timeout` for socket readiness, accepts new peers, moves
    /// bytes in both directions, processes decoded signals and prunes closed
    /// handlers. Returns whether any signal was processed.
    pub fn process_signals(&mut self, timeout: Duration) -> bool {
        let mut interests = Vec::with_capacity(self.handlers.len() + 1);
        interests.push(Interest {
            fd: self.listener.as_raw_fd(),
            read: true,
            write: false,
        });
        for handler in &self.handlers {
            interests.push(Interest {
                fd: handler.raw_fd(),
                read: handler.is_connected(),
                write: handler.wants_write(),
            });
        }

        let readiness = match poll::wait_for_readiness(&interests, timeout) {
            Ok(readiness) => readiness,
            Err(e) => {
                error!(error = %e, "poll failed");
                return false;
            }
        };

        // Readiness entries line up with handlers as they were before accepting
        for (handler, ready) in self.handlers.iter_mut().zip(readiness.iter().skip(1)) {
            if ready.readable || ready.closed {
                handler.on_readable();
            }
            if ready.writable {
                handler.on_writable();
            }
        }

        if readiness.first().is_some_and(|ready| ready.readable) {
            self.accept_pending();
        }

        let mut processed = false;
        for handler in &mut self.handlers {
            processed |= handler.process_signals();
            let identity = handler.identity();
            while let Some(signal) = handler.pop_result() {
                self.inbox.push_back(Inbound {
                    handler: handler.id(),
                    identity,
                    signal,
                });
            }
        }

        self.prune_closed();
        processed
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = HandlerId(self.next_id);
                    self.next_id += 1;
                    match ConnectionHandler::new(
                        id,
                        Role::Server,
                        stream,
                        self.own_pid,
                        Arc::clone(&self.registry),
                    ) {
                        Ok(handler) => {
                            info!(handler = %id, peer = %addr, "Peer connected");
                            self.handlers.push(handler);
                        }
                        Err(e) => warn!(peer = %addr, error = %e, "Rejecting peer"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn prune_closed(&mut self) {
        let lost = &mut self.lost;
        self.handlers.retain(|handler| {
            if handler.is_connected() {
                return true;
            }
            warn!(
                handler = %handler.id(),
                peer = %handler.peer_addr(),
                reason = handler.close_reason().unwrap_or("unknown"),
                "Connection lost"
            );
            lost.push(LostPeer {
                handler: handler.id(),
                identity: handler.identity(),
                peer_addr: handler.peer_addr(),
                reason: handler.close_reason().map(str::to_string),
            });
            false
        });
    }

    /// Broadcast a signal to every connected peer and flush it.
    ///
    /// Returns `true` only when every peer took the frame. A peer that cannot
    /// take it within the send timeout is closed and shows up as lost on the
    /// next tick.
    pub fn send_signal(&mut self, signal: &Signal) -> bool {
        let mut targeted = 0;
        for handler in self.handlers.iter_mut().filter(|h| h.is_connected()) {
            // Framing fails the same way for every peer, so nothing was queued
            if let Err(e) = handler.queue_signal(signal) {
                warn!(signal = %self.registry.label(signal), error = %e, "Broadcast not sent");
                return false;
            }
            targeted += 1;
        }
        if targeted == 0 {
            debug!(signal = %self.registry.label(signal), "Broadcast without peers");
            return false;
        }

        let timeout = self.config.send_timeout;
        let mut delivered = 0;
        for handler in self.handlers.iter_mut().filter(|h| h.is_connected()) {
            match handler.flush(timeout) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(handler = %handler.id(), error = %e, "Broadcast failed"),
            }
        }
        if delivered < targeted {
            warn!(delivered, targeted, "Broadcast reached only some peers");
        }
        delivered == targeted
    }

    /// Send a signal to one handler and flush it
    pub fn send_to(&mut self, id: HandlerId, signal: &Signal) -> Result<(), CommError> {
        let timeout = self.config.send_timeout;
        let handler = self.handler_mut(id).ok_or(CommError::ConnectionClosed)?;
        handler.send_signal(signal, timeout)
    }

    /// Candidate for the next job: the first idle connected peer, otherwise
    /// the most recently added one
    pub fn select_dispatch_target(&self) -> Option<HandlerId> {
        let connected: Vec<&ConnectionHandler> =
            self.handlers.iter().filter(|h| h.is_connected()).collect();
        pick_dispatch_target(&connected, |h| h.is_idle()).map(|h| h.id())
    }

    /// Send `Evaluate` for `project` to the selected peer and mark it busy
    pub fn send_evaluate(&mut self, project: &str) -> Result<HandlerId, CommError> {
        let target = self.select_dispatch_target().ok_or(CommError::NoPeers)?;
        let signal = Signal::text(SignalKind::Evaluate, project);
        self.send_to(target, &signal)?;
        if let Some(handler) = self.handler_mut(target) {
            handler.set_idle(false);
        }
        info!(handler = %target, project, "Evaluation dispatched");
        Ok(target)
    }

    /// Queue an alive signal to every peer; frames go out on the next ticks
    pub fn broadcast_alive(&mut self) {
        for handler in self.handlers.iter_mut().filter(|h| h.is_connected()) {
            handler.send_alive();
        }
    }

    /// Poll until `expected` peers completed the handshake.
    ///
    /// Retries `retries` times, each retry polling for `retry_delay`.
    pub fn wait_for_first_connection(
        &mut self,
        expected: usize,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<(), CommError> {
        let started = Instant::now();
        for attempt in 0..=retries {
            if self.handshaked_count() >= expected {
                info!(peers = self.handshaked_count(), "All expected peers connected");
                return Ok(());
            }
            if attempt == retries {
                break;
            }
            debug!(
                attempt = attempt + 1,
                retries,
                handshaked = self.handshaked_count(),
                expected,
                "Waiting for peers"
            );
            let deadline = Instant::now() + retry_delay;
            while Instant::now() < deadline && self.handshaked_count() < expected {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.process_signals(remaining.min(self.config.poll_interval));
            }
        }

        Err(CommError::HandshakeTimeout {
            expected,
            handshaked: self.handshaked_count(),
            waited: started.elapsed(),
        })
    }

    /// Next signal received from any peer, in arrival order per tick
    pub fn pop_result(&mut self) -> Option<Inbound> {
        self.inbox.pop_front()
    }

    pub fn take_results(&mut self) -> Vec<Inbound> {
        self.inbox.drain(..).collect()
    }

    /// Remove every received signal of `kind`, keeping the others in order
    pub fn take_results_of(&mut self, kind: SignalKind) -> Vec<Inbound> {
        let mut taken = Vec::new();
        self.inbox.retain(|inbound| {
            if inbound.signal == kind {
                taken.push(inbound.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Handlers pruned since the last call
    pub fn drain_lost(&mut self) -> Vec<LostPeer> {
        std::mem::take(&mut self.lost)
    }

    pub fn connected_count(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_connected()).count()
    }

    pub fn handshaked_count(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_handshaked()).count()
    }

    /// Whether `expected` peers are handshaked
    pub fn all_handshaked(&self, expected: usize) -> bool {
        self.handshaked_count() >= expected
    }

    pub fn handler(&self, id: HandlerId) -> Option<&ConnectionHandler> {
        self.handlers.iter().find(|h| h.id() == id)
    }

    pub fn handler_mut(&mut self, id: HandlerId) -> Option<&mut ConnectionHandler> {
        self.handlers.iter_mut().find(|h| h.id() == id)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &ConnectionHandler> {
        self.handlers.iter()
    }

    pub fn handler_infos(&self) -> Vec<HandlerInfo> {
        self.handlers.iter().map(ConnectionHandler::info).collect()
    }

    /// Close one handler; it is pruned on the next tick
    pub fn close_handler(&mut self, id: HandlerId, reason: &str) -> bool {
        match self.handler_mut(id) {
            Some(handler) => {
                handler.close(reason);
                true
            }
            None => false,
        }
    }

    /// Tell every peer to exit, then close all connections
    pub fn shutdown(&mut self) {
        if self.connected_count() > 0 {
            self.send_signal(&Signal::empty(SignalKind::Exit));
        }
        for handler in &mut self.handlers {
            handler.close("server shutdown");
        }
        self.prune_closed();
        info!(addr = %self.local_addr, "Signal server stopped");
    }
}
