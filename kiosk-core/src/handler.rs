//! Connection Handler
//!
//! Owns one TCP peer connection: a non-blocking socket, the inbound frame
//! decoder, the decoded `todo` queue, the `results` queue handed to the
//! orchestration layer, and the outbound frame queue.
//!
//! Lifecycle: `Connected` on accept/connect, `Handshaked` once a `Handshake`
//! signal has been exchanged, `Closed` after any socket error or explicit
//! close. A closed handler keeps whatever it already decoded so the owner can
//! still drain it before dropping the handler.

use crate::error::CommError;
use crate::poll;
use kiosk_ipc::{FrameDecoder, OutboundQueue, Signal, SignalKind, SignalRegistry};
use std::collections::VecDeque;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Bytes read per `read()` call
const READ_CHUNK: usize = 4096;

/// Process-local handler number, for logs and addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical peer identity: address plus the process id announced in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub ip: IpAddr,
    pub pid: u32,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.pid)
    }
}

/// Which side of the connection this handler is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a server
    Server,
    /// Dialled by a client
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Connected,
    Handshaked,
    Closed,
}

/// Point-in-time view of a handler
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub peer_addr: SocketAddr,
    pub peer_pid: Option<u32>,
    pub state: HandlerState,
    pub idle: bool,
    pub last_alive: Option<Instant>,
}

type BuiltinFn = fn(&mut ConnectionHandler, &Signal);

/// Protocol bookkeeping signals consumed by the handler itself
fn builtin(kind: SignalKind) -> Option<BuiltinFn> {
    match kind {
        SignalKind::Handshake => Some(ConnectionHandler::on_handshake as BuiltinFn),
        SignalKind::ServerAlive | SignalKind::ClientAlive => {
            Some(ConnectionHandler::on_alive as BuiltinFn)
        }
        SignalKind::Idle => Some(ConnectionHandler::on_idle as BuiltinFn),
        _ => None,
    }
}

pub struct ConnectionHandler {
    id: HandlerId,
    role: Role,
    stream: TcpStream,
    peer_addr: SocketAddr,
    own_pid: u32,
    state: HandlerState,
    decoder: FrameDecoder,
    /// Decoded, not yet processed
    todo: VecDeque<Signal>,
    /// Processed, waiting for the orchestration layer
    results: VecDeque<Signal>,
    outbound: OutboundQueue,
    handshake_sent: bool,
    peer_pid: Option<u32>,
    idle: bool,
    last_alive: Option<Instant>,
    close_reason: Option<String>,
    registry: Arc<SignalRegistry>,
}

impl ConnectionHandler {
    /// Wrap a connected stream. The socket is switched to non-blocking mode.
    pub fn new(
        id: HandlerId,
        role: Role,
        stream: TcpStream,
        own_pid: u32,
        registry: Arc<SignalRegistry>,
    ) -> Result<Self, CommError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;

        Ok(Self {
            id,
            role,
            stream,
            peer_addr,
            own_pid,
            state: HandlerState::Connected,
            decoder: FrameDecoder::new(),
            todo: VecDeque::new(),
            results: VecDeque::new(),
            outbound: OutboundQueue::new(),
            handshake_sent: false,
            peer_pid: None,
            idle: false,
            last_alive: None,
            close_reason: None,
            registry,
        })
    }

    /// Read everything available and decode complete frames into `todo`.
    ///
    /// Returns the number of signals decoded. End of stream or a read error
    /// closes the handler; frames that arrived before that are still decoded.
    pub fn on_readable(&mut self) -> usize {
        if self.state == HandlerState::Closed {
            return 0;
        }

        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.close("peer closed connection");
                    break;
                }
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(&format!("read failed: {}", e));
                    break;
                }
            }
        }

        let mut decoded = 0;
        loop {
            match self.decoder.next_signal() {
                Ok(Some(signal)) => {
                    trace!(handler = %self.id, signal = %self.registry.label(&signal), "Decoded frame");
                    self.todo.push_back(signal);
                    decoded += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    self.decoder.clear();
                    self.close(&format!("framing error: {}", e));
                    break;
                }
            }
        }
        decoded
    }

    /// Write the front of the outbound queue with a single `send()`.
    ///
    /// Returns the number of bytes written.
    pub fn on_writable(&mut self) -> usize {
        if self.state == HandlerState::Closed {
            return 0;
        }
        let Some(front) = self.outbound.front() else {
            return 0;
        };

        match self.stream.write(front) {
            Ok(n) => {
                self.outbound.advance(n);
                n
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => 0,
            Err(e) => {
                self.close(&format!("send failed: {}", e));
                0
            }
        }
    }

    /// Block until the outbound queue is empty or `timeout` expires.
    ///
    /// A handler that cannot flush in time is closed.
    pub fn flush(&mut self, timeout: Duration) -> Result<(), CommError> {
        let deadline = Instant::now() + timeout;

        while !self.outbound.is_empty() {
            if !self.is_connected() {
                return Err(CommError::ConnectionClosed);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.close("send timed out");
                return Err(CommError::SendTimeout(timeout));
            }

            let ready = poll::wait_writable(self.stream.as_raw_fd(), remaining)?;
            if ready.writable {
                self.on_writable();
            } else if ready.closed {
                self.close("socket error while sending");
            }
        }

        if self.is_connected() {
            Ok(())
        } else {
            Err(CommError::ConnectionClosed)
        }
    }

    /// Pop every decoded signal, handling protocol bookkeeping in place and
    /// moving everything else to `results`.
    ///
    /// Returns whether any signal was processed.
    pub fn process_signals(&mut self) -> bool {
        let mut processed = false;

        while let Some(signal) = self.todo.pop_front() {
            processed = true;
            debug!(
                handler = %self.id,
                signal = %self.registry.label(&signal),
                "Processing signal"
            );

            match signal.kind().and_then(builtin) {
                Some(handle) => handle(self, &signal),
                None => self.results.push_back(signal),
            }
        }

        processed
    }

    fn on_handshake(&mut self, signal: &Signal) {
        match signal.payload_str().trim().parse::<u32>() {
            Ok(pid) => self.peer_pid = Some(pid),
            Err(_) => warn!(
                handler = %self.id,
                payload = %signal.payload_str(),
                "Handshake without a valid process id"
            ),
        }

        if !self.handshake_sent {
            self.queue_handshake();
        }

        if self.state == HandlerState::Connected {
            self.state = HandlerState::Handshaked;
            info!(
                handler = %self.id,
                peer = %self.peer_addr,
                pid = ?self.peer_pid,
                "Handshake complete"
            );
        }
        self.last_alive = Some(Instant::now());
    }

    fn on_alive(&mut self, signal: &Signal) {
        self.last_alive = Some(Instant::now());
        if self.role == Role::Client && *signal == SignalKind::ServerAlive {
            self.queue_control(&Signal::empty(SignalKind::ClientAlive));
        }
    }

    fn on_idle(&mut self, signal: &Signal) {
        let payload = signal.payload_str();
        self.idle = !matches!(payload.trim(), "0" | "false");
        debug!(handler = %self.id, idle = self.idle, "Peer idle state changed");
    }

    /// Send our process id. Called by the dialling side on connect.
    pub fn start_handshake(&mut self) {
        if !self.handshake_sent {
            self.queue_handshake();
        }
    }

    fn queue_handshake(&mut self) {
        let signal = Signal::text(SignalKind::Handshake, &self.own_pid.to_string());
        self.queue_control(&signal);
        self.handshake_sent = true;
    }

    /// Send the alive signal matching this handler's role
    pub fn send_alive(&mut self) {
        let kind = match self.role {
            Role::Server => SignalKind::ServerAlive,
            Role::Client => SignalKind::ClientAlive,
        };
        self.queue_control(&Signal::empty(kind));
    }

    /// Queue a signal for the next writable tick
    pub fn queue_signal(&mut self, signal: &Signal) -> Result<(), CommError> {
        if self.state == HandlerState::Closed {
            return Ok(());
        }
        trace!(handler = %self.id, signal = %self.registry.label(signal), "Queued");
        self.outbound.push_signal(signal)?;
        Ok(())
    }

    fn queue_control(&mut self, signal: &Signal) {
        if let Err(e) = self.queue_signal(signal) {
            warn!(handler = %self.id, error = %e, "Control signal not queued");
        }
    }

    /// Queue and flush a signal
    pub fn send_signal(&mut self, signal: &Signal, timeout: Duration) -> Result<(), CommError> {
        if !self.is_connected() {
            return Err(CommError::ConnectionClosed);
        }
        self.queue_signal(signal)?;
        self.flush(timeout)
    }

    /// Close the socket and drop unsent frames
    pub fn close(&mut self, reason: &str) {
        if self.state == HandlerState::Closed {
            return;
        }
        info!(handler = %self.id, peer = %self.peer_addr, reason, "Connection closed");
        self.state = HandlerState::Closed;
        self.close_reason = Some(reason.to_string());
        self.outbound.clear();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn pop_result(&mut self) -> Option<Signal> {
        self.results.pop_front()
    }

    pub fn take_results(&mut self) -> Vec<Signal> {
        self.results.drain(..).collect()
    }

    pub fn pending_results(&self) -> usize {
        self.results.len()
    }

    pub fn pending_todos(&self) -> usize {
        self.todo.len()
    }

    #[inline]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state != HandlerState::Closed
    }

    #[inline]
    pub fn is_handshaked(&self) -> bool {
        self.state == HandlerState::Handshaked
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn set_idle(&mut self, idle: bool) {
        self.idle = idle;
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_pid(&self) -> Option<u32> {
        self.peer_pid
    }

    /// `(ip, pid)` once the handshake has delivered the peer's pid
    pub fn identity(&self) -> Option<PeerIdentity> {
        self.peer_pid.map(|pid| PeerIdentity {
            ip: self.peer_addr.ip(),
            pid,
        })
    }

    pub fn last_alive(&self) -> Option<Instant> {
        self.last_alive
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Whether frames are waiting to be written
    #[inline]
    pub fn wants_write(&self) -> bool {
        self.is_connected() && !self.outbound.is_empty()
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn info(&self) -> HandlerInfo {
        HandlerInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            peer_pid: self.peer_pid,
            state: self.state,
            idle: self.idle,
            last_alive: self.last_alive,
        }
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("peer_pid", &self.peer_pid)
            .field("idle", &self.idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_ipc::{encode, FrameError, MAX_PAYLOAD_LEN};
    use std::net::TcpListener;

    fn registry() -> Arc<SignalRegistry> {
        Arc::new(SignalRegistry::with_protocol())
    }

    /// Server-side handler plus the raw peer socket
    fn pair() -> (ConnectionHandler, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let handler =
            ConnectionHandler::new(HandlerId(1), Role::Server, accepted, 4242, registry()).unwrap();
        (handler, peer)
    }

    fn read_until_decoded(handler: &mut ConnectionHandler, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut decoded = 0;
        while decoded < expected && Instant::now() < deadline {
            decoded += handler.on_readable();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(decoded, expected);
    }

    fn read_frame(peer: &mut TcpStream) -> Signal {
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];
        loop {
            if let Some(signal) = decoder.next_signal().unwrap() {
                return signal;
            }
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0, "peer closed");
            decoder.extend(&buf[..n]);
        }
    }

    #[test]
    fn test_handshake_reply_and_state() {
        let (mut handler, mut peer) = pair();
        peer.write_all(&encode(&Signal::text(SignalKind::Handshake, "1234")).unwrap())
            .unwrap();

        read_until_decoded(&mut handler, 1);
        assert!(handler.process_signals());
        assert!(handler.is_handshaked());
        assert_eq!(handler.peer_pid(), Some(1234));
        assert!(handler.last_alive().is_some());
        assert_eq!(handler.pending_results(), 0);

        handler.flush(Duration::from_secs(2)).unwrap();
        let reply = read_frame(&mut peer);
        assert_eq!(reply, SignalKind::Handshake);
        assert_eq!(reply.payload_str(), "4242");
    }

    #[test]
    fn test_idle_and_results() {
        let (mut handler, mut peer) = pair();
        let mut wire = encode(&Signal::empty(SignalKind::Idle)).unwrap();
        wire.extend(encode(&Signal::text(SignalKind::Result, "{}")).unwrap());
        peer.write_all(&wire).unwrap();

        read_until_decoded(&mut handler, 2);
        handler.process_signals();
        assert!(handler.is_idle());
        assert_eq!(handler.pop_result().unwrap(), SignalKind::Result);

        peer.write_all(&encode(&Signal::text(SignalKind::Idle, "0")).unwrap())
            .unwrap();
        read_until_decoded(&mut handler, 1);
        handler.process_signals();
        assert!(!handler.is_idle());
    }

    #[test]
    fn test_oversized_signal_is_refused() {
        let (mut handler, _peer) = pair();
        let signal = Signal::new(1, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            handler.send_signal(&signal, Duration::from_millis(50)),
            Err(CommError::Frame(FrameError::PayloadTooLarge(_)))
        ));
        assert!(handler.is_connected());
        assert!(!handler.wants_write());
    }

    #[test]
    fn test_process_signals_reports_nothing_when_empty() {
        let (mut handler, _peer) = pair();
        assert!(!handler.process_signals());
    }

    #[test]
    fn test_peer_close_keeps_decoded_frames() {
        let (mut handler, mut peer) = pair();
        peer.write_all(&encode(&Signal::empty(SignalKind::Exit)).unwrap())
            .unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(2);
        while handler.is_connected() && Instant::now() < deadline {
            handler.on_readable();
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(!handler.is_connected());
        assert_eq!(handler.close_reason(), Some("peer closed connection"));
        handler.process_signals();
        assert_eq!(handler.pop_result().unwrap(), SignalKind::Exit);
    }

    #[test]
    fn test_closed_handler_rejects_sends() {
        let (mut handler, _peer) = pair();
        handler.close("test");
        assert!(matches!(
            handler.send_signal(&Signal::empty(SignalKind::Exit), Duration::from_millis(10)),
            Err(CommError::ConnectionClosed)
        ));
        assert!(!handler.wants_write());
    }

    #[test]
    fn test_identity_requires_handshake() {
        let (handler, _peer) = pair();
        assert!(handler.identity().is_none());
    }
}
