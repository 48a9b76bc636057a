//! Communication Client
//!
//! One outbound connection to a signal server, driven the same way as the
//! server: bounded `poll(2)` ticks on the caller's thread.

use crate::error::CommError;
use crate::handler::{ConnectionHandler, HandlerId, Role};
use crate::poll::{self, Interest};
use kiosk_ipc::{Signal, SignalKind, SignalRegistry};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Client tuning
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct CommunicationClient {
    server_addr: SocketAddr,
    handler: ConnectionHandler,
    config: ClientConfig,
    registry: Arc<SignalRegistry>,
    own_pid: u32,
    connections: u64,
}

impl CommunicationClient {
    /// Connect to `addr` and send our handshake
    pub fn connect(
        addr: SocketAddr,
        config: ClientConfig,
        registry: Arc<SignalRegistry>,
    ) -> Result<Self, CommError> {
        Self::connect_with_pid(addr, config, registry, std::process::id())
    }

    /// Connect announcing `pid` instead of our own process id.
    ///
    /// Used when one process speaks for another, e.g. a launcher
    /// registering the instance it started.
    pub fn connect_with_pid(
        addr: SocketAddr,
        config: ClientConfig,
        registry: Arc<SignalRegistry>,
        pid: u32,
    ) -> Result<Self, CommError> {
        let handler = Self::dial(addr, &config, &registry, pid, 1)?;
        Ok(Self {
            server_addr: addr,
            handler,
            config,
            registry,
            own_pid: pid,
            connections: 1,
        })
    }

    fn dial(
        addr: SocketAddr,
        config: &ClientConfig,
        registry: &Arc<SignalRegistry>,
        pid: u32,
        id: u64,
    ) -> Result<ConnectionHandler, CommError> {
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|source| CommError::Connect { addr, source })?;
        let mut handler = ConnectionHandler::new(
            HandlerId(id),
            Role::Client,
            stream,
            pid,
            Arc::clone(registry),
        )?;
        handler.start_handshake();
        handler.flush(config.send_timeout)?;
        info!(server = %addr, "Connected to signal server");
        Ok(handler)
    }

    /// Drop the current connection and dial the server again
    pub fn reconnect(&mut self) -> Result<(), CommError> {
        self.handler.close("reconnecting");
        self.connections += 1;
        self.handler = Self::dial(
            self.server_addr,
            &self.config,
            &self.registry,
            self.own_pid,
            self.connections,
        )?;
        Ok(())
    }

    /// Run one tick: wait up to `timeout`, move bytes, process signals.
    ///
    /// Returns whether any signal was processed. Signals that arrived just
    /// before the server closed are still processed. Once closed with
    /// nothing left to process, the tick still takes `timeout`.
    pub fn process_signals(&mut self, timeout: Duration) -> bool {
        if !self.handler.is_connected() {
            let processed = self.handler.process_signals();
            if !processed {
                std::thread::sleep(timeout);
            }
            return processed;
        }

        let interest = Interest {
            fd: self.handler.raw_fd(),
            read: true,
            write: self.handler.wants_write(),
        };
        match poll::wait_for_readiness(&[interest], timeout) {
            Ok(ready) => {
                if let Some(ready) = ready.first() {
                    if ready.readable || ready.closed {
                        self.handler.on_readable();
                    }
                    if ready.writable {
                        self.handler.on_writable();
                    }
                }
            }
            Err(e) => error!(error = %e, "poll failed"),
        }
        self.handler.process_signals()
    }

    /// Queue and flush a signal
    pub fn send_signal(&mut self, signal: &Signal) -> Result<(), CommError> {
        debug!(signal = %self.registry.label(signal), "Sending");
        self.handler.send_signal(signal, self.config.send_timeout)
    }

    /// Report our idle state to the server
    pub fn send_idle(&mut self, idle: bool) -> Result<(), CommError> {
        let payload = if idle { "1" } else { "0" };
        self.send_signal(&Signal::text(SignalKind::Idle, payload))
    }

    /// Poll until the server has answered the handshake
    pub fn wait_for_handshake(&mut self, timeout: Duration) -> Result<(), CommError> {
        let deadline = Instant::now() + timeout;
        while !self.handler.is_handshaked() {
            if !self.handler.is_connected() {
                return Err(CommError::ConnectionClosed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CommError::HandshakeTimeout {
                    expected: 1,
                    handshaked: 0,
                    waited: timeout,
                });
            }
            self.process_signals(remaining.min(self.config.poll_interval));
        }
        Ok(())
    }

    pub fn pop_result(&mut self) -> Option<Signal> {
        self.handler.pop_result()
    }

    pub fn take_results(&mut self) -> Vec<Signal> {
        self.handler.take_results()
    }

    pub fn is_connected(&self) -> bool {
        self.handler.is_connected()
    }

    pub fn is_handshaked(&self) -> bool {
        self.handler.is_handshaked()
    }

    pub fn own_pid(&self) -> u32 {
        self.own_pid
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn handler(&self) -> &ConnectionHandler {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    pub fn close(&mut self, reason: &str) {
        self.handler.close(reason);
    }
}
