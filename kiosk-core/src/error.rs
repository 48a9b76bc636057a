//! Communication errors

use kiosk_ipc::FrameError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("No connected peers")]
    NoPeers,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send did not complete within {0:?}")]
    SendTimeout(Duration),

    #[error("Handshake timeout: {handshaked} of {expected} peers ready after {waited:?}")]
    HandshakeTimeout {
        expected: usize,
        handshaked: usize,
        waited: Duration,
    },
}
