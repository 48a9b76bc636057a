//! Kiosk IPC Protocol
//!
//! Signal wire protocol shared by the server, its evaluation workers and the
//! robot-cell secondaries: signal values, the length-prefixed frame codec,
//! the outbound send queue and the request/response correlation queue.

mod framing;
mod outbound;
mod signal;
mod todos;

pub use framing::{decode, encode, encode_into, frame_size, pad4, FrameDecoder, FrameError};
pub use outbound::OutboundQueue;
pub use signal::{KeyRange, Signal, SignalKind, SignalRegistry};
pub use todos::{CorrelationFallback, RemoteTodos, TodoEntry};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame header: i32 key + u32 payload length
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload a peer may declare (16 MiB)
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Default TCP port of the signal server
pub const DEFAULT_PORT: u16 = 8040;
