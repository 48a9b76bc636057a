//! Kiosk Core
//!
//! Non-blocking signal transport for measurement instances: per-peer
//! connection handlers, the multiplexing server and client, and the
//! identity-tracking MultiEval server.

mod client;
mod error;
mod handler;
mod multi_eval;
pub mod poll;
mod server;

pub use client::{ClientConfig, CommunicationClient};
pub use error::CommError;
pub use handler::{ConnectionHandler, HandlerId, HandlerInfo, HandlerState, PeerIdentity, Role};
pub use multi_eval::{MultiEvalConfig, MultiEvalServer, PeerRecord};
pub use server::{pick_dispatch_target, CommunicationServer, Inbound, LostPeer, ServerConfig};
