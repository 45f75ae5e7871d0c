// NMS network layer
// Handshake and task state machines, peer session bookkeeping, UDP/TCP endpoints

use std::net::SocketAddr;

// Agent endpoint: handshake client + task requester
pub mod agent;

// TOML configuration
pub mod config;

// Netflow handshake state machines
pub mod handshake;

// Server endpoint: per-peer handshakes + task responder
pub mod server;

// Per-peer state with idle expiry
pub mod session_table;

// Remote address helpers
pub mod target;

// NetTask request/response correlation
pub mod task;

// TCP greeting side channel
pub mod tcp;

// Outbound send capability
pub mod transport;

// tokio UDP endpoint
pub mod udp;

pub use agent::{Agent, AgentError};
pub use config::{ConfigError, NetConfig};
pub use handshake::{CloseReason, HandshakeEvent, HandshakeState, AUTH_ACK};
pub use server::Server;
pub use target::ConnectionTarget;
pub use transport::{ChannelTransport, MemoryTransport, Transport};
pub use udp::{DatagramHandler, UdpEndpoint};

/// Where endpoints report handshake events, tagged with the peer.
pub type EventSink = tokio::sync::mpsc::UnboundedSender<(SocketAddr, HandshakeEvent)>;
