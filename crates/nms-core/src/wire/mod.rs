//! Wire formats shared by agent and server.

pub mod demux;
pub mod netflow;
pub mod nettask;
pub mod signature;

pub use demux::{demux, Demux, DemuxStats, Frame};
pub use netflow::{NetflowFrame, NetflowType, MAX_MESSAGE_LEN, NETFLOW_MAGIC};
pub use nettask::{NetTaskFrame, TaskType, MAX_PAYLOAD_LEN, NETTASK_MAGIC};
pub use signature::{FrameSigner, HEADER_LEN, SIGNATURE_LEN};

// Useful sizes & limits
pub const MAX_FRAME_SIZE: usize = 65507; // largest UDP payload over IPv4
pub const DEFAULT_PORT: u16 = 2022;
/// UDP runs one port above the TCP port.
pub const UDP_PORT_OFFSET: u16 = 1;
