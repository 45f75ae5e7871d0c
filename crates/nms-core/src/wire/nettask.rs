//! NetTask: the request/response task sub-protocol.
//!
//! Layout:
//! [ 0      ] = 0x4E ('N')
//! [ 1..17  ] = signature
//! [ 17..21 ] = agent id
//! [ 21..25 ] = sequence number
//! [ 25..29 ] = acknowledgement number
//! [ 29..33 ] = type
//! [ 33..37 ] = payload length
//! [ 37..   ] = payload
//!
//! All integers are `u32`, big-endian.

use core::fmt;

use crate::cursor::BinaryCursor;
use crate::error::{ProtocolError, Result};
use crate::wire::signature::{FrameSigner, HEADER_LEN};
use crate::wire::MAX_FRAME_SIZE;

pub const NETTASK_MAGIC: u8 = 0x4E;

/// Fixed fields after the signature.
const FIELDS_LEN: usize = 5 * 4;
const PAYLOAD_LEN_OFFSET: usize = HEADER_LEN + 4 * 4;

/// Largest payload that keeps the frame within [`MAX_FRAME_SIZE`].
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_SIZE - HEADER_LEN - FIELDS_LEN;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    RequestMetrics = 0,
    RequestRegister = 1,
    RequestTask = 2,
    ResponseMetrics = 3,
    ResponseRegister = 4,
    ResponseTask = 5,
}

impl TaskType {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TaskType::RequestMetrics),
            1 => Some(TaskType::RequestRegister),
            2 => Some(TaskType::RequestTask),
            3 => Some(TaskType::ResponseMetrics),
            4 => Some(TaskType::ResponseRegister),
            5 => Some(TaskType::ResponseTask),
            _ => None,
        }
    }

    pub const fn is_request(self) -> bool {
        matches!(
            self,
            TaskType::RequestMetrics | TaskType::RequestRegister | TaskType::RequestTask
        )
    }

    pub const fn is_response(self) -> bool {
        !self.is_request()
    }

    /// The response type answering this request type.
    pub const fn response(self) -> Option<TaskType> {
        match self {
            TaskType::RequestMetrics => Some(TaskType::ResponseMetrics),
            TaskType::RequestRegister => Some(TaskType::ResponseRegister),
            TaskType::RequestTask => Some(TaskType::ResponseTask),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::RequestMetrics => "REQUEST_METRICS",
            TaskType::RequestRegister => "REQUEST_REGISTER",
            TaskType::RequestTask => "REQUEST_TASK",
            TaskType::ResponseMetrics => "RESPONSE_METRICS",
            TaskType::ResponseRegister => "RESPONSE_REGISTER",
            TaskType::ResponseTask => "RESPONSE_TASK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetTaskFrame {
    pub agent_id: u32,
    pub sequence_number: u32,
    pub acknowledgement_number: u32,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
}

impl NetTaskFrame {
    pub fn new(agent_id: u32, sequence_number: u32, task_type: TaskType, payload: Vec<u8>) -> Self {
        Self {
            agent_id,
            sequence_number,
            acknowledgement_number: 0,
            task_type,
            payload,
        }
    }

    pub fn payload_length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Serialize and sign.
    #[must_use]
    pub fn encode(&self, signer: &FrameSigner) -> Vec<u8> {
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "nettask payload of {} bytes exceeds the frame limit",
            self.payload.len()
        );
        let mut body = Vec::with_capacity(FIELDS_LEN + self.payload.len());
        body.extend_from_slice(&self.agent_id.to_be_bytes());
        body.extend_from_slice(&self.sequence_number.to_be_bytes());
        body.extend_from_slice(&self.acknowledgement_number.to_be_bytes());
        body.extend_from_slice(&self.task_type.as_u32().to_be_bytes());
        body.extend_from_slice(&self.payload_length().to_be_bytes());
        body.extend_from_slice(&self.payload);
        signer.seal_frame(NETTASK_MAGIC, &body)
    }
}

/// Total length of the NetTask frame starting at the cursor. Does not
/// interpret the type code, so frames with unknown types can still be skipped.
///
/// # Errors
/// `MalformedFrame` for a wrong magic or oversized payload, `OutOfBounds` if
/// the buffer ends before the frame does.
pub fn frame_len(cursor: &BinaryCursor<'_>) -> Result<usize> {
    if cursor.peek() != Some(NETTASK_MAGIC) {
        return Err(ProtocolError::MalformedFrame("not a nettask frame"));
    }
    let len = cursor.peek_u32_be_at(PAYLOAD_LEN_OFFSET)? as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::MalformedFrame("nettask payload too large"));
    }
    let total = HEADER_LEN + FIELDS_LEN + len;
    cursor.peek_bytes(total)?;
    Ok(total)
}

/// Check the signature of the frame at the cursor. Never consumes.
#[must_use]
pub fn verify_signature(cursor: &BinaryCursor<'_>, signer: &FrameSigner) -> bool {
    frame_len(cursor)
        .and_then(|n| cursor.peek_bytes(n))
        .map(|frame| signer.verify_frame(frame))
        .unwrap_or(false)
}

/// Decode the frame at the cursor, consuming it on success.
///
/// # Errors
/// `MalformedFrame` for an unknown type code, plus everything [`frame_len`]
/// reports. The cursor does not move on failure.
pub fn decode(cursor: &mut BinaryCursor<'_>) -> Result<NetTaskFrame> {
    frame_len(cursor)?;

    let mut c = cursor.clone();
    c.advance(HEADER_LEN)?;
    let agent_id = c.read_u32_be()?;
    let sequence_number = c.read_u32_be()?;
    let acknowledgement_number = c.read_u32_be()?;
    let task_type = TaskType::from_u32(c.read_u32_be()?)
        .ok_or(ProtocolError::MalformedFrame("unknown nettask type"))?;
    let len = c.read_u32_be()? as usize;
    let payload = c.read_bytes(len)?.to_vec();

    *cursor = c;
    Ok(NetTaskFrame {
        agent_id,
        sequence_number,
        acknowledgement_number,
        task_type,
        payload,
    })
}
