//! Netflow: the handshake / key-exchange sub-protocol.
//!
//! Layout:
//! [ 0      ] = 0x43 ('C')
//! [ 1..17  ] = signature
//! [ 17..21 ] = type (`u32`, big-endian)
//! [ 21..   ] = payload
//!
//! Payload per type:
//!   HELLO_THERE    = public key (32)
//!   GENERAL_KENOBI = public key (32) | salt (32) | challenge (32)
//!   THE_NEGOTIATOR = challenge (32)
//!   MESSAGE        = length (`u32`, big-endian) | ciphertext
//!   KYS            = (empty)

use core::fmt;

use crate::crypto::kex::{CHALLENGE_LEN, PUBLIC_KEY_LEN, SALT_LEN};
use crate::cursor::BinaryCursor;
use crate::error::{ProtocolError, Result};
use crate::wire::signature::{FrameSigner, HEADER_LEN};
use crate::wire::MAX_FRAME_SIZE;

pub const NETFLOW_MAGIC: u8 = 0x43;

const TYPE_LEN: usize = 4;
const LEN_PREFIX: usize = 4;

/// Largest MESSAGE ciphertext that keeps the frame within [`MAX_FRAME_SIZE`].
pub const MAX_MESSAGE_LEN: usize = MAX_FRAME_SIZE - HEADER_LEN - TYPE_LEN - LEN_PREFIX;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetflowType {
    HelloThere = 0,
    GeneralKenobi = 1,
    TheNegotiator = 2,
    Message = 3,
    Kys = 4,
}

impl NetflowType {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(NetflowType::HelloThere),
            1 => Some(NetflowType::GeneralKenobi),
            2 => Some(NetflowType::TheNegotiator),
            3 => Some(NetflowType::Message),
            4 => Some(NetflowType::Kys),
            _ => None,
        }
    }

    /// Fixed payload size, `None` for the length-prefixed MESSAGE.
    const fn fixed_payload_len(self) -> Option<usize> {
        match self {
            NetflowType::HelloThere => Some(PUBLIC_KEY_LEN),
            NetflowType::GeneralKenobi => Some(PUBLIC_KEY_LEN + SALT_LEN + CHALLENGE_LEN),
            NetflowType::TheNegotiator => Some(CHALLENGE_LEN),
            NetflowType::Message => None,
            NetflowType::Kys => Some(0),
        }
    }
}

impl fmt::Display for NetflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetflowType::HelloThere => "HELLO_THERE",
            NetflowType::GeneralKenobi => "GENERAL_KENOBI",
            NetflowType::TheNegotiator => "THE_NEGOTIATOR",
            NetflowType::Message => "MESSAGE",
            NetflowType::Kys => "KYS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetflowFrame {
    HelloThere {
        public_key: [u8; PUBLIC_KEY_LEN],
    },
    GeneralKenobi {
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: [u8; SALT_LEN],
        challenge: [u8; CHALLENGE_LEN],
    },
    TheNegotiator {
        challenge: [u8; CHALLENGE_LEN],
    },
    Message {
        ciphertext: Vec<u8>,
    },
    Kys,
}

impl NetflowFrame {
    pub fn kind(&self) -> NetflowType {
        match self {
            NetflowFrame::HelloThere { .. } => NetflowType::HelloThere,
            NetflowFrame::GeneralKenobi { .. } => NetflowType::GeneralKenobi,
            NetflowFrame::TheNegotiator { .. } => NetflowType::TheNegotiator,
            NetflowFrame::Message { .. } => NetflowType::Message,
            NetflowFrame::Kys => NetflowType::Kys,
        }
    }

    /// Serialize and sign.
    #[must_use]
    pub fn encode(&self, signer: &FrameSigner) -> Vec<u8> {
        let mut body = Vec::with_capacity(TYPE_LEN + 96);
        body.extend_from_slice(&self.kind().as_u32().to_be_bytes());
        match self {
            NetflowFrame::HelloThere { public_key } => body.extend_from_slice(public_key),
            NetflowFrame::GeneralKenobi {
                public_key,
                salt,
                challenge,
            } => {
                body.extend_from_slice(public_key);
                body.extend_from_slice(salt);
                body.extend_from_slice(challenge);
            }
            NetflowFrame::TheNegotiator { challenge } => body.extend_from_slice(challenge),
            NetflowFrame::Message { ciphertext } => {
                debug_assert!(
                    ciphertext.len() <= MAX_MESSAGE_LEN,
                    "netflow message of {} bytes exceeds the frame limit",
                    ciphertext.len()
                );
                body.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
                body.extend_from_slice(ciphertext);
            }
            NetflowFrame::Kys => {}
        }
        signer.seal_frame(NETFLOW_MAGIC, &body)
    }
}

/// Total length of the Netflow frame starting at the cursor, computed from
/// the type code (and MESSAGE length prefix) without consuming anything.
///
/// # Errors
/// `MalformedFrame` for a wrong magic, unknown type or oversized message;
/// `OutOfBounds` if the buffer ends before the frame does.
pub fn frame_len(cursor: &BinaryCursor<'_>) -> Result<usize> {
    if cursor.peek() != Some(NETFLOW_MAGIC) {
        return Err(ProtocolError::MalformedFrame("not a netflow frame"));
    }
    let code = cursor.peek_u32_be_at(HEADER_LEN)?;
    let kind =
        NetflowType::from_u32(code).ok_or(ProtocolError::MalformedFrame("unknown netflow type"))?;

    let payload = match kind.fixed_payload_len() {
        Some(n) => n,
        None => {
            let len = cursor.peek_u32_be_at(HEADER_LEN + TYPE_LEN)? as usize;
            if len > MAX_MESSAGE_LEN {
                return Err(ProtocolError::MalformedFrame("netflow message too large"));
            }
            LEN_PREFIX + len
        }
    };

    let total = HEADER_LEN + TYPE_LEN + payload;
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

/// Decode the frame at the cursor, consuming it on success. On failure the
/// cursor is left where it was.
///
/// # Errors
/// See [`frame_len`].
pub fn decode(cursor: &mut BinaryCursor<'_>) -> Result<NetflowFrame> {
    frame_len(cursor)?;

    let mut c = cursor.clone();
    c.advance(HEADER_LEN)?;
    let code = c.read_u32_be()?;
    let frame = match NetflowType::from_u32(code) {
        Some(NetflowType::HelloThere) => NetflowFrame::HelloThere {
            public_key: c.read_array()?,
        },
        Some(NetflowType::GeneralKenobi) => NetflowFrame::GeneralKenobi {
            public_key: c.read_array()?,
            salt: c.read_array()?,
            challenge: c.read_array()?,
        },
        Some(NetflowType::TheNegotiator) => NetflowFrame::TheNegotiator {
            challenge: c.read_array()?,
        },
        Some(NetflowType::Message) => {
            let len = c.read_u32_be()? as usize;
            NetflowFrame::Message {
                ciphertext: c.read_bytes(len)?.to_vec(),
            }
        }
        Some(NetflowType::Kys) => NetflowFrame::Kys,
        None => return Err(ProtocolError::MalformedFrame("unknown netflow type")),
    };

    *cursor = c;
    Ok(frame)
}
