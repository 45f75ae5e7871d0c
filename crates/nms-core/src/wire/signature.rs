//! Frame signature shared by the Netflow and NetTask codecs.
//!
//! Layout at the start of every frame:
//! [ 0     ] = magic byte
//! [ 1..17 ] = signature (keyed BLAKE3 over `magic || body`, truncated)
//! [ 17..  ] = body
//!
//! The key is a network-wide secret both peers are configured with, so the
//! signature authenticates "speaks NMS with our key" and, more importantly,
//! lets the demultiplexer tell a real frame start from a stray magic byte.

use subtle::ConstantTimeEq;

use crate::crypto::labels::LABEL_NETWORK_KEY;
use crate::error::{ProtocolError, Result};

pub const SIGNATURE_LEN: usize = 16;
/// Magic byte plus signature.
pub const HEADER_LEN: usize = 1 + SIGNATURE_LEN;

#[derive(Clone)]
pub struct FrameSigner {
    key: [u8; 32],
}

impl core::fmt::Debug for FrameSigner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameSigner").finish_non_exhaustive()
    }
}

impl Default for FrameSigner {
    fn default() -> Self {
        Self::new(blake3::derive_key(LABEL_NETWORK_KEY, b"default"))
    }
}

impl FrameSigner {
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build a signer from a 64-char hex key.
    ///
    /// # Errors
    /// `MalformedFrame` if the string is not 32 bytes of hex.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|_| ProtocolError::MalformedFrame("network key is not hex"))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::MalformedFrame("network key must be 32 bytes"))?;
        Ok(Self::new(key))
    }

    #[must_use]
    pub fn compute(&self, magic: u8, body: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(&[magic]);
        hasher.update(body);
        let hash = hasher.finalize();
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&hash.as_bytes()[..SIGNATURE_LEN]);
        out
    }

    /// Assemble `magic || signature || body`.
    #[must_use]
    pub fn seal_frame(&self, magic: u8, body: &[u8]) -> Vec<u8> {
        let sig = self.compute(magic, body);
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(magic);
        out.extend_from_slice(&sig);
        out.extend_from_slice(body);
        out
    }

    /// Check a complete frame (`magic || signature || body`).
    #[must_use]
    pub fn verify_frame(&self, frame: &[u8]) -> bool {
        if frame.len() < HEADER_LEN {
            return false;
        }
        let expected = self.compute(frame[0], &frame[HEADER_LEN..]);
        expected.ct_eq(&frame[1..HEADER_LEN]).unwrap_u8() == 1
    }
}
