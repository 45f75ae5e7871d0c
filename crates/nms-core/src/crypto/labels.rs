//! Canonical context labels for NMS.
//!
//! Every AEAD operation binds these AAD bytes, and every HKDF expansion uses
//! one of the info labels below, so values derived for one purpose can never
//! be replayed as another.

pub const PROTOCOL_ID: &[u8] = b"NMSP";
pub const PROTOCOL_VERSION: u16 = 0x0001; // changing breaks compatibility
pub const CIPHERSUITE: &[u8] = b"CHACHA20-POLY1305";

// Packet role labels
pub const AAD_LABEL_MESSAGE: &[u8] = b"MESSAGE";

// HKDF info labels for the handshake
pub const LABEL_CHALLENGE: &[u8] = b"nms/v1/challenge";
pub const LABEL_RESPONSE: &[u8] = b"nms/v1/response";
pub const LABEL_CONTROL: &[u8] = b"nms/v1/control";
pub const LABEL_SESSION: &[u8] = b"nms/v1/session";

/// Context string for the default frame-signature key.
pub const LABEL_NETWORK_KEY: &str = "nms v1 frame signature network key";

/// Build canonical AAD =
/// `[ PROTOCOL_ID (4B) | VERSION_LE (2B) | CIPHERSUITE (18B padded) | LABEL (12B padded) ]`
#[must_use]
pub fn aad_for(label: &[u8]) -> [u8; 4 + 2 + 18 + 12] {
    let mut out = [0u8; 4 + 2 + 18 + 12];

    out[0..4].copy_from_slice(PROTOCOL_ID);
    out[4..6].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());

    let mut off = 6;
    let cs_len = CIPHERSUITE.len().min(18);
    out[off..off + cs_len].copy_from_slice(&CIPHERSUITE[..cs_len]);
    off += 18;

    let l = label.len().min(12);
    out[off..off + l].copy_from_slice(&label[..l]);

    out
}
