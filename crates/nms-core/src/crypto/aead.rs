use crate::crypto::labels::{aad_for, AAD_LABEL_MESSAGE};
use crate::error::{ProtocolError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// Output layout: `nonce (12B) || ciphertext || tag (16B)`.
///
/// # Errors
/// Returns `AuthenticationFailure` if the cipher refuses the input.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key_ga: Key = (*key).into();
    let aead = ChaCha20Poly1305::new(&key_ga);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce: Nonce = nonce_bytes.into();

    let aad = aad_for(AAD_LABEL_MESSAGE);
    let ct = aead
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| ProtocolError::AuthenticationFailure)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a buffer produced by [`seal`].
///
/// # Errors
/// Returns `AuthenticationFailure` on truncation, tampering or a wrong key.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(ProtocolError::AuthenticationFailure);
    }
    let (nonce_bytes, ct) = sealed.split_at(NONCE_LEN);

    let key_ga: Key = (*key).into();
    let aead = ChaCha20Poly1305::new(&key_ga);
    let aad = aad_for(AAD_LABEL_MESSAGE);

    aead.decrypt(
        Nonce::from_slice(nonce_bytes),
        Payload { msg: ct, aad: &aad },
    )
    .map_err(|_| ProtocolError::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"Authenticated!").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 14 + TAG_LEN);
        assert_eq!(open(&key, &sealed).unwrap(), b"Authenticated!");
    }

    #[test]
    fn tamper_and_wrong_key_fail() {
        let key = [7u8; 32];
        let mut sealed = seal(&key, b"payload").unwrap();
        assert!(open(&[8u8; 32], &sealed).is_err());

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            open(&key, &sealed).unwrap_err(),
            ProtocolError::AuthenticationFailure
        );
        assert!(open(&key, &sealed[..NONCE_LEN + 3]).is_err());
    }

    #[test]
    fn nonces_differ_per_seal() {
        let key = [1u8; 32];
        let a = seal(&key, b"x").unwrap();
        let b = seal(&key, b"x").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}
