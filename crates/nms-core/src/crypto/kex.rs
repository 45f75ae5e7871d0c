//! Ephemeral key exchange with challenge-response proof of possession.
//!
//! X25519 (ephemeral) -> HKDF-SHA256 -> ChaCha20-Poly1305
//!
//! Flow between client C and server S:
//!   C -> S : C.pk
//!   S      : link(C.pk) -> salt, issue_challenge()
//!   S -> C : S.pk, salt, challenge
//!   C      : link(S.pk, salt), verify_challenge(challenge) -> (counter, control)
//!   C -> S : counter
//!   S      : confirm_challenge(counter, issued), regenerate_keys(control)
//!
//! Both sides end with `session_key = HKDF(shared, salt = control, "session")`.
//! Secrets are held in `Zeroizing` buffers and wiped on drop.

use core::fmt;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::aead;
use crate::crypto::labels::{LABEL_CHALLENGE, LABEL_CONTROL, LABEL_RESPONSE, LABEL_SESSION};
use crate::error::{ProtocolError, Result};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const CHALLENGE_LEN: usize = 32;

/// Key-agreement curve. Both peers must use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Curve {
    #[default]
    X25519,
}

impl Curve {
    pub const fn name(self) -> &'static str {
        match self {
            Curve::X25519 => "x25519",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "x25519" | "curve25519" => Some(Curve::X25519),
            _ => None,
        }
    }
}

/// Values the server keeps after issuing a challenge.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChallengeControl {
    /// Sent to the client inside GENERAL_KENOBI.
    pub challenge: [u8; CHALLENGE_LEN],
    /// What the client must send back in THE_NEGOTIATOR.
    pub expected_response: [u8; CHALLENGE_LEN],
    /// Mixed into the final session key.
    pub control: [u8; CHALLENGE_LEN],
}

impl fmt::Debug for ChallengeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeControl")
            .field("challenge", &hex::encode(&self.challenge[..4]))
            .finish_non_exhaustive()
    }
}

/// Result of a successful `verify_challenge` on the client.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct VerifiedChallenge {
    /// Counter-challenge to return in THE_NEGOTIATOR.
    pub challenge: [u8; CHALLENGE_LEN],
    pub control: [u8; CHALLENGE_LEN],
}

/// Per-connection key exchange state.
pub struct KeyExchange {
    curve: Curve,
    secret: Option<EphemeralSecret>,
    public: PublicKey,
    peer_public: Option<PublicKey>,
    salt: Option<[u8; SALT_LEN]>,
    shared: Option<Zeroizing<[u8; 32]>>,
    session_key: Option<Zeroizing<[u8; 32]>>,
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("curve", &self.curve)
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("linked", &self.shared.is_some())
            .field("session_key", &self.session_key.is_some())
            .finish()
    }
}

impl KeyExchange {
    /// Generate a fresh ephemeral key pair on `curve`.
    pub fn new(curve: Curve) -> Self {
        let secret = match curve {
            Curve::X25519 => EphemeralSecret::random_from_rng(OsRng),
        };
        let public = PublicKey::from(&secret);
        Self {
            curve,
            secret: Some(secret),
            public,
            peer_public: None,
            salt: None,
            shared: None,
            session_key: None,
        }
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn peer_public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.peer_public.map(|p| p.to_bytes())
    }

    pub fn salt(&self) -> Option<[u8; SALT_LEN]> {
        self.salt
    }

    pub fn is_linked(&self) -> bool {
        self.shared.is_some()
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key.is_some()
    }

    /// Compute the shared secret against `peer_public_key`.
    ///
    /// The side that receives no salt (the server answering HELLO_THERE)
    /// generates one; the side that does (the client reading GENERAL_KENOBI)
    /// adopts it. Either way the salt in use is returned.
    ///
    /// # Errors
    /// `AlreadyLinked` on a second call, `AuthenticationFailure` when the
    /// peer key is a low-order point that yields a non-contributory secret.
    pub fn link(
        &mut self,
        peer_public_key: &[u8; PUBLIC_KEY_LEN],
        salt: Option<[u8; SALT_LEN]>,
    ) -> Result<[u8; SALT_LEN]> {
        let secret = self.secret.take().ok_or(ProtocolError::AlreadyLinked)?;
        let peer = PublicKey::from(*peer_public_key);

        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(ProtocolError::AuthenticationFailure);
        }

        let salt = salt.unwrap_or_else(|| {
            let mut s = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut s);
            s
        });

        self.peer_public = Some(peer);
        self.salt = Some(salt);
        self.shared = Some(Zeroizing::new(shared.to_bytes()));
        Ok(salt)
    }

    fn expand(&self, salt: &[u8], label: &[u8], extra: &[u8]) -> Result<[u8; 32]> {
        let shared = self.shared.as_ref().ok_or(ProtocolError::NotLinked)?;
        let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_slice());
        let mut okm = [0u8; 32];
        hk.expand_multi_info(&[label, extra], &mut okm)
            .map_err(|_| ProtocolError::MalformedFrame("hkdf output length"))?;
        Ok(okm)
    }

    fn derive_challenge(&self) -> Result<ChallengeControl> {
        let salt = self.salt.ok_or(ProtocolError::NotLinked)?;
        let challenge = self.expand(&salt, LABEL_CHALLENGE, &[])?;
        let expected_response = self.expand(&salt, LABEL_RESPONSE, &challenge)?;
        let control = self.expand(&salt, LABEL_CONTROL, &challenge)?;
        Ok(ChallengeControl {
            challenge,
            expected_response,
            control,
        })
    }

    /// Derive the challenge the server sends in GENERAL_KENOBI, together with
    /// the response it expects back and the control value.
    ///
    /// # Errors
    /// `NotLinked` before `link`.
    pub fn issue_challenge(&self) -> Result<ChallengeControl> {
        self.derive_challenge()
    }

    /// Check a challenge received from the server and produce the
    /// counter-challenge plus control value.
    ///
    /// # Errors
    /// `AuthenticationFailure` when the challenge does not match what this
    /// side derives from its own shared secret.
    pub fn verify_challenge(&self, received: &[u8; CHALLENGE_LEN]) -> Result<VerifiedChallenge> {
        let expected = self.derive_challenge()?;
        if expected.challenge.ct_eq(received).unwrap_u8() == 0 {
            return Err(ProtocolError::AuthenticationFailure);
        }
        Ok(VerifiedChallenge {
            challenge: expected.expected_response,
            control: expected.control,
        })
    }

    /// Verify a counter-challenge against the one issued earlier.
    #[must_use]
    pub fn confirm_challenge(
        &self,
        received: &[u8; CHALLENGE_LEN],
        issued: &ChallengeControl,
    ) -> bool {
        self.shared.is_some() && issued.expected_response.ct_eq(received).unwrap_u8() == 1
    }

    /// Derive the final session key by mixing the shared secret with `control`.
    ///
    /// # Errors
    /// `NotLinked` before `link`.
    pub fn regenerate_keys(&mut self, control: &[u8; CHALLENGE_LEN]) -> Result<()> {
        let key = self.expand(control, LABEL_SESSION, &[])?;
        self.session_key = Some(Zeroizing::new(key));
        Ok(())
    }

    /// # Errors
    /// `NoSessionKey` before `regenerate_keys`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.session_key.as_ref().ok_or(ProtocolError::NoSessionKey)?;
        aead::seal(key, plaintext)
    }

    /// # Errors
    /// `NoSessionKey` before `regenerate_keys`, `AuthenticationFailure` when
    /// the ciphertext was tampered with or sealed under another key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self.session_key.as_ref().ok_or(ProtocolError::NoSessionKey)?;
        aead::open(key, ciphertext)
    }
}
