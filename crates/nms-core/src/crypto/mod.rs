// Cryptographic primitives for the NMS protocol
// This module exposes authenticated encryption, context labels, and the ephemeral key exchange

// AEAD encryption and decryption of session messages
pub mod aead;

// Ephemeral X25519 agreement with challenge-response confirmation
pub mod kex;

// Protocol-specific labels for AAD and key derivation
pub mod labels;

pub use kex::{ChallengeControl, Curve, KeyExchange, VerifiedChallenge};
