//! # Skein Crypto
//!
//! Identity and signing primitives for skein visors.
//!
//! Every visor is identified by an Ed25519 public key. The secret key is
//! used exactly once per transport to sign the settlement handshake; all
//! payload privacy is delegated to the underlay.

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod keys;

pub use error::CryptoError;
pub use keys::{Keypair, PublicKey, SecretKey, Signature, verify};

/// Public key size in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;
