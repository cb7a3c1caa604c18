//! Endpoint addressing: ports, addresses and route descriptors.

use serde::{Deserialize, Serialize};
use skein_crypto::PublicKey;
use std::fmt;

/// An application-level port on a visor.
pub type Port = u16;

/// A network address in the overlay: a visor key plus a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    /// Visor public key
    pub pk: PublicKey,
    /// Application port
    pub port: Port,
}

impl Addr {
    /// Construct an address.
    #[must_use]
    pub const fn new(pk: PublicKey, port: Port) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

/// Size of an encoded route descriptor in a rule body.
pub const DESCRIPTOR_SIZE: usize = 32 + 32 + 2 + 2;

/// The four-tuple identifying an endpoint-to-endpoint circuit.
///
/// Equality over all four fields defines a route group. Both endpoints key
/// their group by the dialing side's view of the descriptor; each side
/// derives its local and remote address by matching its own public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Dialing visor
    pub src_pk: PublicKey,
    /// Responding visor
    pub dst_pk: PublicKey,
    /// Dialing visor's port
    pub src_port: Port,
    /// Responding visor's port
    pub dst_port: Port,
}

impl RouteDescriptor {
    /// Construct a descriptor.
    #[must_use]
    pub const fn new(src_pk: PublicKey, dst_pk: PublicKey, src_port: Port, dst_port: Port) -> Self {
        Self {
            src_pk,
            dst_pk,
            src_port,
            dst_port,
        }
    }

    /// The descriptor with source and destination swapped.
    #[must_use]
    pub const fn flipped(&self) -> Self {
        Self {
            src_pk: self.dst_pk,
            dst_pk: self.src_pk,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Source address.
    #[must_use]
    pub const fn src(&self) -> Addr {
        Addr::new(self.src_pk, self.src_port)
    }

    /// Destination address.
    #[must_use]
    pub const fn dst(&self) -> Addr {
        Addr::new(self.dst_pk, self.dst_port)
    }

    /// Encode into a fixed-size rule body segment.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[..32].copy_from_slice(self.src_pk.as_bytes());
        out[32..64].copy_from_slice(self.dst_pk.as_bytes());
        out[64..66].copy_from_slice(&self.src_port.to_be_bytes());
        out[66..68].copy_from_slice(&self.dst_port.to_be_bytes());
        out
    }

    /// Decode from a rule body segment.
    ///
    /// Returns `None` if `raw` is shorter than [`DESCRIPTOR_SIZE`].
    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < DESCRIPTOR_SIZE {
            return None;
        }
        let mut src_pk = [0u8; 32];
        let mut dst_pk = [0u8; 32];
        src_pk.copy_from_slice(&raw[..32]);
        dst_pk.copy_from_slice(&raw[32..64]);
        Some(Self {
            src_pk: PublicKey::from_bytes(src_pk),
            dst_pk: PublicKey::from_bytes(dst_pk),
            src_port: u16::from_be_bytes([raw[64], raw[65]]),
            dst_port: u16::from_be_bytes([raw[66], raw[67]]),
        })
    }
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src(), self.dst())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_crypto::Keypair;

    #[test]
    fn test_descriptor_roundtrip() {
        let a = Keypair::generate().public;
        let b = Keypair::generate().public;
        let desc = RouteDescriptor::new(a, b, 7000, 8000);
        let decoded = RouteDescriptor::from_bytes(&desc.to_bytes()).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn test_descriptor_flip() {
        let a = Keypair::generate().public;
        let b = Keypair::generate().public;
        let desc = RouteDescriptor::new(a, b, 1, 2);
        let flipped = desc.flipped();
        assert_eq!(flipped.src(), desc.dst());
        assert_eq!(flipped.dst(), desc.src());
        assert_eq!(flipped.flipped(), desc);
    }

    #[test]
    fn test_descriptor_short_input() {
        assert!(RouteDescriptor::from_bytes(&[0u8; DESCRIPTOR_SIZE - 1]).is_none());
    }
}
