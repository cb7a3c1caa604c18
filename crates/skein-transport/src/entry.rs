//! Transport entries and deterministic transport ids.

use crate::network::NetworkType;
use serde::{Deserialize, Serialize};
use skein_crypto::{PublicKey, Signature};
use uuid::Uuid;

/// Namespace for transport-id derivation.
const TRANSPORT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x54, 0x52, 0x41, 0x4E, 0x53, 0x50, 0x4F, 0x52, 0x54, 0x2D, 0x49, 0x44, 0x2D, 0x4E, 0x53,
    0x00,
]);

/// Deterministic transport id for an edge pair and underlay type.
///
/// The edges are sorted before hashing, so
/// `transport_id(a, b, t) == transport_id(b, a, t)` and simultaneous
/// dials from both sides land on the same id.
#[must_use]
pub fn transport_id(a: PublicKey, b: PublicKey, net_type: NetworkType) -> Uuid {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut name = Vec::with_capacity(32 + 32 + 8);
    name.extend_from_slice(lo.as_bytes());
    name.extend_from_slice(hi.as_bytes());
    name.extend_from_slice(net_type.as_str().as_bytes());
    Uuid::new_v5(&TRANSPORT_ID_NAMESPACE, &name)
}

/// A transport as registered with discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEntry {
    /// Deterministic transport id
    pub id: Uuid,
    /// Underlay kind
    #[serde(rename = "type")]
    pub net_type: NetworkType,
    /// Edge keys, sorted ascending
    pub edges: [PublicKey; 2],
    /// Whether the entry is visible to route finders
    pub public: bool,
}

impl TransportEntry {
    /// Build the entry for an edge pair, sorting the edges.
    #[must_use]
    pub fn new(a: PublicKey, b: PublicKey, net_type: NetworkType) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self {
            id: transport_id(a, b, net_type),
            net_type,
            edges: [lo, hi],
            public: true,
        }
    }

    /// The edge that is not `local`, or `local` itself for a self-edge.
    #[must_use]
    pub fn remote_edge(&self, local: PublicKey) -> PublicKey {
        if self.edges[0] == local {
            self.edges[1]
        } else {
            self.edges[0]
        }
    }

    /// Index of `pk` within the sorted edges, if present.
    #[must_use]
    pub fn edge_index(&self, pk: &PublicKey) -> Option<usize> {
        self.edges.iter().position(|e| e == pk)
    }
}

/// An entry plus the edge signatures collected during settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTransportEntry {
    /// The agreed entry
    pub entry: TransportEntry,
    /// Signatures indexed by edge position; `None` until provided
    pub signatures: [Option<Signature>; 2],
}

impl SignedTransportEntry {
    /// Wrap an entry with no signatures yet.
    #[must_use]
    pub fn new(entry: TransportEntry) -> Self {
        Self {
            entry,
            signatures: [None, None],
        }
    }

    /// Attach `signature` at the edge slot belonging to `pk`.
    ///
    /// Unknown keys are ignored.
    pub fn sign(&mut self, pk: &PublicKey, signature: Signature) {
        if let Some(idx) = self.entry.edge_index(pk) {
            self.signatures[idx] = Some(signature);
        }
    }
}

/// Liveness status reported to discovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Status {
    /// Transport id
    pub id: Uuid,
    /// Whether the transport currently has a bound connection
    pub is_up: bool,
}

/// Discovery query result: an entry with its last reported status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryWithStatus {
    /// The registered entry
    pub entry: TransportEntry,
    /// Whether the transport was last reported up
    pub is_up: bool,
}
