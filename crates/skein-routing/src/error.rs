//! Error types for rules, packets and the routing table.

use crate::table::RouteId;
use thiserror::Error;

/// Routing-table and rule errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No unused route ids remain
    #[error("route id space exhausted")]
    Exhausted,

    /// No rule stored under the given id
    #[error("rule not found: {0}")]
    NotFound(RouteId),

    /// Rule bytes shorter than the header, or a body that does not match
    /// the declared type
    #[error("corrupted rule: {0}")]
    CorruptedRule(String),

    /// Unknown rule type byte
    #[error("invalid rule type: 0x{0:02X}")]
    InvalidRuleType(u8),

    /// Field accessor used on a rule variant that does not carry it
    #[error("rule of type {0} has no field {1}")]
    FieldUnavailable(&'static str, &'static str),
}

/// Packet framing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Frame length exceeds `MAX_FRAME_SIZE`
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge {
        /// Declared frame length
        len: usize,
        /// Maximum permitted length
        max: usize,
    },

    /// Frame shorter than the fixed header
    #[error("frame truncated: {len} < 5")]
    FrameTruncated {
        /// Actual length available
        len: usize,
    },

    /// Unknown packet type byte
    #[error("unknown packet type: 0x{0:02X}")]
    UnknownPacketType(u8),

    /// Payload too large to fit the u16 length field
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
}
