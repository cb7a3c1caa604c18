//! # Skein Routing
//!
//! Routing primitives shared by every hop of the overlay:
//!
//! - Rule encoding and decoding (fixed-offset accessors over a byte string)
//! - Packet framing for managed transports
//! - The per-visor routing table with reservation and activity expiry
//! - Path and route types exchanged with the route finder and setup nodes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Routing table                            │
//! │        (route-id → rule, activity-driven expiry)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Rules                                  │
//! │   (Consume / Forward / IntermediaryForward, one per hop)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Packets                                 │
//! │        (Data / Close / KeepAlive frames on transports)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod address;
pub mod error;
pub mod packet;
pub mod route;
pub mod rule;
pub mod table;

pub use address::{Addr, Port, RouteDescriptor};
pub use error::{PacketError, RoutingError};
pub use packet::{CloseCode, Packet, PacketType, MAX_FRAME_SIZE, PACKET_HEADER_SIZE};
pub use route::{BidirectionalRoute, EdgeRules, Hop, Path, PathEdges};
pub use rule::{Rule, RuleType, RULE_HEADER_SIZE};
pub use table::{RouteId, RoutingTable};
