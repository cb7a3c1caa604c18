//! # Skein Router
//!
//! The routing subsystem of a skein visor: turns the transport manager's
//! raw packet stream into addressable, port-multiplexed circuits between
//! public keys.
//!
//! This crate provides:
//! - The route-finder client (candidate paths between two keys)
//! - The setup-node client and the visor-side setup RPC gateway
//! - The `Router`: rule dispatch, route-group lifecycle, dial and accept
//! - The `RouteGroup`: a reliable bidirectional stream over a rule pair
//!
//! ## Control flow
//!
//! ```text
//! dial_routes ──► route finder ──► setup node ──► rules installed
//!      │                                               │
//!      └──────────────► RouteGroup ◄───────────────────┘
//!                            │
//!       read/write ◄── packet dispatch ◄── transport manager inbox
//! ```

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod route_group;
pub mod routefinder;
pub mod router;
pub mod setup;

pub use error::RouterError;
pub use route_group::{RouteGroup, RouteGroupConfig};
pub use routefinder::{HttpRouteFinder, MockRouteFinder, RouteFinder, RouteOptions};
pub use router::{Router, RouterConfig, DEFAULT_ROUTE_KEEP_ALIVE};
pub use setup::{RouteGroupDialer, SetupNodeDialer};
