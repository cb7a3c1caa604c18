//! # Skein Transport
//!
//! Authenticated per-peer links over heterogeneous underlay networks.
//!
//! This crate provides:
//! - The underlay abstraction (`network`): raw point-to-point streams
//!   between visors, with in-memory and TCP implementations
//! - The settlement handshake that proves both identities once per link
//! - `ManagedTransport`: one peer link as a framed packet channel with
//!   redial and status accounting
//! - `TransportManager`: the single registry of managed transports and the
//!   shared inbound packet queue
//! - The transport-discovery client and the per-transport log store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      TransportManager                           │
//! │     (registry keyed by transport id, shared packet inbox)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      ManagedTransport                           │
//! │      (settlement handshake, packet framing, redial)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Underlay                                │
//! │        (raw authenticated streams: memory, TCP, ...)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod discovery;
pub mod entry;
pub mod error;
pub mod handshake;
pub mod log_store;
pub mod managed;
pub mod manager;
pub mod network;

pub use discovery::{DiscoveryClient, HttpDiscovery, MemoryDiscovery};
pub use entry::{transport_id, EntryWithStatus, SignedTransportEntry, Status, TransportEntry};
pub use error::TransportError;
pub use log_store::{FileLogStore, LogStore, MemoryLogStore, TransportLogEntry};
pub use managed::ManagedTransport;
pub use manager::{ManagerConfig, TransportManager};
pub use network::{Network, NetworkType};

/// Underlay port every visor's transport listener binds.
pub const TRANSPORT_PORT: u16 = 45;

/// Underlay port a setup node dials a visor's setup gateway on.
pub const AWAIT_SETUP_PORT: u16 = 136;

/// Underlay port a setup node serves `DialRouteGroup` on.
pub const SETUP_PORT: u16 = 36;
