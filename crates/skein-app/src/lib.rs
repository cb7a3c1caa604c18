//! # Skein App
//!
//! The app-facing edge of a visor: ephemeral-port reservation and the
//! networker that maps accepted circuits to local listeners.

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod networker;
pub mod porter;
pub mod registry;

pub use error::AppError;
pub use networker::{AppConn, AppListener, Networker, SkeinNetworker};
pub use porter::{PortGuard, Porter, PORTER_MIN_EPHEMERAL};
pub use registry::{add_networker, clear_networkers, networker};
