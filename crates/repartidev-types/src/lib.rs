//! Common types module for the Repartidev delivery system.
//!
//! This module defines the core data types shared by every Repartidev crate:
//! residents and their roles, the condominium directory, delivery orders and
//! reviews, lifecycle events, and the HTTP wire types. Keeping them in one
//! place guarantees that storage, engine and transport agree on a single
//! representation.

/// API types for HTTP endpoints and request/response structures.
pub mod api;
/// Clock abstraction used to timestamp transitions.
pub mod clock;
/// Condominium and department directory types.
pub mod condominium;
/// Error classification shared across crates.
pub mod error;
/// Event types for lifecycle notifications.
pub mod events;
/// Delivery order and review types.
pub mod order;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Storage namespaces.
pub mod storage;
/// Resident account types.
pub mod user;
/// Utility functions for display formatting.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

pub use api::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use condominium::*;
pub use error::ErrorKind;
pub use events::*;
pub use order::*;
pub use registry::ImplementationRegistry;
pub use storage::*;
pub use user::*;
pub use utils::truncate_id;
pub use validation::*;
