//! State management for delivery orders.
//!
//! This module provides the state machine that owns every status change an
//! order goes through, and the compare-and-swap persistence that keeps two
//! concurrent actions from both succeeding against the same order version.

pub mod order;

pub use order::{OrderStateError, OrderStateMachine};
