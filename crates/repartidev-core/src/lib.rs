//! Core delivery engine for the Repartidev condominium delivery network.
//!
//! The engine owns the order lifecycle: it resolves actors against the
//! resident directory, evaluates permission predicates, drives the order
//! state machine with compare-and-swap writes and publishes lifecycle events.
//! Matching, earnings and rating aggregation live in their own modules as
//! pure functions over directory and order values.

pub mod builder;
pub mod directory;
pub mod earnings;
pub mod engine;
pub mod matcher;
pub mod permissions;
pub mod rating;
pub mod state;

pub use builder::{BuilderError, EngineBuilder, EngineFactories};
pub use engine::{event_bus::EventBus, DeliveryEngine, EngineError};
