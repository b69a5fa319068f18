//! Builder pattern for constructing delivery engines.
//!
//! Storage backends are plugged in through factory functions keyed by the
//! implementation names used in configuration. The builder instantiates every
//! configured backend it has a factory for and hands the primary one to the
//! engine.

use crate::engine::{event_bus::EventBus, DeliveryEngine};
use repartidev_config::Config;
use repartidev_storage::{StorageError, StorageInterface, StorageService};
use repartidev_types::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions needed to build a [`DeliveryEngine`].
pub struct EngineFactories<SF> {
	pub storage_factories: HashMap<String, SF>,
}

/// Builder for constructing a DeliveryEngine with pluggable storage.
pub struct EngineBuilder {
	config: Config,
	clock: Option<Arc<dyn Clock>>,
	event_bus: Option<EventBus>,
}

impl EngineBuilder {
	/// Creates a new EngineBuilder with the given configuration.
	pub fn new(config: Config) -> Self {
		Self {
			config,
			clock: None,
			event_bus: None,
		}
	}

	/// Overrides the wall clock, mostly for tests.
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	/// Uses an existing event bus instead of a fresh one.
	pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
		self.event_bus = Some(event_bus);
		self
	}

	/// Builds the DeliveryEngine from the storage factories.
	pub async fn build<SF>(self, factories: EngineFactories<SF>) -> Result<DeliveryEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
	{
		let mut storage_impls = HashMap::new();
		for (name, config) in &self.config.storage.implementations {
			match factories.storage_factories.get(name) {
				Some(factory) => match factory(config) {
					Ok(implementation) => {
						storage_impls.insert(name.clone(), implementation);
						let is_primary = &self.config.storage.primary == name;
						tracing::info!(component = "storage", implementation = %name, enabled = %is_primary, "Loaded");
					},
					Err(e) => {
						tracing::error!(
							component = "storage",
							implementation = %name,
							error = %e,
							"Failed to create storage implementation"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create storage implementation '{}': {}",
							name, e
						)));
					},
				},
				None => {
					tracing::warn!(component = "storage", implementation = %name, "No factory registered, skipping");
				},
			}
		}

		if storage_impls.is_empty() {
			return Err(BuilderError::Config(
				"No valid storage implementations available".into(),
			));
		}

		let primary_storage = &self.config.storage.primary;
		let storage_backend = storage_impls.remove(primary_storage).ok_or_else(|| {
			BuilderError::MissingComponent(format!(
				"Primary storage '{}' failed to load or has invalid configuration",
				primary_storage
			))
		})?;
		let storage = Arc::new(StorageService::new(storage_backend));

		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
		let event_bus = self.event_bus.unwrap_or_default();

		Ok(DeliveryEngine::new(self.config, storage, clock, event_bus))
	}
}
