//! Storage module for the Repartidev delivery system.
//!
//! This module provides abstractions for persisting users, directory records,
//! orders and reviews. Backends expose a byte-level key-value interface with
//! one extra capability the lifecycle engine depends on: a guarded batch
//! commit. Every write in a batch may carry a precondition on the current
//! stored bytes, and the batch is applied all-or-nothing under the backend's
//! lock. Order transitions use it as a compare-and-swap on the order record,
//! and review submission uses it to insert the review and update the
//! deliverer's rating in one unit.

use async_trait::async_trait;
use repartidev_types::{ConfigSchema, ImplementationRegistry};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// A batch precondition did not hold; nothing was written.
	#[error("Precondition failed for key {0}")]
	PreconditionFailed(String),
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Condition on the currently stored bytes of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
	/// The key must not exist.
	Absent,
	/// The key must exist and hold exactly these bytes.
	Matches(Vec<u8>),
}

/// A single write inside a batch commit.
#[derive(Debug, Clone)]
pub struct WriteOp {
	pub key: String,
	/// New value, or `None` to delete the key.
	pub value: Option<Vec<u8>>,
	pub precondition: Option<Precondition>,
}

impl WriteOp {
	/// Checks the precondition against the currently stored value.
	pub fn is_satisfied_by(&self, current: Option<&[u8]>) -> bool {
		match (&self.precondition, current) {
			(None, _) => true,
			(Some(Precondition::Absent), current) => current.is_none(),
			(Some(Precondition::Matches(expected)), Some(current)) => expected == current,
			(Some(Precondition::Matches(_)), None) => false,
		}
	}
}

/// Trait defining the low-level interface for storage backends.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Returns the values of every key starting with `prefix`, ordered by key.
	async fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StorageError>;

	/// Applies all writes atomically if every precondition holds.
	///
	/// Returns [`StorageError::PreconditionFailed`] naming the first failing
	/// key when any precondition does not hold; in that case nothing is
	/// written.
	async fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations.
///
/// Returns a vector of (name, factory) tuples for all available storage implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// A typed value together with the exact bytes it was read from.
///
/// The bytes serve as the compare-and-swap token when the value is written
/// back through a [`Batch`].
#[derive(Debug, Clone)]
pub struct Versioned<T> {
	pub value: T,
	raw: Vec<u8>,
}

impl<T> Versioned<T> {
	/// Consumes the wrapper, returning the value.
	pub fn into_inner(self) -> T {
		self.value
	}
}

/// Builder collecting guarded writes for [`StorageService::commit`].
#[derive(Debug, Default)]
pub struct Batch {
	ops: Vec<WriteOp>,
}

impl Batch {
	/// Creates an empty batch.
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a value that must not already exist.
	pub fn insert_new<T: Serialize>(
		mut self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<Self, StorageError> {
		self.ops.push(WriteOp {
			key: make_key(namespace, id),
			value: Some(encode(data)?),
			precondition: Some(Precondition::Absent),
		});
		Ok(self)
	}

	/// Replaces a value only if it is still exactly what `prior` was read as.
	pub fn replace<T: Serialize, P>(
		mut self,
		namespace: &str,
		id: &str,
		prior: &Versioned<P>,
		data: &T,
	) -> Result<Self, StorageError> {
		self.ops.push(WriteOp {
			key: make_key(namespace, id),
			value: Some(encode(data)?),
			precondition: Some(Precondition::Matches(prior.raw.clone())),
		});
		Ok(self)
	}

	/// Deletes a value only if it is still exactly what `prior` was read as.
	pub fn remove<P>(mut self, namespace: &str, id: &str, prior: &Versioned<P>) -> Self {
		self.ops.push(WriteOp {
			key: make_key(namespace, id),
			value: None,
			precondition: Some(Precondition::Matches(prior.raw.clone())),
		});
		self
	}

	/// Number of writes collected.
	pub fn len(&self) -> usize {
		self.ops.len()
	}

	/// Returns true if the batch holds no writes.
	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}
}

fn make_key(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

fn encode<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// High-level storage service that provides typed operations.
///
/// The StorageService wraps a low-level storage backend and provides
/// convenient methods for storing and retrieving typed data with
/// automatic JSON serialization.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&make_key(namespace, id)).await?;
		decode(&bytes)
	}

	/// Retrieves a value along with its compare-and-swap token.
	pub async fn retrieve_versioned<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Versioned<T>, StorageError> {
		let raw = self.backend.get_bytes(&make_key(namespace, id)).await?;
		let value = decode(&raw)?;
		Ok(Versioned { value, raw })
	}

	/// Retrieves every value stored under a namespace.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<T>, StorageError> {
		let prefix = format!("{}:", namespace);
		self.backend
			.scan_prefix(&prefix)
			.await?
			.iter()
			.map(|bytes| decode(bytes))
			.collect()
	}

	/// Writes `data` only if the stored value still equals `prior`.
	pub async fn compare_and_swap<T: Serialize, P>(
		&self,
		namespace: &str,
		id: &str,
		prior: &Versioned<P>,
		data: &T,
	) -> Result<(), StorageError> {
		self.commit(Batch::new().replace(namespace, id, prior, data)?)
			.await
	}

	/// Applies a batch of guarded writes atomically.
	pub async fn commit(&self, batch: Batch) -> Result<(), StorageError> {
		if batch.is_empty() {
			return Ok(());
		}
		tracing::debug!(writes = batch.len(), "Committing storage batch");
		self.backend.commit(batch.ops).await
	}
}
