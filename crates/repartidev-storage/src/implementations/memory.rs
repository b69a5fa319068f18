//! In-memory storage backend implementation.
//!
//! This module provides a memory-based implementation of the StorageInterface trait,
//! useful for testing and development scenarios where persistence is not required.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry, WriteOp};
use async_trait::async_trait;
use repartidev_types::{ConfigSchema, ImplementationRegistry, Schema, ValidationError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory storage implementation.
///
/// Data lives in an ordered map behind a read-write lock. Batch commits hold
/// the write lock for the whole check-then-apply sequence, which makes them
/// atomic with respect to every other operation.
pub struct MemoryStorage {
	/// The in-memory store protected by a read-write lock.
	store: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
	/// Creates a new MemoryStorage instance.
	pub fn new() -> Self {
		Self {
			store: Arc::new(RwLock::new(BTreeMap::new())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let store = self.store.read().await;
		store.get(key).cloned().ok_or(StorageError::NotFound)
	}

	async fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StorageError> {
		let store = self.store.read().await;
		Ok(store
			.range(prefix.to_string()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(_, value)| value.clone())
			.collect())
	}

	async fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
		let mut store = self.store.write().await;

		if let Some(failed) = ops
			.iter()
			.find(|op| !op.is_satisfied_by(store.get(&op.key).map(Vec::as_slice)))
		{
			return Err(StorageError::PreconditionFailed(failed.key.clone()));
		}

		for op in ops {
			match op.value {
				Some(value) => {
					store.insert(op.key, value);
				},
				None => {
					store.remove(&op.key);
				},
			}
		}
		Ok(())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory storage has no configuration
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory storage backend from configuration.
pub fn create_storage(_config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	Ok(Box::new(MemoryStorage::new()))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Precondition;

	async fn put(storage: &MemoryStorage, key: &str, value: &[u8]) {
		storage
			.commit(vec![WriteOp {
				key: key.into(),
				value: Some(value.to_vec()),
				precondition: None,
			}])
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn test_basic_operations() {
		let storage = MemoryStorage::new();

		let key = "test_key";
		put(&storage, key, b"test_value").await;
		assert_eq!(storage.get_bytes(key).await.unwrap(), b"test_value".to_vec());

		storage
			.commit(vec![WriteOp {
				key: key.into(),
				value: None,
				precondition: Some(Precondition::Matches(b"test_value".to_vec())),
			}])
			.await
			.unwrap();

		let result = storage.get_bytes(key).await;
		assert!(matches!(result, Err(StorageError::NotFound)));
	}

	#[tokio::test]
	async fn test_scan_prefix_stops_at_namespace_boundary() {
		let storage = MemoryStorage::new();
		put(&storage, "orders:1", b"a").await;
		put(&storage, "orders:2", b"b").await;
		put(&storage, "ordersx:3", b"c").await;
		put(&storage, "users:1", b"d").await;

		let values = storage.scan_prefix("orders:").await.unwrap();
		assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
	}

	#[tokio::test]
	async fn test_failed_precondition_leaves_store_untouched() {
		let storage = MemoryStorage::new();
		put(&storage, "orders:1", b"pending").await;

		let result = storage
			.commit(vec![
				WriteOp {
					key: "orders:1".into(),
					value: Some(b"accepted".to_vec()),
					precondition: Some(Precondition::Matches(b"pending".to_vec())),
				},
				WriteOp {
					key: "users:1".into(),
					value: Some(b"busy".to_vec()),
					precondition: Some(Precondition::Matches(b"idle".to_vec())),
				},
			])
			.await;
		assert!(matches!(result, Err(StorageError::PreconditionFailed(key)) if key == "users:1"));
		assert_eq!(storage.get_bytes("orders:1").await.unwrap(), b"pending".to_vec());
		assert!(matches!(storage.get_bytes("users:1").await, Err(StorageError::NotFound)));
	}

	#[tokio::test]
	async fn test_concurrent_guarded_writes_single_winner() {
		let storage = Arc::new(MemoryStorage::new());
		put(&storage, "orders:1", b"pending").await;

		let mut handles = Vec::new();
		for claimant in 0..8u8 {
			let storage = storage.clone();
			handles.push(tokio::spawn(async move {
				storage
					.commit(vec![WriteOp {
						key: "orders:1".into(),
						value: Some(vec![claimant]),
						precondition: Some(Precondition::Matches(b"pending".to_vec())),
					}])
					.await
					.is_ok()
			}));
		}

		let mut winners = 0;
		for handle in handles {
			if handle.await.unwrap() {
				winners += 1;
			}
		}
		assert_eq!(winners, 1);
	}
}
