//! Residents, condominiums and departments.
//!
//! Thin typed access to the directory records. User updates go through a
//! compare-and-swap on the stored record so a role change and a rating update
//! landing at the same time cannot overwrite each other.

use repartidev_storage::{Batch, StorageError, StorageService, Versioned};
use repartidev_types::{Condominium, Department, StorageKey, User};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while reading or writing directory records.
#[derive(Debug, Error)]
pub enum DirectoryError {
	#[error("{kind} not found: {id}")]
	NotFound { kind: &'static str, id: String },
	#[error("{0} was modified concurrently")]
	Stale(String),
	#[error("Storage error: {0}")]
	Storage(String),
}

fn map_storage(kind: &'static str, id: &str, err: StorageError) -> DirectoryError {
	match err {
		StorageError::NotFound => DirectoryError::NotFound {
			kind,
			id: id.to_string(),
		},
		StorageError::PreconditionFailed(key) => DirectoryError::Stale(key),
		other => DirectoryError::Storage(other.to_string()),
	}
}

/// Storage-backed directory of residents and buildings.
pub struct Directory {
	storage: Arc<StorageService>,
}

impl Directory {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	async fn insert<T: serde::Serialize>(
		&self,
		key: StorageKey,
		kind: &'static str,
		id: Uuid,
		value: &T,
	) -> Result<(), DirectoryError> {
		let id = id.to_string();
		let batch = Batch::new()
			.insert_new(key.as_str(), &id, value)
			.map_err(|e| DirectoryError::Storage(e.to_string()))?;
		self.storage
			.commit(batch)
			.await
			.map_err(|e| map_storage(kind, &id, e))
	}

	pub async fn insert_condominium(&self, condominium: &Condominium) -> Result<(), DirectoryError> {
		self.insert(
			StorageKey::Condominiums,
			"Condominium",
			condominium.id,
			condominium,
		)
		.await
	}

	pub async fn get_condominium(&self, id: Uuid) -> Result<Condominium, DirectoryError> {
		let id = id.to_string();
		self.storage
			.retrieve(StorageKey::Condominiums.as_str(), &id)
			.await
			.map_err(|e| map_storage("Condominium", &id, e))
	}

	pub async fn insert_department(&self, department: &Department) -> Result<(), DirectoryError> {
		self.insert(
			StorageKey::Departments,
			"Department",
			department.id,
			department,
		)
		.await
	}

	pub async fn get_department(&self, id: Uuid) -> Result<Department, DirectoryError> {
		let id = id.to_string();
		self.storage
			.retrieve(StorageKey::Departments.as_str(), &id)
			.await
			.map_err(|e| map_storage("Department", &id, e))
	}

	pub async fn insert_user(&self, user: &User) -> Result<(), DirectoryError> {
		self.insert(StorageKey::Users, "User", user.id, user).await
	}

	pub async fn get_user(&self, id: Uuid) -> Result<User, DirectoryError> {
		Ok(self.get_user_versioned(id).await?.into_inner())
	}

	pub async fn get_user_versioned(&self, id: Uuid) -> Result<Versioned<User>, DirectoryError> {
		let id = id.to_string();
		self.storage
			.retrieve_versioned(StorageKey::Users.as_str(), &id)
			.await
			.map_err(|e| map_storage("User", &id, e))
	}

	/// Writes `user` if the stored record still matches `prior`.
	pub async fn replace_user(
		&self,
		prior: &Versioned<User>,
		user: &User,
	) -> Result<(), DirectoryError> {
		let id = user.id.to_string();
		self.storage
			.compare_and_swap(StorageKey::Users.as_str(), &id, prior, user)
			.await
			.map_err(|e| map_storage("User", &id, e))
	}

	pub async fn all_users(&self) -> Result<Vec<User>, DirectoryError> {
		self.storage
			.retrieve_all(StorageKey::Users.as_str())
			.await
			.map_err(|e| DirectoryError::Storage(e.to_string()))
	}
}
