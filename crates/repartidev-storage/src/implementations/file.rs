//! File-based storage backend implementation.
//!
//! Each key is stored as one JSON file under a base directory. Batch commits
//! are serialised by an in-process mutex and by an exclusive `fs2` lock on a
//! lock file in the base directory, so two service processes sharing a
//! directory cannot both win a compare-and-swap.
//!
//! A commit first stages every new value in a temp file next to its record.
//! Only once all of them are on disk is a journal listing the batch renamed
//! into place; that rename is the commit point. The records are then swapped
//! in and the journal removed. A journal found when the backend opens, or at
//! the start of the next commit, is replayed; staged files without a journal
//! are discarded. The whole sequence runs on a blocking thread, so dropping
//! the caller's future cannot stop it half way.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry, WriteOp};
use async_trait::async_trait;
use fs2::FileExt;
use repartidev_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;

const LOCK_FILE: &str = ".commit.lock";
const JOURNAL_FILE: &str = ".commit.journal";
const PENDING_JOURNAL_FILE: &str = ".commit.journal.tmp";
const EXTENSION: &str = "json";
const STAGED_EXTENSION: &str = "tmp";

fn backend(e: impl std::fmt::Display) -> StorageError {
	StorageError::Backend(e.to_string())
}

/// Converts a storage key to a filesystem-safe file name.
fn file_name(key: &str) -> String {
	let safe_key = key.replace(['/', '\\', ':'], "_");
	format!("{}.{}", safe_key, EXTENSION)
}

fn record_path(base: &Path, key: &str) -> PathBuf {
	base.join(file_name(key))
}

fn staged_path(base: &Path, key: &str) -> PathBuf {
	record_path(base, key).with_extension(STAGED_EXTENSION)
}

/// The writes of one batch, recorded once every value is staged.
#[derive(Debug, Serialize, Deserialize)]
struct Journal {
	entries: Vec<JournalEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
	key: String,
	/// `true` when a staged file replaces the record, `false` for a delete.
	staged: bool,
}

impl Journal {
	fn for_ops(ops: &[WriteOp]) -> Self {
		Self {
			entries: ops
				.iter()
				.map(|op| JournalEntry {
					key: op.key.clone(),
					staged: op.value.is_some(),
				})
				.collect(),
		}
	}
}

/// File-based storage implementation.
pub struct FileStorage {
	/// Base directory path for storing files.
	base_path: PathBuf,
	/// Serialises commits issued from this process.
	commit_guard: Arc<Mutex<()>>,
}

impl FileStorage {
	/// Creates a new FileStorage rooted at `base_path`.
	///
	/// Nothing is touched on disk until the first commit, which also finishes
	/// any commit an earlier process left behind.
	pub fn new(base_path: PathBuf) -> Self {
		Self {
			base_path,
			commit_guard: Arc::new(Mutex::new(())),
		}
	}

	/// Opens the store at `base_path`, replaying or discarding whatever an
	/// interrupted commit left in it.
	pub fn open(base_path: PathBuf) -> Result<Self, StorageError> {
		if base_path.is_dir() {
			let _lock = lock_directory(&base_path)?;
			recover(&base_path)?;
		}
		Ok(Self::new(base_path))
	}

	async fn read_optional(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		read_if_present(&record_path(&self.base_path, key)).await
	}
}

/// Takes the cross-process commit lock. The lock is released when the
/// returned file handle is dropped.
fn lock_directory(base: &Path) -> Result<std::fs::File, StorageError> {
	let file = std::fs::OpenOptions::new()
		.create(true)
		.truncate(false)
		.write(true)
		.open(base.join(LOCK_FILE))
		.map_err(backend)?;
	file.lock_exclusive().map_err(backend)?;
	Ok(file)
}

fn read_record(base: &Path, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
	match std::fs::read(record_path(base, key)) {
		Ok(data) => Ok(Some(data)),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
		Err(e) => Err(backend(e)),
	}
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
	let mut file = std::fs::File::create(path).map_err(backend)?;
	file.write_all(bytes).map_err(backend)?;
	file.sync_all().map_err(backend)
}

fn remove_if_present(path: &Path) -> Result<(), StorageError> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
		Err(e) => Err(backend(e)),
	}
}

fn sync_directory(base: &Path) -> Result<(), StorageError> {
	std::fs::File::open(base)
		.and_then(|dir| dir.sync_all())
		.map_err(backend)
}

/// Moves every journaled write into place. Safe to run more than once: a
/// staged file that is already gone was renamed by an earlier run.
fn apply_journal(base: &Path, journal: &Journal) -> Result<(), StorageError> {
	for entry in &journal.entries {
		let record = record_path(base, &entry.key);
		if entry.staged {
			match std::fs::rename(staged_path(base, &entry.key), &record) {
				Ok(()) => {},
				Err(e) if e.kind() == ErrorKind::NotFound => {},
				Err(e) => return Err(backend(e)),
			}
		} else {
			remove_if_present(&record)?;
		}
	}
	sync_directory(base)
}

/// Finishes a journaled commit and drops staged files no journal refers to.
/// Must run under the directory lock.
fn recover(base: &Path) -> Result<(), StorageError> {
	let journal_path = base.join(JOURNAL_FILE);
	match std::fs::read(&journal_path) {
		Ok(bytes) => {
			let journal: Journal = serde_json::from_slice(&bytes)
				.map_err(|e| StorageError::Serialization(e.to_string()))?;
			tracing::warn!(
				writes = journal.entries.len(),
				"Replaying interrupted storage commit"
			);
			apply_journal(base, &journal)?;
			remove_if_present(&journal_path)?;
		},
		Err(e) if e.kind() == ErrorKind::NotFound => {},
		Err(e) => return Err(backend(e)),
	}

	for entry in std::fs::read_dir(base).map_err(backend)? {
		let entry = entry.map_err(backend)?;
		let path = entry.path();
		let is_staged = path.extension().is_some_and(|ext| ext == STAGED_EXTENSION);
		if is_staged && entry.file_type().map_err(backend)?.is_file() {
			tracing::debug!("Discarding uncommitted {:?}", path);
			remove_if_present(&path)?;
		}
	}
	Ok(())
}

fn discard_staged(base: &Path, ops: &[WriteOp]) {
	for op in ops.iter().filter(|op| op.value.is_some()) {
		let path = staged_path(base, &op.key);
		if let Err(e) = remove_if_present(&path) {
			tracing::warn!("Could not discard staged {:?}: {}", path, e);
		}
	}
}

fn commit_blocking(base: &Path, ops: Vec<WriteOp>) -> Result<(), StorageError> {
	std::fs::create_dir_all(base).map_err(backend)?;
	let _lock = lock_directory(base)?;
	recover(base)?;

	for op in &ops {
		let current = read_record(base, &op.key)?;
		if !op.is_satisfied_by(current.as_deref()) {
			return Err(StorageError::PreconditionFailed(op.key.clone()));
		}
	}

	let staged = ops.iter().try_for_each(|op| match &op.value {
		Some(value) => write_synced(&staged_path(base, &op.key), value),
		None => Ok(()),
	});
	let journal = Journal::for_ops(&ops);
	let journaled = staged.and_then(|()| {
		let bytes =
			serde_json::to_vec(&journal).map_err(|e| StorageError::Serialization(e.to_string()))?;
		let pending = base.join(PENDING_JOURNAL_FILE);
		write_synced(&pending, &bytes)?;
		std::fs::rename(&pending, base.join(JOURNAL_FILE)).map_err(backend)?;
		sync_directory(base)
	});
	if let Err(e) = journaled {
		discard_staged(base, &ops);
		remove_if_present(&base.join(PENDING_JOURNAL_FILE))?;
		return Err(e);
	}

	// From here on the batch is committed; a failure leaves the journal for
	// the next commit or the next open to replay.
	apply_journal(base, &journal)?;
	remove_if_present(&base.join(JOURNAL_FILE))
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.read_optional(key).await?.ok_or(StorageError::NotFound)
	}

	async fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StorageError> {
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(backend(e)),
		};

		let file_prefix = prefix.replace(['/', '\\', ':'], "_");
		let mut matches = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(backend)? {
			let path = entry.path();
			let is_record = path.extension().is_some_and(|ext| ext == EXTENSION);
			let name = entry.file_name().to_string_lossy().into_owned();
			if is_record && name.starts_with(&file_prefix) {
				matches.push((name, path));
			}
		}
		matches.sort_by(|a, b| a.0.cmp(&b.0));

		let mut values = Vec::with_capacity(matches.len());
		for (_, path) in matches {
			match read_if_present(&path).await? {
				Some(data) => values.push(data),
				None => tracing::debug!("Skipping {:?}: removed during scan", path),
			}
		}
		Ok(values)
	}

	async fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
		let base = self.base_path.clone();
		let guard = Arc::clone(&self.commit_guard);
		tokio::task::spawn_blocking(move || {
			let _local = guard
				.lock()
				.map_err(|_| StorageError::Backend("commit guard poisoned".into()))?;
			commit_blocking(&base, ops)
		})
		.await
		.map_err(backend)?
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}
}

async fn read_if_present(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
	match fs::read(path).await {
		Ok(data) => Ok(Some(data)),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
		Err(e) => Err(backend(e)),
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("storage_path", FieldType::String).with_validator(|value| {
					match value.as_str() {
						Some(path) if path.trim().is_empty() => {
							Err("storage_path cannot be empty".to_string())
						},
						_ => Ok(()),
					}
				}),
			],
		);
		schema.validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::open(PathBuf::from(storage_path))?))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
