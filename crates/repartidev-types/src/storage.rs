//! Storage-related types for the Repartidev system.

use std::str::FromStr;

/// Storage namespaces for the different record collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Delivery orders keyed by order id.
	Orders,
	/// Residents keyed by user id.
	Users,
	/// Condominiums keyed by condominium id.
	Condominiums,
	/// Departments keyed by department id.
	Departments,
	/// Reviews keyed by the id of the reviewed order.
	Reviews,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Orders => "orders",
			StorageKey::Users => "users",
			StorageKey::Condominiums => "condominiums",
			StorageKey::Departments => "departments",
			StorageKey::Reviews => "reviews",
		}
	}

	/// Returns an iterator over all StorageKey variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Orders,
			Self::Users,
			Self::Condominiums,
			Self::Departments,
			Self::Reviews,
		]
		.into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::all().find(|key| key.as_str() == s).ok_or(())
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
