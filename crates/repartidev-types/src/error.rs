//! Error classification shared by the engine and its transports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a failed engine operation.
///
/// `Forbidden`, `InvalidTransition` and `InvalidInput` are deterministic and
/// only worth retrying after the request changes. `Conflict` may be retried
/// immediately after re-reading the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
	/// The actor is known but not entitled to the action.
	Forbidden,
	/// The order's status has no edge for the action.
	InvalidTransition,
	/// An optimistic concurrency check lost a race.
	Conflict,
	/// Malformed rating, non-positive amount or missing reference.
	InvalidInput,
	/// An id did not resolve.
	NotFound,
	/// The actor exceeded a request quota.
	RateLimited,
	/// Storage or serialization failure.
	Internal,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}
