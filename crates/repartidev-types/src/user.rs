//! Resident account types.
//!
//! A single closed [`Role`] enum drives every capability check. Screens and
//! transports never compare role strings themselves; they go through the
//! predicates in the core permission engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Role a resident plays in the delivery network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
	/// Posts delivery orders.
	Receiver,
	/// Claims and fulfills delivery orders.
	Deliverer,
	/// Both posts and fulfills orders.
	ReceiverAndDeliverer,
	/// Manages the network.
	Admin,
}

impl Role {
	/// Returns the canonical wire name of the role.
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::Receiver => "RECEIVER",
			Role::Deliverer => "DELIVERER",
			Role::ReceiverAndDeliverer => "RECEIVER_AND_DELIVERER",
			Role::Admin => "ADMIN",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"RECEIVER" => Ok(Role::Receiver),
			"DELIVERER" => Ok(Role::Deliverer),
			"RECEIVER_AND_DELIVERER" => Ok(Role::ReceiverAndDeliverer),
			"ADMIN" => Ok(Role::Admin),
			other => Err(format!("unknown role: {}", other)),
		}
	}
}

/// Denormalised reference to the department a resident or order belongs to.
///
/// Carrying the condominium id alongside the department id lets permission
/// predicates stay pure over the values they receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentRef {
	/// Department identifier.
	pub id: Uuid,
	/// Condominium owning the department.
	pub condominium_id: Uuid,
	/// Tower the department is located in.
	pub tower: String,
	/// Floor the department is located on.
	pub floor: i32,
}

/// A registered resident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
	/// Unique identifier for this user.
	pub id: Uuid,
	pub first_name: String,
	pub last_name: String,
	/// Lower-cased e-mail address.
	pub email: String,
	/// Role controlling which order actions the user may take.
	pub role: Role,
	/// Department the user lives in, if any.
	#[serde(default)]
	pub department: Option<DepartmentRef>,
	/// Whether the user currently accepts deliveries.
	/// Only meaningful when the role permits delivering.
	#[serde(default)]
	pub is_available_for_delivery: bool,
	/// Average of all ratings received, in `[0, 5]`.
	#[serde(default)]
	pub rating_average: f64,
	/// Number of ratings received.
	#[serde(default)]
	pub rating_count: u32,
	/// Orders currently assigned to, accepted or started by this user.
	///
	/// Written in the same guarded batch as the order moving in or out of an
	/// active status, so capacity and availability checks race on this record.
	#[serde(default)]
	pub active_orders: u32,
	/// Timestamp when the user registered.
	pub created_at: DateTime<Utc>,
}

impl User {
	/// Returns the display name of the user.
	pub fn full_name(&self) -> String {
		format!("{} {}", self.first_name, self.last_name)
			.trim()
			.to_string()
	}

	/// Returns the condominium the user lives in, if a department is set.
	pub fn condominium_id(&self) -> Option<Uuid> {
		self.department.as_ref().map(|d| d.condominium_id)
	}
}

/// What other residents get to see of a user. Leaves out the e-mail address
/// and the workload counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: Uuid,
	pub first_name: String,
	pub last_name: String,
	pub role: Role,
	pub department: Option<DepartmentRef>,
	pub is_available_for_delivery: bool,
	pub rating_average: f64,
	pub rating_count: u32,
}

impl From<&User> for UserProfile {
	fn from(user: &User) -> Self {
		Self {
			id: user.id,
			first_name: user.first_name.clone(),
			last_name: user.last_name.clone(),
			role: user.role,
			department: user.department.clone(),
			is_available_for_delivery: user.is_available_for_delivery,
			rating_average: user.rating_average,
			rating_count: user.rating_count,
		}
	}
}
