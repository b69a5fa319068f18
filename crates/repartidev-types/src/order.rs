//! Delivery order types for the Repartidev system.
//!
//! This module defines the order record, its numeric status codes, the
//! actions that drive transitions, and the review attached to a completed
//! order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::DepartmentRef;

/// Status of a delivery order.
///
/// Statuses are persisted and exchanged as their numeric codes (1..=7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OrderStatus {
	/// Posted by a receiver and waiting to be claimed.
	Pending = 1,
	/// Confirmed by the receiver but not yet claimed.
	Confirmed = 2,
	/// Earmarked for a specific deliverer who has not accepted yet.
	Assigned = 3,
	/// Claimed by a deliverer.
	Accepted = 4,
	/// Deliverer is on the way.
	InProgress = 5,
	/// Delivered.
	Completed = 6,
	/// Withdrawn by the receiver or the deliverer.
	Cancelled = 7,
}

impl OrderStatus {
	/// Returns the numeric code of the status.
	pub fn code(&self) -> u8 {
		*self as u8
	}

	/// Returns true if no transition leaves this status.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
	}

	/// Returns true if a deliverer is working on an order in this status.
	pub fn is_active_delivery(&self) -> bool {
		matches!(
			self,
			OrderStatus::Assigned | OrderStatus::Accepted | OrderStatus::InProgress
		)
	}

	/// Returns true if an order in this status must name a deliverer.
	pub fn requires_deliverer(&self) -> bool {
		matches!(
			self,
			OrderStatus::Assigned
				| OrderStatus::Accepted
				| OrderStatus::InProgress
				| OrderStatus::Completed
		)
	}
}

impl From<OrderStatus> for u8 {
	fn from(status: OrderStatus) -> Self {
		status.code()
	}
}

impl TryFrom<u8> for OrderStatus {
	type Error = String;

	fn try_from(code: u8) -> Result<Self, Self::Error> {
		match code {
			1 => Ok(OrderStatus::Pending),
			2 => Ok(OrderStatus::Confirmed),
			3 => Ok(OrderStatus::Assigned),
			4 => Ok(OrderStatus::Accepted),
			5 => Ok(OrderStatus::InProgress),
			6 => Ok(OrderStatus::Completed),
			7 => Ok(OrderStatus::Cancelled),
			other => Err(format!("unknown order status code: {}", other)),
		}
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OrderStatus::Pending => write!(f, "Pending"),
			OrderStatus::Confirmed => write!(f, "Confirmed"),
			OrderStatus::Assigned => write!(f, "Assigned"),
			OrderStatus::Accepted => write!(f, "Accepted"),
			OrderStatus::InProgress => write!(f, "InProgress"),
			OrderStatus::Completed => write!(f, "Completed"),
			OrderStatus::Cancelled => write!(f, "Cancelled"),
		}
	}
}

/// Action requested against an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
	/// An admin earmarks the order for a deliverer.
	Assign,
	/// A deliverer claims the order.
	Accept,
	/// The deliverer gives the order back.
	Reject,
	/// The deliverer sets off.
	Start,
	/// The deliverer hands the order over.
	Complete,
	/// The receiver or deliverer withdraws the order.
	Cancel,
}

impl fmt::Display for OrderAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			OrderAction::Assign => "assign",
			OrderAction::Accept => "accept",
			OrderAction::Reject => "reject",
			OrderAction::Start => "start",
			OrderAction::Complete => "complete",
			OrderAction::Cancel => "cancel",
		};
		f.write_str(name)
	}
}

/// A delivery request posted by a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
	/// Unique identifier for this order.
	pub id: Uuid,
	/// Resident who posted the order.
	pub receiver_id: Uuid,
	/// Department the order is delivered to; fixes the condominium scope.
	pub receiver_department: DepartmentRef,
	/// Resident delivering the order, once claimed or assigned.
	#[serde(default)]
	pub deliverer_id: Option<Uuid>,
	/// Current status of the order.
	pub status: OrderStatus,
	/// Fee paid to the deliverer.
	pub amount: Decimal,
	/// Whether the receiver wants the delivery as soon as possible.
	pub is_immediate: bool,
	/// When the delivery should take place.
	pub scheduled_date: DateTime<Utc>,
	/// Free-form instructions for the deliverer.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub delivery_notes: Option<String>,
	/// Timestamp when this order was created.
	pub created_at: DateTime<Utc>,
	/// Timestamp when this order was last updated. Never decreases.
	pub updated_at: DateTime<Utc>,
	/// Timestamp of completion; set iff the status is completed.
	#[serde(default)]
	pub completed_at: Option<DateTime<Utc>>,
	/// Review left by the receiver, if any.
	#[serde(default)]
	pub review_id: Option<Uuid>,
}

impl Order {
	/// Condominium the order belongs to.
	pub fn condominium_id(&self) -> Uuid {
		self.receiver_department.condominium_id
	}

	/// Checks the structural invariants every persisted order satisfies.
	pub fn check_invariants(&self) -> Result<(), String> {
		if self.deliverer_id.is_some() && self.deliverer_id == Some(self.receiver_id) {
			return Err("deliverer and receiver must differ".into());
		}
		if (self.status == OrderStatus::Completed) != self.completed_at.is_some() {
			return Err(format!(
				"completed_at must be set iff completed (status {})",
				self.status
			));
		}
		if self.status.requires_deliverer() && self.deliverer_id.is_none() {
			return Err(format!("status {} requires a deliverer", self.status));
		}
		if matches!(self.status, OrderStatus::Pending | OrderStatus::Confirmed)
			&& self.deliverer_id.is_some()
		{
			return Err(format!("status {} must not have a deliverer", self.status));
		}
		Ok(())
	}
}

/// Rating left by a receiver for the deliverer of a completed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
	pub id: Uuid,
	/// Order being reviewed. At most one review exists per order.
	pub order_id: Uuid,
	/// The receiver writing the review.
	pub reviewer_id: Uuid,
	/// The deliverer being reviewed.
	pub reviewed_id: Uuid,
	/// Rating from 1 to 5 inclusive.
	pub rating: u8,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub comment: Option<String>,
	pub created_at: DateTime<Utc>,
}
