//! Condominium directory types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DepartmentRef;

/// A building complex grouping departments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condominium {
	pub id: Uuid,
	pub name: String,
	pub address: String,
	#[serde(default)]
	pub district: String,
	#[serde(default)]
	pub region: String,
	/// Number of entrances to the complex.
	#[serde(default)]
	pub entries: u32,
}

/// A single apartment inside a condominium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Department {
	pub id: Uuid,
	/// Condominium that exclusively owns this department.
	pub condominium_id: Uuid,
	pub name: String,
	pub tower: String,
	pub floor: i32,
}

impl Department {
	/// Builds the reference stored on users and orders.
	pub fn to_ref(&self) -> DepartmentRef {
		DepartmentRef {
			id: self.id,
			condominium_id: self.condominium_id,
			tower: self.tower.clone(),
			floor: self.floor,
		}
	}
}
