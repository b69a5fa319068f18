//! Configuration module for the Repartidev delivery service.
//!
//! This module provides structures and utilities for managing service
//! configuration. Configuration is loaded from a TOML file, environment
//! variables referenced as `${VAR}` or `${VAR:-default}` are substituted before
//! parsing, and the result is validated so the engine never starts with an
//! inconsistent policy.

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Extract just the message without the input dump
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the delivery service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this service instance.
	pub service: ServiceConfig,
	/// Configuration for the storage backend.
	pub storage: StorageConfig,
	/// Order lifecycle policy.
	#[serde(default)]
	pub orders: OrdersConfig,
	/// Earnings reporting settings.
	#[serde(default)]
	pub earnings: EarningsConfig,
	/// Configuration for the HTTP API server.
	pub api: Option<ApiConfig>,
}

/// Identity of the service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier used in logs.
	pub id: String,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Order lifecycle policy knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrdersConfig {
	/// Maximum orders a deliverer may hold in assigned, accepted or
	/// in-progress state at once.
	#[serde(default = "default_max_active_orders")]
	pub max_active_orders: usize,
	/// Orders a receiver may create per rolling hour. Zero disables the limit.
	#[serde(default = "default_order_creation_limit")]
	pub order_creation_limit_per_hour: u32,
	/// Lets deliverers complete straight from accepted, skipping start.
	#[serde(default)]
	pub allow_direct_completion: bool,
	/// Hides orders from other condominiums in the available list.
	#[serde(default)]
	pub strict_condominium_matching: bool,
}

impl Default for OrdersConfig {
	fn default() -> Self {
		Self {
			max_active_orders: default_max_active_orders(),
			order_creation_limit_per_hour: default_order_creation_limit(),
			allow_direct_completion: false,
			strict_condominium_matching: false,
		}
	}
}

fn default_max_active_orders() -> usize {
	5
}

fn default_order_creation_limit() -> u32 {
	10
}

/// Earnings reporting settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EarningsConfig {
	/// Offset from UTC used to decide what "today" means.
	#[serde(default)]
	pub utc_offset_minutes: i32,
	/// Monthly earnings target shown as goal progress.
	#[serde(default = "default_monthly_goal")]
	pub monthly_goal: Decimal,
}

impl Default for EarningsConfig {
	fn default() -> Self {
		Self {
			utc_offset_minutes: 0,
			monthly_goal: default_monthly_goal(),
		}
	}
}

fn default_monthly_goal() -> Decimal {
	Decimal::new(500, 0)
}

/// Configuration for the HTTP API server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_api_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
	/// Maximum request size in bytes.
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
	/// CORS configuration.
	pub cors: Option<CorsConfig>,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
	/// Allowed origins for CORS.
	pub allowed_origins: Vec<String>,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

fn default_api_timeout() -> u64 {
	30
}

fn default_max_request_size() -> usize {
	64 * 1024
}

/// Largest UTC offset in the tz database, in minutes.
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Resolves environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable and
/// supports defaults with `${VAR_NAME:-default_value}`.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut missing = None;
	let resolved = re.replace_all(input, |caps: &regex::Captures<'_>| {
		let var_name = &caps[1];
		match (std::env::var(var_name), caps.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				missing.get_or_insert_with(|| var_name.to_string());
				String::new()
			},
		}
	});

	match missing {
		Some(var_name) => Err(ConfigError::Validation(format!(
			"Environment variable '{}' not found",
			var_name
		))),
		None => Ok(resolved.into_owned()),
	}
}

impl Config {
	/// Loads configuration from a file, resolving environment variables.
	pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let content = tokio::fs::read_to_string(path).await.map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				e.kind(),
				format!("Cannot read {}: {}", path.display(), e),
			))
		})?;
		content.parse()
	}

	/// Validates the configuration to ensure all required fields are properly set.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.trim().is_empty() {
			return Err(ConfigError::Validation("Service ID cannot be empty".into()));
		}

		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' is not among the configured implementations",
				self.storage.primary
			)));
		}

		if self.orders.max_active_orders == 0 {
			return Err(ConfigError::Validation(
				"orders.max_active_orders must be at least 1".into(),
			));
		}

		if self.earnings.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
			return Err(ConfigError::Validation(format!(
				"earnings.utc_offset_minutes must be within +/-{}",
				MAX_UTC_OFFSET_MINUTES
			)));
		}
		if self.earnings.monthly_goal <= Decimal::ZERO {
			return Err(ConfigError::Validation(
				"earnings.monthly_goal must be positive".into(),
			));
		}

		if let Some(api) = &self.api {
			if api.enabled && api.port == 0 {
				return Err(ConfigError::Validation("api.port cannot be 0".into()));
			}
			if api.timeout_seconds == 0 {
				return Err(ConfigError::Validation(
					"api.timeout_seconds must be positive".into(),
				));
			}
		}

		Ok(())
	}

	/// Minimal in-memory configuration for tests.
	#[cfg(any(test, feature = "testing"))]
	pub fn for_testing() -> Self {
		let mut implementations = HashMap::new();
		implementations.insert(
			"memory".to_string(),
			toml::Value::Table(toml::map::Map::new()),
		);
		Self {
			service: ServiceConfig {
				id: "test-service".to_string(),
			},
			storage: StorageConfig {
				primary: "memory".to_string(),
				implementations,
			},
			orders: OrdersConfig::default(),
			earnings: EarningsConfig::default(),
			api: None,
		}
	}
}

/// Parses configuration from a TOML string. Environment variables are
/// resolved and the configuration is validated after parsing.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
