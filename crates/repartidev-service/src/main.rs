//! Main entry point for the Repartidev delivery service.
//!
//! Loads the configuration, builds the delivery engine over the configured
//! storage backend and serves the HTTP API until interrupted.

use clap::Parser;
use repartidev_config::Config;
use repartidev_core::{DeliveryEngine, EngineBuilder, EngineFactories, EventBus};
use repartidev_types::{EngineEvent, OrderEvent, UserEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

mod apis;
mod server;

/// Command-line arguments for the delivery service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started repartidev");

	let config = Config::from_file(&args.config).await?;
	tracing::info!("Loaded configuration [{}]", config.service.id);

	let engine = Arc::new(build_engine(config.clone()).await?);
	spawn_event_logger(engine.event_bus());

	match config.api.clone().filter(|api| api.enabled) {
		Some(api_config) => {
			tokio::select! {
				result = server::start_server(api_config, Arc::clone(&engine)) => {
					tracing::info!("API server finished");
					result?;
				}
				_ = tokio::signal::ctrl_c() => {
					tracing::info!("Interrupted");
				}
			}
		},
		None => {
			tracing::warn!("API disabled, nothing to serve");
		},
	}

	tracing::info!("Stopped repartidev");
	Ok(())
}

/// Builds the engine with every storage backend this binary ships.
async fn build_engine(config: Config) -> Result<DeliveryEngine, Box<dyn std::error::Error>> {
	let factories = EngineFactories {
		storage_factories: repartidev_storage::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect(),
	};

	Ok(EngineBuilder::new(config).build(factories).await?)
}

/// Logs every lifecycle event published by the engine.
fn spawn_event_logger(bus: &EventBus) {
	let mut receiver = bus.subscribe();
	tokio::spawn(async move {
		loop {
			match receiver.recv().await {
				Ok(event) => log_event(&event),
				Err(RecvError::Lagged(skipped)) => {
					tracing::warn!(skipped, "Event logger fell behind");
				},
				Err(RecvError::Closed) => break,
			}
		}
	});
}

fn log_event(event: &EngineEvent) {
	match event {
		EngineEvent::Order(OrderEvent::Created { order }) => {
			tracing::info!(target: "repartidev::events", order_id = %order.id, amount = %order.amount, "order created");
		},
		EngineEvent::Order(OrderEvent::Transitioned {
			order_id,
			action,
			from,
			to,
			..
		}) => {
			tracing::info!(target: "repartidev::events", order_id = %order_id, action = %action, from = %from, to = %to, "order transitioned");
		},
		EngineEvent::Order(OrderEvent::Deleted { order_id, .. }) => {
			tracing::info!(target: "repartidev::events", order_id = %order_id, "order deleted");
		},
		EngineEvent::Order(OrderEvent::Reviewed { review }) => {
			tracing::info!(target: "repartidev::events", order_id = %review.order_id, rating = review.rating, "order reviewed");
		},
		EngineEvent::User(UserEvent::Registered { user_id, role }) => {
			tracing::info!(target: "repartidev::events", user_id = %user_id, role = %role, "user registered");
		},
		EngineEvent::User(UserEvent::RoleChanged { user_id, role }) => {
			tracing::info!(target: "repartidev::events", user_id = %user_id, role = %role, "role changed");
		},
		EngineEvent::User(UserEvent::AvailabilityChanged { user_id, available }) => {
			tracing::info!(target: "repartidev::events", user_id = %user_id, available, "availability changed");
		},
		EngineEvent::User(UserEvent::Rated {
			user_id,
			rating_average,
			rating_count,
		}) => {
			tracing::debug!(target: "repartidev::events", user_id = %user_id, rating_average, rating_count, "rating updated");
		},
	}
}
