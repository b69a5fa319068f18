//! Event bus for broadcasting lifecycle events.
//!
//! Built on a tokio broadcast channel: every subscriber receives every event
//! published after it subscribed. Publishing never blocks, and a bus without
//! subscribers simply drops events.

use repartidev_types::EngineEvent;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 1000;

/// Broadcast channel for engine events.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
	/// Creates a bus buffering up to `capacity` events per slow subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Returns a receiver for events published from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event to every subscriber.
	///
	/// Returns an error when nobody is listening; callers usually ignore it.
	pub fn publish(
		&self,
		event: EngineEvent,
	) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
		self.sender.send(event)
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_CAPACITY)
	}
}
