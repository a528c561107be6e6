//! Host events broadcast to subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use super::PluginHost;

/// Capacity of the event channel; slow subscribers observe `Lagged`.
pub(crate) const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    PluginLoaded { id: String, name: String },
    PluginUnloaded { id: String, name: String },
    PluginInstalled { name: String },
    ServiceRegistered { provider: String, id: String },
    ServiceUnregistered { provider: String, id: String },
    OpRegistered { key: String },
    /// A user-facing message.
    Message { text: String },
}

impl PluginHost {
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: HostEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Show a message to the user.
    pub fn show_message(&self, text: impl Into<String>) {
        let text = text.into();
        info!(message = %text, "host message");
        self.emit(HostEvent::Message { text });
    }
}
