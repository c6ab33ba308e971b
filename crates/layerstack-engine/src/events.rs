//! Event types for observing a layer
//!
//! Events are sent from the scheduler, executor and adapters to any
//! consumer (a UI, a log shipper, a test) to report runs, node changes,
//! import activity and action transitions.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Trait for sending layer events
///
/// This abstracts over the transport mechanism (mpsc, websocket, etc.)
/// so the engine does not depend on any particular consumer.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: LayerEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted by a layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LayerEvent {
    /// A run cycle started
    #[serde(rename_all = "camelCase")]
    RunStarted { run_id: String, triggers: Vec<String> },

    /// A run cycle finished
    #[serde(rename_all = "camelCase")]
    RunCompleted {
        run_id: String,
        invoked: usize,
        changed: usize,
        failed: usize,
        duration_ms: u64,
    },

    /// A node was recomputed
    #[serde(rename_all = "camelCase")]
    NodeComputed {
        node: String,
        version: u64,
        changed: bool,
    },

    /// A node became failed
    #[serde(rename_all = "camelCase")]
    NodeFailed { node: String, reason: String },

    /// An import node received a new remote value
    #[serde(rename_all = "camelCase")]
    ImportUpdated {
        node: String,
        remote_version: u64,
        fingerprint: String,
    },

    /// A poll of the remote layer failed
    #[serde(rename_all = "camelCase")]
    ImportUnreachable {
        node: String,
        consecutive_failures: u32,
        error: String,
    },

    /// A plan node proposed a new action
    #[serde(rename_all = "camelCase")]
    ActionProposed {
        action_id: String,
        plan: String,
        target: String,
    },

    /// An action was applied
    #[serde(rename_all = "camelCase")]
    ActionApplied { action_id: String },

    /// An action was discarded or refused
    #[serde(rename_all = "camelCase")]
    ActionRejected { action_id: String, reason: String },
}

impl LayerEvent {
    /// Create a node failed event
    pub fn node_failed(node: &str, reason: impl std::fmt::Display) -> Self {
        Self::NodeFailed {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an action rejected event
    pub fn action_rejected(action_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::ActionRejected {
            action_id: action_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: LayerEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<LayerEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<LayerEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: LayerEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<LayerEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LayerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: LayerEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}

/// Send an event, logging instead of failing when the sink is gone
pub(crate) fn emit(sink: &dyn EventSink, event: LayerEvent) {
    if let Err(e) = sink.send(event) {
        log::trace!("Dropped layer event: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_event_sink() {
        let sink = VecEventSink::new();

        sink.send(LayerEvent::node_failed("b", "boom")).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);

        match &events[0] {
            LayerEvent::NodeFailed { node, reason } => {
                assert_eq!(node, "b");
                assert_eq!(reason, "boom");
            }
            _ => panic!("Expected NodeFailed event"),
        }

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_null_event_sink() {
        let sink = NullEventSink;
        // Should not panic
        sink.send(LayerEvent::action_rejected("a1", "stale")).unwrap();
    }

    #[tokio::test]
    async fn test_channel_event_sink() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.send(LayerEvent::ActionApplied {
            action_id: "a1".into(),
        })
        .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LayerEvent::ActionApplied {
                action_id: "a1".into()
            })
        );

        drop(rx);
        assert!(sink
            .send(LayerEvent::ActionApplied {
                action_id: "a2".into()
            })
            .is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let event = LayerEvent::NodeComputed {
            node: "b".into(),
            version: 2,
            changed: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "nodeComputed");
        assert_eq!(json["version"], 2);
    }
}
