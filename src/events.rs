//! Event system for the renderer
//!
//! # Architecture
//!
//! Resona uses hybrid communication:
//! - **EventBus** (tokio::broadcast): one-to-many event broadcasting toward
//!   the control-protocol boundary
//! - **Command channels** (tokio::mpsc): control command → single handler
//! - **Shared atomics**: high-frequency producer/consumer coordination
//!
//! State events are edge-driven (emitted on transition); position events are
//! emitted by the slow position reporter.

use serde::{Deserialize, Serialize};

use crate::engine::format::AudioFormat;
use crate::engine::state::TransportState;

/// Events emitted toward the control-protocol boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RendererEvent {
    /// Transport state changed (edge-driven)
    TransportStateChanged {
        state: TransportState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Current track changed (SetUri or gapless advance)
    TrackChanged {
        uri: String,
        /// Track epoch after the change; position writes carrying an older
        /// epoch are stale
        epoch: u64,
        gapless: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Periodic position update (~1 s cadence while playing)
    PositionChanged {
        epoch: u64,
        position_seconds: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track was opened with the given format
    FormatOpened {
        format: AudioFormat,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for renderer events
///
/// Thin wrapper over `tokio::sync::broadcast`; send never blocks, slow
/// subscribers drop events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RendererEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Returns the number of subscribers that received it;
    /// zero subscribers is not an error.
    pub fn emit(&self, event: RendererEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RendererEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_tag() {
        let ev = RendererEvent::TrackChanged {
            uri: "http://server/track.flac".into(),
            epoch: 3,
            gapless: false,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"TrackChanged\""));
        assert!(json.contains("\"epoch\":3"));
    }

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(RendererEvent::PositionChanged {
            epoch: 1,
            position_seconds: 42,
            timestamp: chrono::Utc::now(),
        });
        match rx.recv().await.unwrap() {
            RendererEvent::PositionChanged { position_seconds, .. } => {
                assert_eq!(position_seconds, 42)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
