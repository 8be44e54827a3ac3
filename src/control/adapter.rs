//! Control command adapter
//!
//! Translates control-protocol commands into audio-core operations and
//! keeps the track bookkeeping (current URI, queued next URI for gapless,
//! track epoch). The media-fetch/decode pipeline is an external
//! collaborator: it subscribes to [`RendererEvent::TrackChanged`], opens
//! the core with the decoded format and pushes samples; the adapter never
//! touches audio data.
//!
//! The track epoch increments on every track change. The slow position
//! reporter snapshots it around each poll and discards writes that raced
//! with a gapless transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::state::TransportState;
use crate::engine::AudioCore;
use crate::events::{EventBus, RendererEvent};

/// Commands accepted from the control protocol
#[derive(Debug)]
pub enum ControlCommand {
    SetUri { uri: String, metadata: String },
    SetNextUri { uri: String, metadata: String },
    Play,
    Pause,
    Stop,
    Seek { target_seconds: u64 },
    GetTransportInfo { reply: oneshot::Sender<TransportInfo> },
    GetPositionInfo { reply: oneshot::Sender<PositionInfo> },
    GetMediaInfo { reply: oneshot::Sender<MediaInfo> },
    /// Upstream decoder reached end of track
    TrackEnded,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportInfo {
    pub state: TransportState,
    pub status: &'static str,
    pub speed: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionInfo {
    pub uri: String,
    pub epoch: u64,
    pub position_seconds: u64,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub uri: String,
    pub metadata: String,
    pub next_uri: String,
    pub next_metadata: String,
}

#[derive(Debug, Default)]
struct TrackState {
    uri: String,
    metadata: String,
    next_uri: Option<String>,
    next_metadata: Option<String>,
    duration_seconds: u64,
}

/// The adapter proper; owns the track state and runs the command loop
pub struct ControlAdapter {
    core: Arc<AudioCore>,
    events: EventBus,
    epoch: Arc<AtomicU64>,
    track: Mutex<TrackState>,
    gapless: bool,
}

/// Cloneable handle for submitting commands
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    pub async fn send(&self, command: ControlCommand) {
        if self.tx.send(command).await.is_err() {
            warn!("control adapter is gone");
        }
    }

    pub async fn transport_info(&self) -> Option<TransportInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::GetTransportInfo { reply }).await;
        rx.await.ok()
    }

    pub async fn position_info(&self) -> Option<PositionInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::GetPositionInfo { reply }).await;
        rx.await.ok()
    }

    pub async fn media_info(&self) -> Option<MediaInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::GetMediaInfo { reply }).await;
        rx.await.ok()
    }
}

impl ControlAdapter {
    pub fn new(core: Arc<AudioCore>, events: EventBus, gapless: bool) -> Self {
        Self {
            core,
            events,
            epoch: Arc::new(AtomicU64::new(0)),
            track: Mutex::new(TrackState::default()),
            gapless,
        }
    }

    /// Track epoch cell, shared with the position reporter
    pub fn epoch(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.epoch)
    }

    /// Spawn the command loop; returns the submission handle.
    pub fn spawn(self: Arc<Self>) -> ControlHandle {
        let (tx, mut rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                self.handle(command).await;
            }
            debug!("control command loop ended");
        });
        ControlHandle { tx }
    }

    async fn handle(&self, command: ControlCommand) {
        match command {
            ControlCommand::SetUri { uri, metadata } => {
                info!(%uri, "SetUri");
                {
                    let mut track = self.track.lock().unwrap();
                    track.uri = uri.clone();
                    track.metadata = metadata;
                    track.next_uri = None;
                    track.next_metadata = None;
                }
                let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                self.events.emit(RendererEvent::TrackChanged {
                    uri,
                    epoch,
                    gapless: false,
                    timestamp: chrono::Utc::now(),
                });
            }
            ControlCommand::SetNextUri { uri, metadata } => {
                debug!(%uri, "SetNextUri");
                let mut track = self.track.lock().unwrap();
                track.next_uri = Some(uri);
                track.next_metadata = Some(metadata);
            }
            ControlCommand::Play => {
                let core = Arc::clone(&self.core);
                let result = tokio::task::spawn_blocking(move || core.play()).await;
                match result {
                    Ok(Ok(())) => self.emit_state(),
                    Ok(Err(e)) => debug!(error = %e, "play deferred until a track is open"),
                    Err(e) => warn!(error = %e, "play task failed"),
                }
            }
            ControlCommand::Pause => {
                let core = Arc::clone(&self.core);
                if tokio::task::spawn_blocking(move || core.pause()).await.is_ok() {
                    self.emit_state();
                }
            }
            ControlCommand::Stop => {
                let core = Arc::clone(&self.core);
                if tokio::task::spawn_blocking(move || core.stop(false)).await.is_ok() {
                    self.emit_state();
                }
            }
            ControlCommand::Seek { target_seconds } => {
                debug!(target_seconds, "Seek");
                // Repositioning happens upstream in the decode pipeline;
                // here the stale buffered audio is dropped so the seek is
                // audible immediately.
                self.core.flush();
                let epoch = self.epoch.load(Ordering::Acquire);
                self.events.emit(RendererEvent::PositionChanged {
                    epoch,
                    position_seconds: target_seconds,
                    timestamp: chrono::Utc::now(),
                });
            }
            ControlCommand::GetTransportInfo { reply } => {
                let info = TransportInfo {
                    state: TransportState::from(self.core.state()),
                    status: "OK",
                    speed: 1,
                };
                let _ = reply.send(info);
            }
            ControlCommand::GetPositionInfo { reply } => {
                let track = self.track.lock().unwrap();
                let info = PositionInfo {
                    uri: track.uri.clone(),
                    epoch: self.epoch.load(Ordering::Acquire),
                    position_seconds: self.core.position_seconds(),
                    duration_seconds: track.duration_seconds,
                };
                let _ = reply.send(info);
            }
            ControlCommand::GetMediaInfo { reply } => {
                let track = self.track.lock().unwrap();
                let info = MediaInfo {
                    uri: track.uri.clone(),
                    metadata: track.metadata.clone(),
                    next_uri: track.next_uri.clone().unwrap_or_default(),
                    next_metadata: track.next_metadata.clone().unwrap_or_default(),
                };
                let _ = reply.send(info);
            }
            ControlCommand::TrackEnded => self.track_ended().await,
        }
    }

    /// End of track: advance to the queued next URI (gapless) or stop.
    async fn track_ended(&self) {
        let next = {
            let mut track = self.track.lock().unwrap();
            match (self.gapless, track.next_uri.take()) {
                (true, Some(uri)) => {
                    let metadata = track.next_metadata.take().unwrap_or_default();
                    track.uri = uri.clone();
                    track.metadata = metadata;
                    Some(uri)
                }
                (_, leftover) => {
                    track.next_uri = leftover;
                    None
                }
            }
        };

        match next {
            Some(uri) => {
                let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                info!(%uri, epoch, "gapless advance");
                self.events.emit(RendererEvent::TrackChanged {
                    uri,
                    epoch,
                    gapless: true,
                    timestamp: chrono::Utc::now(),
                });
                // The decode pipeline reopens the core with the next
                // track's format; a matching format takes the fast path,
                // which is what makes the transition gapless.
            }
            None => {
                info!("end of track, no next URI queued");
                let core = Arc::clone(&self.core);
                let _ = tokio::task::spawn_blocking(move || core.stop(false)).await;
                self.emit_state();
            }
        }
    }

    fn emit_state(&self) {
        self.events.emit(RendererEvent::TransportStateChanged {
            state: TransportState::from(self.core.state()),
            timestamp: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use crate::sink::loopback::LoopbackSink;

    fn adapter_fixture() -> (Arc<ControlAdapter>, ControlHandle, tokio::sync::broadcast::Receiver<RendererEvent>) {
        let (sink, _handle) = LoopbackSink::new(false);
        let core = Arc::new(AudioCore::new(Box::new(sink), RendererConfig::default()));
        let events = EventBus::new(16);
        let rx = events.subscribe();
        let adapter = Arc::new(ControlAdapter::new(core, events, true));
        let handle = Arc::clone(&adapter).spawn();
        (adapter, handle, rx)
    }

    #[tokio::test]
    async fn set_uri_bumps_epoch_and_emits() {
        let (adapter, handle, mut rx) = adapter_fixture();
        handle
            .send(ControlCommand::SetUri {
                uri: "http://server/a.flac".into(),
                metadata: String::new(),
            })
            .await;

        match rx.recv().await.unwrap() {
            RendererEvent::TrackChanged { uri, epoch, gapless, .. } => {
                assert_eq!(uri, "http://server/a.flac");
                assert_eq!(epoch, 1);
                assert!(!gapless);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(adapter.epoch.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn gapless_advance_promotes_next_uri() {
        let (adapter, handle, mut rx) = adapter_fixture();
        handle
            .send(ControlCommand::SetUri { uri: "a".into(), metadata: String::new() })
            .await;
        handle
            .send(ControlCommand::SetNextUri { uri: "b".into(), metadata: String::new() })
            .await;
        handle.send(ControlCommand::TrackEnded).await;

        // First event: SetUri's TrackChanged
        let _ = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            RendererEvent::TrackChanged { uri, epoch, gapless, .. } => {
                assert_eq!(uri, "b");
                assert_eq!(epoch, 2);
                assert!(gapless);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let media = handle.media_info().await.unwrap();
        assert_eq!(media.uri, "b");
        assert!(media.next_uri.is_empty());
        let _ = adapter;
    }

    #[tokio::test]
    async fn transport_info_reflects_core_state() {
        let (_adapter, handle, _rx) = adapter_fixture();
        let info = handle.transport_info().await.unwrap();
        assert_eq!(info.state, TransportState::NoMediaPresent);
        assert_eq!(info.status, "OK");
    }
}
