//! Position reporter
//!
//! Polls the audio core about once a second and publishes position events.
//! The poll races with gapless track transitions, so every write is
//! bracketed by epoch snapshots: if the epoch moved while the position was
//! being read, the value belongs to the previous track and is discarded.
//!
//! The reporter doubles as the offline watchdog: a transport that stays
//! offline across consecutive polls while audio should be flowing is
//! escalated to a stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::engine::{AudioCore, CoreState};
use crate::events::{EventBus, RendererEvent};

/// Consecutive offline polls tolerated before playback is stopped
const OFFLINE_POLL_LIMIT: u32 = 3;

/// Run the reporter until the core is disabled. Spawn with `tokio::spawn`.
pub async fn run(core: Arc<AudioCore>, events: EventBus, epoch: Arc<AtomicU64>) {
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut offline_polls = 0u32;

    loop {
        ticker.tick().await;

        let state = core.state();
        if state == CoreState::Disabled {
            debug!("position reporter stopping, core disabled");
            return;
        }
        if state != CoreState::Playing {
            offline_polls = 0;
            continue;
        }

        // Offline watchdog: underruns already cover short dropouts, a
        // persistent dead link gets escalated here
        if !core.refresh_online() {
            offline_polls += 1;
            if offline_polls >= OFFLINE_POLL_LIMIT {
                warn!("transport offline, stopping playback");
                let stop_core = Arc::clone(&core);
                let _ = tokio::task::spawn_blocking(move || stop_core.stop(true)).await;
                offline_polls = 0;
            }
            continue;
        }
        offline_polls = 0;

        let before = epoch.load(Ordering::Acquire);
        let position_seconds = core.position_seconds();
        let after = epoch.load(Ordering::Acquire);
        if before != after {
            // Raced with a track change; this position belongs to the old
            // track
            debug!(before, after, "discarding stale position sample");
            continue;
        }

        events.emit(RendererEvent::PositionChanged {
            epoch: after,
            position_seconds,
            timestamp: chrono::Utc::now(),
        });
    }
}
