//! Core state machine
//!
//! The audio core moves through a fixed set of states; every public
//! operation names the states it may be called from and fails with
//! `InvalidState` otherwise, rather than relying on incidental flag values.
//!
//! Control-thread operations transition the state under the session lock.
//! The Prefilling → Warmup → Playing promotions are made by the cycle
//! callback through the shared atomic cell, so observers always see the
//! live state without taking a lock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// Audio core lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreState {
    /// No session, no resources
    Disabled = 0,
    /// Sink discovered, session open, idle
    Enabled = 1,
    /// Configuring format, negotiating, connecting
    Opening = 2,
    /// Emitting silence until buffered bytes reach the prefill target
    Prefilling = 3,
    /// Target online; emitting silence cycles while its clock settles
    Warmup = 4,
    /// Popping real audio each cycle
    Playing = 5,
    /// Consumer emits silence; ring is cleared on resume
    Paused = 6,
    /// Producer stopped; trailing silence cycles on the way out
    Draining = 7,
    /// Mid-session format change; ring torn down, sink reconfigured
    Reopening = 8,
}

impl CoreState {
    pub fn from_u8(v: u8) -> CoreState {
        match v {
            1 => CoreState::Enabled,
            2 => CoreState::Opening,
            3 => CoreState::Prefilling,
            4 => CoreState::Warmup,
            5 => CoreState::Playing,
            6 => CoreState::Paused,
            7 => CoreState::Draining,
            8 => CoreState::Reopening,
            _ => CoreState::Disabled,
        }
    }

    /// True for every state with an open sink session
    pub fn session_open(self) -> bool {
        self != CoreState::Disabled
    }

    /// True for the states where a track is open on the sink
    pub fn track_open(self) -> bool {
        matches!(
            self,
            CoreState::Prefilling
                | CoreState::Warmup
                | CoreState::Playing
                | CoreState::Paused
                | CoreState::Reopening
        )
    }
}

impl std::fmt::Display for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoreState::Disabled => "disabled",
            CoreState::Enabled => "enabled",
            CoreState::Opening => "opening",
            CoreState::Prefilling => "prefilling",
            CoreState::Warmup => "warmup",
            CoreState::Playing => "playing",
            CoreState::Paused => "paused",
            CoreState::Draining => "draining",
            CoreState::Reopening => "reopening",
        };
        f.write_str(s)
    }
}

/// Lock-free state cell shared between the control thread and the cycle
/// callback
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: CoreState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> CoreState {
        CoreState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: CoreState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition after asserting the current state is in `from`.
    pub fn transition(&self, from: &[CoreState], to: CoreState) -> Result<()> {
        let current = self.get();
        if !from.contains(&current) {
            return Err(Error::InvalidState(format!(
                "cannot enter {to} from {current}"
            )));
        }
        self.set(to);
        Ok(())
    }

    /// Promote `from` → `to` only if the cell still holds `from`. Used by
    /// the cycle callback so it never fights a control-thread transition.
    pub fn promote(&self, from: CoreState, to: CoreState) -> bool {
        self.0
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Transport state as presented at the control-protocol boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    NoMediaPresent,
    Stopped,
    Transitioning,
    Playing,
    PausedPlayback,
}

impl From<CoreState> for TransportState {
    fn from(state: CoreState) -> Self {
        match state {
            CoreState::Disabled => TransportState::NoMediaPresent,
            CoreState::Enabled | CoreState::Draining => TransportState::Stopped,
            CoreState::Opening | CoreState::Prefilling | CoreState::Warmup
            | CoreState::Reopening => TransportState::Transitioning,
            CoreState::Playing => TransportState::Playing,
            CoreState::Paused => TransportState::PausedPlayback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejects_wrong_source() {
        let cell = StateCell::new(CoreState::Disabled);
        let err = cell
            .transition(&[CoreState::Enabled], CoreState::Opening)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(cell.get(), CoreState::Disabled);

        cell.transition(&[CoreState::Disabled], CoreState::Enabled)
            .unwrap();
        assert_eq!(cell.get(), CoreState::Enabled);
    }

    #[test]
    fn promote_only_from_expected_state() {
        let cell = StateCell::new(CoreState::Prefilling);
        assert!(cell.promote(CoreState::Prefilling, CoreState::Warmup));
        assert!(!cell.promote(CoreState::Prefilling, CoreState::Warmup));
        assert_eq!(cell.get(), CoreState::Warmup);
    }

    #[test]
    fn transport_state_mapping() {
        assert_eq!(TransportState::from(CoreState::Playing), TransportState::Playing);
        assert_eq!(TransportState::from(CoreState::Warmup), TransportState::Transitioning);
        assert_eq!(TransportState::from(CoreState::Draining), TransportState::Stopped);
    }

    #[test]
    fn roundtrip_u8() {
        for s in [
            CoreState::Disabled,
            CoreState::Enabled,
            CoreState::Opening,
            CoreState::Prefilling,
            CoreState::Warmup,
            CoreState::Playing,
            CoreState::Paused,
            CoreState::Draining,
            CoreState::Reopening,
        ] {
            assert_eq!(CoreState::from_u8(s as u8), s);
        }
    }
}
