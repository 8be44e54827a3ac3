//! Error types for resona
//!
//! Defines renderer-specific error types using thiserror for clear error
//! propagation.
//!
//! Per-cycle faults (underruns, late buffers) are never surfaced as errors:
//! the cycle callback must always return a buffer, so those paths count and
//! emit silence instead. Only session-level faults appear here.

use thiserror::Error;

/// Main error type for resona
#[derive(Error, Debug)]
pub enum Error {
    /// Sink discovery returned no reachable targets
    #[error("no sink found on the network")]
    NoSinkFound,

    /// Requested target index is out of range for the discovered set
    #[error("target index {index} out of range ({found} target(s) found)")]
    TargetIndexOutOfRange { index: usize, found: usize },

    /// Transport rejected open_session after all retries. Fatal to enable().
    #[error("sink session open failed after {attempts} attempt(s)")]
    SessionOpenFailed { attempts: u32 },

    /// No wire bit-depth / DSD descriptor accepted for the requested format.
    /// Per-track and recoverable: the caller may skip the track.
    #[error("sink accepted no wire format for {rate}Hz/{bits}bit/{channels}ch {kind}")]
    UnsupportedFormat {
        rate: u32,
        bits: u8,
        channels: u8,
        kind: &'static str,
    },

    /// Mid-session reopen failed; playback stops and the session returns to
    /// the enabled-idle state.
    #[error("sink reconnect failed: {0}")]
    ReconnectFailed(String),

    /// Transport went offline mid-play and did not come back within the
    /// configured timeout.
    #[error("sink transport offline")]
    TransportOffline,

    /// Operation invoked from a state that does not permit it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transport-level failure outside the dedicated variants
    #[error("sink transport error: {0}")]
    Transport(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using resona Error
pub type Result<T> = std::result::Result<T, Error>;
