//! Sink transport boundary
//!
//! The synchronous LAN transport is a vendored black box; the audio core
//! depends only on the [`SinkTransport`] trait defined here. The trait
//! mirrors the transport's real surface: discovery, path-MTU probing, the
//! session lifecycle, wire-format negotiation, the four-phase connection
//! handshake, and the periodic cycle callback through which all audio
//! flows.
//!
//! The cycle callback contract is strict: the transport invokes it once per
//! cycle from its own thread and the callback must fill the buffer and
//! return promptly, every time. Everything above this seam is built around
//! never violating that.

pub mod loopback;
pub mod retry;

use std::time::Duration;

use serde::Serialize;

use crate::engine::format::{DsdEndian, DsdSourceOrder, SinkCapabilities};
use crate::error::Result;

/// A sink reachable on the LAN
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    /// Position in the discovery result set
    pub index: usize,
    pub name: String,
    /// Output/port label when the target exposes several (I2S vs USB, etc.)
    pub output_name: Option<String>,
    pub version: String,
    pub product_id: u32,
}

/// Concrete wire format offered to the sink during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatDescriptor {
    Pcm {
        rate: u32,
        channels: u8,
        bits: u8,
    },
    Dsd {
        bit_rate: u32,
        channels: u8,
        bit_order: DsdSourceOrder,
        endian: DsdEndian,
    },
    /// Minimal DSD descriptor for sinks that only advertise base DSD
    /// support; the wire is assumed LSB-first big-endian.
    DsdMinimal {
        bit_rate: u32,
        channels: u8,
    },
}

/// Session parameters passed to `open_session`
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub thread_mode: u8,
    pub cycle_time: Duration,
    pub client_name: String,
    pub client_id: u32,
}

/// Transfer pacing mode applied after format negotiation
///
/// `Auto` resolves to `VarAuto` for DSD and low-bitrate PCM streams and
/// `VarMax` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Auto,
    FixAuto,
    VarAuto,
    VarMax,
}

/// Callback the transport invokes once per cycle. Must fill the whole
/// buffer before returning.
pub type CycleCallback = Box<dyn FnMut(&mut [u8]) + Send>;

/// Operations the audio core requires from the vendored transport.
///
/// Lifecycle calls are never issued concurrently (the core serialises them
/// under its session lock); `is_online` may be called from any thread.
pub trait SinkTransport: Send {
    /// Enumerate sinks reachable on the LAN
    fn discover(&mut self) -> Result<Vec<Target>>;

    /// Probe the path MTU to a target; the caller supplies a fallback when
    /// this fails.
    fn measure_mtu(&mut self, target: &Target) -> Result<u32>;

    fn open_session(&mut self, options: &SessionOptions) -> Result<()>;
    fn close_session(&mut self);

    fn query_capabilities(&mut self, target: &Target) -> Result<SinkCapabilities>;

    /// Probe whether the sink supports a wire format. Local check against
    /// the capability matrix fetched at session open; does not touch the
    /// sink.
    fn check_format(&mut self, descriptor: &FormatDescriptor) -> bool;

    /// Programme the sink with an accepted wire format. `Ok(false)` means
    /// the sink declined the configure call (retryable); `Err` means the
    /// transport itself failed.
    fn set_sink_format(
        &mut self,
        target: &Target,
        descriptor: &FormatDescriptor,
        cycle_time: Duration,
        mtu: u32,
    ) -> Result<bool>;

    fn apply_transfer_mode(&mut self, mode: TransferMode, cycle_time: Duration);

    /// Four-phase connection handshake; kept separate so the sink can
    /// pre-allocate before traffic starts.
    fn connect_prepare(&mut self) -> Result<()>;
    fn connect(&mut self) -> Result<()>;
    fn connect_wait(&mut self) -> Result<()>;
    fn disconnect(&mut self, wait: bool);

    fn play(&mut self);
    fn stop(&mut self);
    fn is_online(&self) -> bool;

    /// Install the per-cycle callback. The transport calls it with a buffer
    /// of exactly the negotiated per-cycle size.
    fn register_cycle_callback(&mut self, callback: CycleCallback);
}

impl TransferMode {
    /// Resolve `Auto` against the stream characteristics
    pub fn resolve(self, is_dsd: bool, low_bitrate: bool) -> TransferMode {
        match self {
            TransferMode::Auto => {
                if is_dsd || low_bitrate {
                    TransferMode::VarAuto
                } else {
                    TransferMode::VarMax
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_transfer_mode_resolution() {
        assert_eq!(TransferMode::Auto.resolve(true, false), TransferMode::VarAuto);
        assert_eq!(TransferMode::Auto.resolve(false, true), TransferMode::VarAuto);
        assert_eq!(TransferMode::Auto.resolve(false, false), TransferMode::VarMax);
        assert_eq!(TransferMode::FixAuto.resolve(true, true), TransferMode::FixAuto);
    }
}
