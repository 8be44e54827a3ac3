//! Cycle-period and per-cycle payload math
//!
//! Pure functions from (sample rate, channels, bits, MTU) to the sink's
//! cycle period and the byte count every cycle must carry. Programmed into
//! the transport on every open.

/// Transport header overhead subtracted from the path MTU
const TRANSPORT_OVERHEAD: u32 = 24;

/// Cycle periods are negotiated in steps of this quantum
const CYCLE_QUANTUM_US: u32 = 100;

/// Practical period range the sink accepts
const MIN_CYCLE_US: u32 = 1_000;
const MAX_CYCLE_US: u32 = 100_000;

/// Minimum per-cycle payload, regardless of format
const MIN_CYCLE_BYTES: usize = 64;

/// Cycle parameter calculator, fixed to the session's effective MTU
#[derive(Debug, Clone, Copy)]
pub struct CycleCalculator {
    mtu: u32,
}

impl CycleCalculator {
    pub fn new(mtu: u32) -> Self {
        Self { mtu }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Payload bytes available per cycle after transport overhead
    pub fn payload_per_cycle(&self) -> u32 {
        self.mtu.saturating_sub(TRANSPORT_OVERHEAD).max(1)
    }

    /// Cycle period in microseconds for the given stream parameters.
    ///
    /// For DSD, pass the bit rate with `bits = 1`. The raw period (payload
    /// transit time at the stream byte rate) is rounded to the nearest
    /// quantum and clamped to the sink's accepted range.
    pub fn cycle_time_us(&self, rate: u32, channels: u8, bits: u8) -> u32 {
        let bytes_per_second =
            (rate as u64 * channels as u64 * bits as u64 / 8).max(1);
        let raw =
            (self.payload_per_cycle() as u64 * 1_000_000 / bytes_per_second) as u32;
        let quantized =
            ((raw + CYCLE_QUANTUM_US / 2) / CYCLE_QUANTUM_US) * CYCLE_QUANTUM_US;
        quantized.clamp(MIN_CYCLE_US, MAX_CYCLE_US)
    }

    /// Per-cycle byte target for PCM: ~1 ms of audio, whole frames,
    /// rounded up.
    pub fn pcm_bytes_per_cycle(rate: u32, channels: u8, wire_bytes_per_sample: usize) -> usize {
        let frames_per_ms = ((rate + 999) / 1000) as usize;
        (frames_per_ms * channels as usize * wire_bytes_per_sample).max(MIN_CYCLE_BYTES)
    }

    /// Per-cycle byte target for DSD: ~1 ms of the byte rate, rounded up to
    /// whole 32-bit channel-word groups.
    pub fn dsd_bytes_per_cycle(byte_rate: u32, channels: u8) -> usize {
        let group = 4 * channels as usize;
        let per_ms = (byte_rate / 1000) as usize * channels as usize;
        let rounded = per_ms.div_ceil(group) * group;
        rounded.max(MIN_CYCLE_BYTES)
    }
}
