//! Audio format descriptions and wire-format negotiation results
//!
//! [`AudioFormat`] describes what the upstream decoder delivers;
//! [`NegotiatedFormat`] records what the sink accepted and which conversion
//! the push path must apply to get from one to the other.

use serde::{Deserialize, Serialize};

/// DSD64 bit rate: 64x the CD sample rate, in bits per second per channel.
/// Higher DSD rates are integer multiples of this (in the 44.1 kHz family).
pub const DSD64_RATE: u32 = 2_822_400;

/// Bit order of DSD bytes as delivered by the upstream container
///
/// DSF files carry LSB-first bytes, DFF files MSB-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsdSourceOrder {
    Lsb,
    Msb,
}

/// Byte order of the 32-bit sink word for DSD wire formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsdEndian {
    Big,
    Little,
}

/// Track format as delivered by the upstream decoder
///
/// For DSD, `sample_rate` is the bit rate (2 822 400 for DSD64) and
/// `bit_depth` is 1. For PCM, 24-bit samples arrive in 32-bit containers
/// (S24-in-32) with the high byte ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    pub is_dsd: bool,
    pub dsd_source_order: DsdSourceOrder,
}

impl AudioFormat {
    pub fn pcm(sample_rate: u32, bit_depth: u8, channels: u8) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
            is_dsd: false,
            dsd_source_order: DsdSourceOrder::Lsb,
        }
    }

    pub fn dsd(bit_rate: u32, channels: u8, order: DsdSourceOrder) -> Self {
        Self {
            sample_rate: bit_rate,
            bit_depth: 1,
            channels,
            is_dsd: true,
            dsd_source_order: order,
        }
    }

    /// DSD rate multiplier relative to DSD64 (DSD64 → 1, DSD512 → 8).
    /// Returns at least 1 so warmup scaling never collapses to zero.
    pub fn dsd_multiplier(&self) -> u32 {
        (self.sample_rate / DSD64_RATE).max(1)
    }

    /// DSD byte rate per channel (the bit rate packs 8 bits per byte)
    pub fn dsd_byte_rate(&self) -> u32 {
        self.sample_rate / 8
    }

    /// Bytes per frame as delivered by upstream (all channels).
    ///
    /// PCM 24-bit counts as 4 (S24-in-32 container); DSD counts one byte per
    /// channel per frame (a frame here is one 8-bit chunk per channel).
    pub fn input_bytes_per_frame(&self) -> usize {
        if self.is_dsd {
            self.channels as usize
        } else {
            let container = if self.bit_depth == 16 { 2 } else { 4 };
            container * self.channels as usize
        }
    }

    /// True when the two formats are in different DAC clock-rate domains,
    /// forcing a full session reopen on transition.
    pub fn rate_domain_differs(&self, other: &AudioFormat) -> bool {
        self.is_dsd != other.is_dsd || self.sample_rate != other.sample_rate
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dsd {
            write!(
                f,
                "DSD{} ({}Hz) {}ch {:?}",
                self.dsd_multiplier() * 64,
                self.sample_rate,
                self.channels,
                self.dsd_source_order
            )
        } else {
            write!(
                f,
                "{}Hz/{}bit/{}ch PCM",
                self.sample_rate, self.bit_depth, self.channels
            )
        }
    }
}

/// Sink capability summary, queried once per session and re-queried after a
/// full reopen. Individual (rate, channels, bits) combinations are still
/// probed through the transport; this summary drives logging and the DSD
/// descriptor fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkCapabilities {
    pub supports_pcm: bool,
    pub supports_dsd: bool,
    pub dsd_lsb: bool,
    pub dsd_msb: bool,
    pub dsd_big: bool,
    pub dsd_little: bool,
}

/// Precomposed DSD conversion selector for the push hot loop
///
/// Composes "source bit order != wire bit order" and "wire word is
/// little-endian" into one branch-free choice of inner loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DsdConversionMode {
    #[default]
    Passthrough,
    BitReverseOnly,
    ByteSwapOnly,
    BitReverseAndSwap,
}

impl DsdConversionMode {
    pub fn compose(needs_bit_reverse: bool, needs_byte_swap: bool) -> Self {
        match (needs_bit_reverse, needs_byte_swap) {
            (false, false) => Self::Passthrough,
            (true, false) => Self::BitReverseOnly,
            (false, true) => Self::ByteSwapOnly,
            (true, true) => Self::BitReverseAndSwap,
        }
    }

    /// The mode that undoes this one. Bit reversal and word reversal are
    /// both involutions and commute, so every mode is its own inverse.
    pub fn inverse(self) -> Self {
        self
    }
}

/// PCM input-to-wire conversion selected during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcmConversion {
    /// Input byte layout already matches the wire
    #[default]
    Passthrough,
    /// 16-bit input widened to the sink's 32-bit wire samples
    Widen16To32,
    /// S24-in-32 input packed to the sink's 3-byte wire samples
    Pack24In32,
}

/// Concrete on-wire format accepted by the sink
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedFormat {
    /// Accepted wire sample width in bits (16/24/32 for PCM, 1 for DSD)
    pub wire_bits: u8,
    pub wire_endian: DsdEndian,
    /// Bit order of the accepted DSD descriptor
    pub dsd_bit_order: DsdSourceOrder,
    pub needs_bit_reverse: bool,
    pub needs_byte_swap: bool,
    pub conversion_mode: DsdConversionMode,
    pub pcm_conversion: PcmConversion,
}

impl NegotiatedFormat {
    /// Negotiation result for an accepted PCM wire width
    pub fn pcm(input_bits: u8, wire_bits: u8) -> Self {
        let pcm_conversion = match (input_bits, wire_bits) {
            (16, 32) => PcmConversion::Widen16To32,
            (24, 24) => PcmConversion::Pack24In32,
            // 16→16, 24→32 (container already 32-bit wide), 32→32
            _ => PcmConversion::Passthrough,
        };
        Self {
            wire_bits,
            wire_endian: DsdEndian::Big,
            dsd_bit_order: DsdSourceOrder::Lsb,
            needs_bit_reverse: false,
            needs_byte_swap: false,
            conversion_mode: DsdConversionMode::Passthrough,
            pcm_conversion,
        }
    }

    /// Negotiation result for an accepted DSD descriptor
    pub fn dsd(source: DsdSourceOrder, wire_order: DsdSourceOrder, wire_endian: DsdEndian) -> Self {
        let needs_bit_reverse = source != wire_order;
        let needs_byte_swap = wire_endian == DsdEndian::Little;
        Self {
            wire_bits: 1,
            wire_endian,
            dsd_bit_order: wire_order,
            needs_bit_reverse,
            needs_byte_swap,
            conversion_mode: DsdConversionMode::compose(needs_bit_reverse, needs_byte_swap),
            pcm_conversion: PcmConversion::Passthrough,
        }
    }

    /// Wire bytes per sample (3 for packed 24-bit, container width otherwise)
    pub fn wire_bytes_per_sample(&self) -> usize {
        match self.wire_bits {
            32 => 4,
            24 => 3,
            16 => 2,
            _ => 1,
        }
    }
}
