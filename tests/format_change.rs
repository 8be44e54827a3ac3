//! Track-change policy scenarios: fast path, full reopen, reconfigure,
//! and the conversion pipeline observed end to end at the transport.

use std::sync::Arc;
use std::time::Instant;

use resona::engine::format::{AudioFormat, DsdSourceOrder, DSD64_RATE};
use resona::engine::{AudioCore, CoreState};
use resona::sink::loopback::{AcceptPolicy, LoopbackHandle, LoopbackSink};
use resona::sink::FormatDescriptor;
use resona::RendererConfig;

fn core_with_policy(policy: Option<AcceptPolicy>) -> (Arc<AudioCore>, LoopbackHandle) {
    let (sink, handle) = LoopbackSink::new(false);
    if let Some(policy) = policy {
        handle.set_accept_policy(policy);
    }
    let core = Arc::new(AudioCore::new(Box::new(sink), RendererConfig::default()));
    core.enable().unwrap();
    (core, handle)
}

fn push_dsd_ms(core: &AudioCore, format: &AudioFormat, ms: usize) {
    let bytes = format.dsd_byte_rate() as usize * format.channels as usize * ms / 1000;
    let block = vec![0x69u8; bytes];
    core.push(&block, bytes * 8 / format.channels as usize);
}

/// Steps until the core reports Playing, returning the silence cycles spent
/// in warmup. Panics if it never gets there.
fn step_through_warmup(core: &AudioCore, handle: &LoopbackHandle) -> usize {
    let mut steps = 0;
    while core.state() != CoreState::Playing {
        assert_eq!(handle.step_cycles(1), 1, "transport must be cycling");
        steps += 1;
        assert!(steps < 10_000, "warmup never completed");
    }
    steps
}

#[test]
fn same_format_track_change_skips_renegotiation() {
    let (core, handle) = core_with_policy(None);
    let format = AudioFormat::pcm(44_100, 16, 2);
    core.open(format).unwrap();

    handle.clear_format_log();
    let started = Instant::now();
    core.open(format).unwrap();

    assert!(handle.probed_formats().is_empty(), "fast path must not renegotiate");
    assert!(handle.accepted_formats().is_empty());
    assert_eq!(core.state(), CoreState::Prefilling);
    assert!(
        started.elapsed().as_millis() < 400,
        "fast path must skip settle and prepare delays"
    );

    // Fresh prefill, then audio flows again
    let block = vec![0u8; 44_100 / 5 * 4];
    core.push(&block, 44_100 / 5);
    assert!(handle.step_cycles(40) > 0);
}

#[test]
fn pcm_rate_change_runs_full_reopen() {
    let (core, handle) = core_with_policy(None);
    core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();

    handle.clear_format_log();
    let started = Instant::now();
    core.open(AudioFormat::pcm(96_000, 24, 2)).unwrap();

    // Teardown, settle (100ms), session reopen, prepare (500ms), configure
    assert!(started.elapsed().as_millis() >= 600);
    assert_eq!(core.state(), CoreState::Prefilling);
    assert!(handle.session_open());
    assert_eq!(
        handle.accepted_formats().last().unwrap(),
        &FormatDescriptor::Pcm { rate: 96_000, channels: 2, bits: 32 }
    );
    assert_eq!(core.underruns(), 0);

    // New stream plays cleanly after warmup
    let block = vec![0u8; 9_600 * 4];
    for _ in 0..5 {
        core.push(&block, 9_600);
    }
    let warmup = step_through_warmup(&core, &handle);
    assert_eq!(warmup, 31, "30 PCM warmup cycles then the first pop");
    handle.step_cycles(100);
    assert_eq!(core.underruns(), 0);
}

#[test]
fn dsd_rate_upgrade_scales_warmup_and_keeps_dsd_silence() {
    let (core, handle) = core_with_policy(None);

    let dsd64 = AudioFormat::dsd(DSD64_RATE, 2, DsdSourceOrder::Lsb);
    core.open(dsd64).unwrap();
    push_dsd_ms(&core, &dsd64, 100);
    let warmup64 = step_through_warmup(&core, &handle);

    let dsd512 = AudioFormat::dsd(DSD64_RATE * 8, 2, DsdSourceOrder::Lsb);
    handle.clear_format_log();
    core.open(dsd512).unwrap();
    assert_eq!(
        handle.accepted_formats().last().unwrap(),
        &FormatDescriptor::Dsd {
            bit_rate: DSD64_RATE * 8,
            channels: 2,
            bit_order: DsdSourceOrder::Lsb,
            endian: resona::engine::format::DsdEndian::Big,
        }
    );

    // Warmup silence for the new rate is still the DSD idle byte
    handle.capture(true);
    push_dsd_ms(&core, &dsd512, 100);
    let warmup512 = step_through_warmup(&core, &handle);
    handle.capture(false);
    let captured = handle.captured();
    let silence_cycles = &captured[..(warmup512 - 1) * handle.cycle_bytes()];
    assert!(silence_cycles.iter().all(|&b| b == 0x69));

    assert!(
        warmup512 > warmup64 * 8,
        "warmup must scale with the DSD multiplier (got {warmup64} vs {warmup512})"
    );
}

#[test]
fn dsd_to_pcm_transition_switches_silence_byte() {
    let (core, handle) = core_with_policy(None);

    let dsd64 = AudioFormat::dsd(DSD64_RATE, 2, DsdSourceOrder::Lsb);
    core.open(dsd64).unwrap();
    handle.capture(true);
    handle.step_cycles(2);
    assert!(handle.captured().iter().all(|&b| b == 0x69));

    let started = Instant::now();
    core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();
    assert!(started.elapsed().as_millis() >= 900, "DSD settle plus prepare delay");

    handle.capture(true);
    handle.step_cycles(2);
    assert!(handle.captured().iter().all(|&b| b == 0x00));
}

#[test]
fn bit_depth_change_reconfigures_quickly() {
    let (core, handle) = core_with_policy(None);
    core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();

    handle.clear_format_log();
    let started = Instant::now();
    core.open(AudioFormat::pcm(44_100, 24, 2)).unwrap();
    let elapsed = started.elapsed().as_millis();

    assert_eq!(core.state(), CoreState::Prefilling);
    // Short settle (150ms) + quick prepare (200ms), well under the full
    // reopen's 500ms prepare + rate settle
    assert!((300..600).contains(&elapsed), "took {elapsed}ms");
    assert_eq!(
        handle.accepted_formats().last().unwrap(),
        &FormatDescriptor::Pcm { rate: 44_100, channels: 2, bits: 32 }
    );
}

#[test]
fn msb_source_on_lsb_wire_gets_bit_reversed() {
    let (core, handle) = core_with_policy(None); // wire accepts LSB|BIG only

    let dff = AudioFormat::dsd(DSD64_RATE, 2, DsdSourceOrder::Msb);
    core.open(dff).unwrap();
    push_dsd_ms(&core, &dff, 100);
    step_through_warmup(&core, &handle);

    // Push a recognizable pattern and watch it arrive bit-reversed
    let pattern = [0x01u8, 0x01, 0x02, 0x02, 0x03, 0x03, 0x04, 0x04];
    let block: Vec<u8> = pattern.iter().copied().cycle().take(7_056).collect();
    core.push(&block, block.len() * 8 / 2);

    // Drain what was buffered before the pattern
    let skip = 100 * 705_600 / 1000 / handle.cycle_bytes();
    handle.step_cycles(skip);
    handle.capture(true);
    handle.step_cycles(1);
    let captured = handle.captured();
    // 0x01 -> 0x80, 0x02 -> 0x40, 0x03 -> 0xC0, 0x04 -> 0x20
    for word_pair in captured.chunks_exact(8) {
        assert_eq!(word_pair, [0x80, 0x40, 0xC0, 0x20, 0x80, 0x40, 0xC0, 0x20]);
    }
}

#[test]
fn widen_16_to_32_observed_at_the_wire() {
    let (core, handle) = core_with_policy(Some(AcceptPolicy {
        pcm_bits: vec![32],
        ..AcceptPolicy::default()
    }));
    core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();

    // Constant sample 0x1234 in both channels
    let frames = 8_820;
    let mut block = Vec::with_capacity(frames * 4);
    for _ in 0..frames * 2 {
        block.extend_from_slice(&0x1234i16.to_le_bytes());
    }
    assert_eq!(core.push(&block, frames), block.len());

    step_through_warmup(&core, &handle);
    handle.capture(true);
    handle.step_cycles(1);
    let captured = handle.captured();
    assert_eq!(captured.len(), handle.cycle_bytes());
    for sample in captured.chunks_exact(4) {
        assert_eq!(sample, (0x1234i32 << 16).to_le_bytes());
    }
}

#[test]
fn release_relinquishes_session_and_open_recovers() {
    let (core, handle) = core_with_policy(None);
    core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();

    core.release();
    assert!(!handle.session_open(), "release closes the transport session");
    assert_eq!(core.state(), CoreState::Enabled);

    core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();
    assert!(handle.session_open(), "open reopens a released session");
    assert_eq!(core.state(), CoreState::Prefilling);
}
