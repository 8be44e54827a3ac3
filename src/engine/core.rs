//! Audio delivery core
//!
//! [`AudioCore`] bridges the asynchronous producer (decoded samples pushed
//! from upstream at whatever rate the network delivers) with the strictly
//! periodic consumer (the sink transport pulling one buffer per cycle). It
//! owns the ring buffer, drives the transport's session lifecycle and
//! format negotiation, and implements the cycle callback.
//!
//! # Threading
//!
//! Three parties touch the core:
//! - the control thread calls the session operations (`enable`, `open`,
//!   `close`, …), serialised under the session lock and allowed to sleep;
//! - the producer thread calls [`AudioCore::push`], which never sleeps and
//!   never takes the session lock;
//! - the transport's cycle thread runs the callback, which takes no lock of
//!   any kind and always returns a full buffer.
//!
//! Ring geometry changes go through the reconfigure gate: the writer raises
//! the `reconfiguring` flag and spins until `ring_users` drains; producer
//! and consumer enter the ring only through [`RingGuard`], which re-checks
//! the flag on both sides of its user-count increment. An aborted guard on
//! the push side surfaces as a zero-byte push; on the cycle side it
//! surfaces as one silence cycle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::RendererConfig;
use crate::engine::cycle::CycleCalculator;
use crate::engine::format::{
    AudioFormat, DsdConversionMode, DsdEndian, DsdSourceOrder, NegotiatedFormat, PcmConversion,
    SinkCapabilities,
};
use crate::engine::ring::{SyncRing, DSD_SILENCE, PCM_SILENCE};
use crate::engine::state::{CoreState, StateCell};
use crate::error::{Error, Result};
use crate::sink::{retry, FormatDescriptor, SessionOptions, SinkTransport, TransferMode};

/// Ring depth in seconds of the wire byte rate
const PCM_BUFFER_SECONDS: f64 = 3.0;
const DSD_BUFFER_SECONDS: f64 = 1.5;

/// Prefill targets in milliseconds of the wire byte rate. Low-bitrate PCM
/// (≤48 kHz, 16-bit wire) gets a deeper prefill because cycle jitter is
/// proportionally larger there.
const PREFILL_MS: u64 = 40;
const PREFILL_LOW_BITRATE_MS: u64 = 100;

/// Silence cycles after the transport reports online, before real audio.
/// PCM uses a fixed count; DSD scales with the rate multiplier (50 ms at
/// DSD64 doubling per step) to cover the sink's reclock PLL settling.
const PCM_WARMUP_CYCLES: u32 = 30;
const DSD_WARMUP_BASE_MS: u64 = 50;
const WARMUP_CYCLES_MIN: u32 = 50;
const WARMUP_CYCLES_MAX: u32 = 3_000;

/// Shutdown-silence cycle counts
const CLOSE_SILENCE_DSD: u32 = 50;
const CLOSE_SILENCE_PCM: u32 = 20;
const PAUSE_SILENCE_DSD: u32 = 30;
const PAUSE_SILENCE_PCM: u32 = 10;
const FAST_PATH_SILENCE_DSD: u32 = 30;

/// Hard upper bounds on shutdown-silence waits; the transition proceeds
/// regardless once these expire
const CLOSE_SILENCE_WAIT: Duration = Duration::from_millis(150);
const PAUSE_SILENCE_WAIT: Duration = Duration::from_millis(80);
const FAST_PATH_SILENCE_WAIT: Duration = Duration::from_millis(100);

/// Settle intervals for the sink's clock domain between teardown and
/// reconfigure. DSD transitions need the longer relock.
const SETTLE_PCM_RATE: Duration = Duration::from_millis(100);
const SETTLE_DSD: Duration = Duration::from_millis(400);

/// Device-prepare delay before `set_sink_format`
const PRE_FORMAT_DELAY_FULL: Duration = Duration::from_millis(500);
const PRE_FORMAT_DELAY_QUICK: Duration = Duration::from_millis(200);

/// Sink client identity, stable across sessions
const CLIENT_ID: u32 = 0x5253_4E00; // "RSN\0"

/// Shared state between the session side, the producer and the cycle
/// callback. Everything here is atomic or internally synchronised.
struct CoreShared {
    ring: SyncRing,
    state: StateCell,

    // Reconfigure gate
    reconfiguring: AtomicBool,
    ring_users: AtomicUsize,

    // Playback flags, all observed by the cycle callback
    prefill_complete: AtomicBool,
    prefill_target: AtomicUsize,
    stop_requested: AtomicBool,
    draining: AtomicBool,
    silence_remaining: AtomicU32,
    warmup_done: AtomicBool,
    stabilization_count: AtomicU32,
    stabilization_target: AtomicU32,
    bytes_per_cycle: AtomicUsize,
    transport_online: AtomicBool,
    callback_active: AtomicBool,

    // Producer-side format snapshot, reloaded on generation change
    format_generation: AtomicU32,
    fmt_is_dsd: AtomicBool,
    fmt_channels: AtomicUsize,
    fmt_input_frame_bytes: AtomicUsize,
    fmt_pcm_conversion: AtomicU32,
    fmt_dsd_mode: AtomicU32,

    // Position accounting
    wire_byte_rate: AtomicUsize,
    sample_rate: AtomicU32,
    popped_bytes: AtomicU64,

    // Statistics
    cycle_count: AtomicU64,
    underrun_count: AtomicU32,
    push_count: AtomicU64,
}

impl CoreShared {
    fn new() -> Self {
        Self {
            ring: SyncRing::new(44_100 * 2 * 4, PCM_SILENCE),
            state: StateCell::new(CoreState::Disabled),
            reconfiguring: AtomicBool::new(false),
            ring_users: AtomicUsize::new(0),
            prefill_complete: AtomicBool::new(false),
            prefill_target: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            silence_remaining: AtomicU32::new(0),
            warmup_done: AtomicBool::new(false),
            stabilization_count: AtomicU32::new(0),
            stabilization_target: AtomicU32::new(PCM_WARMUP_CYCLES),
            bytes_per_cycle: AtomicUsize::new(0),
            transport_online: AtomicBool::new(false),
            callback_active: AtomicBool::new(false),
            format_generation: AtomicU32::new(0),
            fmt_is_dsd: AtomicBool::new(false),
            fmt_channels: AtomicUsize::new(2),
            fmt_input_frame_bytes: AtomicUsize::new(4),
            fmt_pcm_conversion: AtomicU32::new(0),
            fmt_dsd_mode: AtomicU32::new(0),
            wire_byte_rate: AtomicUsize::new(1),
            sample_rate: AtomicU32::new(0),
            popped_bytes: AtomicU64::new(0),
            cycle_count: AtomicU64::new(0),
            underrun_count: AtomicU32::new(0),
            push_count: AtomicU64::new(0),
        }
    }

    /// One transport cycle. Decision ladder, in order; every branch fills
    /// the buffer and returns without blocking.
    fn on_cycle(&self, buf: &mut [u8]) {
        self.callback_active.store(true, Ordering::Release);
        self.cycle(buf);
        self.callback_active.store(false, Ordering::Release);
    }

    fn cycle(&self, buf: &mut [u8]) {
        let silence = self.ring.silence_byte();

        let guard = RingGuard::enter(self);
        if !guard.active() {
            // Reconfiguring: geometry is changing under us
            buf.fill(silence);
            return;
        }

        // A transport still cycling at the old size mid-transition gets
        // silence until the programmed size matches again
        if buf.len() != self.bytes_per_cycle.load(Ordering::Acquire) {
            buf.fill(silence);
            return;
        }

        // Shutdown / pre-transition silence
        let remaining = self.silence_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.silence_remaining.fetch_sub(1, Ordering::AcqRel);
            buf.fill(silence);
            return;
        }

        if self.stop_requested.load(Ordering::Acquire) {
            buf.fill(silence);
            return;
        }

        if !self.prefill_complete.load(Ordering::Acquire) {
            buf.fill(silence);
            return;
        }

        // Post-online warmup: silence cycles while the sink clock settles
        if !self.warmup_done.load(Ordering::Acquire) {
            self.state.promote(CoreState::Prefilling, CoreState::Warmup);
            let target = self.stabilization_target.load(Ordering::Acquire);
            let count = self.stabilization_count.fetch_add(1, Ordering::AcqRel) + 1;
            if count >= target {
                self.warmup_done.store(true, Ordering::Release);
                self.stabilization_count.store(0, Ordering::Release);
            }
            buf.fill(silence);
            return;
        }

        if !self.state.promote(CoreState::Warmup, CoreState::Playing) {
            // Resume path skips warmup entirely
            self.state.promote(CoreState::Prefilling, CoreState::Playing);
        }

        self.cycle_count.fetch_add(1, Ordering::Relaxed);

        if self.ring.available() < buf.len() {
            // Producer starved: one silence cycle, one count, never a wait
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
            buf.fill(silence);
            return;
        }

        let popped = self.ring.pop(buf);
        if popped < buf.len() {
            buf[popped..].fill(silence);
        }
        self.popped_bytes.fetch_add(popped as u64, Ordering::Relaxed);
    }

    /// Reset every per-track flag. Callers hold the reconfigure gate when
    /// the ring is also being resized.
    fn reset_playback_flags(&self) {
        self.prefill_complete.store(false, Ordering::Release);
        self.warmup_done.store(false, Ordering::Release);
        self.silence_remaining.store(0, Ordering::Release);
        self.stabilization_count.store(0, Ordering::Release);
        self.stop_requested.store(false, Ordering::Release);
        self.draining.store(false, Ordering::Release);
        self.popped_bytes.store(0, Ordering::Release);
        self.cycle_count.store(0, Ordering::Release);
        self.push_count.store(0, Ordering::Release);
    }
}

/// Scoped entry into the ring for producer or consumer.
///
/// Entry aborts when a reconfigure is pending; the double check around the
/// user-count increment closes the race with the gate writer.
struct RingGuard<'a> {
    shared: &'a CoreShared,
    active: bool,
}

impl<'a> RingGuard<'a> {
    fn enter(shared: &'a CoreShared) -> Self {
        if shared.reconfiguring.load(Ordering::Acquire) {
            return Self { shared, active: false };
        }
        shared.ring_users.fetch_add(1, Ordering::AcqRel);
        if shared.reconfiguring.load(Ordering::Acquire) {
            shared.ring_users.fetch_sub(1, Ordering::AcqRel);
            return Self { shared, active: false };
        }
        Self { shared, active: true }
    }

    fn active(&self) -> bool {
        self.active
    }
}

impl Drop for RingGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.shared.ring_users.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Gate writer: excludes all ring users for the duration of the scope.
struct ReconfigureGuard<'a> {
    shared: &'a CoreShared,
}

impl<'a> ReconfigureGuard<'a> {
    fn begin(shared: &'a CoreShared) -> Self {
        shared.reconfiguring.store(true, Ordering::Release);
        while shared.ring_users.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
        Self { shared }
    }
}

impl Drop for ReconfigureGuard<'_> {
    fn drop(&mut self) {
        self.shared.reconfiguring.store(false, Ordering::Release);
    }
}

/// Producer-side cached format values, reloaded only when the format
/// generation changes so the per-push cost is one acquire load.
#[derive(Default)]
struct PushCache {
    generation: u32,
    valid: bool,
    is_dsd: bool,
    channels: usize,
    input_frame_bytes: usize,
    pcm_conversion: PcmConversion,
    dsd_mode: DsdConversionMode,
}

/// Session-side state: the transport handle plus everything only the
/// control thread touches. Guarded by one mutex so the transport never sees
/// overlapping lifecycle calls.
struct Session {
    transport: Box<dyn SinkTransport>,
    config: RendererConfig,
    target: Option<crate::sink::Target>,
    calculator: Option<CycleCalculator>,
    capabilities: SinkCapabilities,
    /// Transport session (sink relinquished when false)
    session_open: bool,
    /// Four-phase connect completed and not torn down
    connected: bool,
    /// Sink currently programmed with a wire format
    sink_configured: bool,
    previous_format: Option<AudioFormat>,
    negotiated: Option<NegotiatedFormat>,
    cycle_time: Duration,
    low_bitrate: bool,
}

impl Session {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            thread_mode: self.config.thread_mode,
            cycle_time: self.cycle_time,
            client_name: self.config.name.clone(),
            client_id: CLIENT_ID,
        }
    }
}

/// The audio delivery core
pub struct AudioCore {
    shared: Arc<CoreShared>,
    session: Mutex<Session>,
    push_cache: Mutex<PushCache>,
}

impl AudioCore {
    pub fn new(transport: Box<dyn SinkTransport>, config: RendererConfig) -> Self {
        let cycle_time = config.initial_cycle_time;
        Self {
            shared: Arc::new(CoreShared::new()),
            session: Mutex::new(Session {
                transport,
                config,
                target: None,
                calculator: None,
                capabilities: SinkCapabilities::default(),
                session_open: false,
                connected: false,
                sink_configured: false,
                previous_format: None,
                negotiated: None,
                cycle_time,
                low_bitrate: false,
            }),
            push_cache: Mutex::new(PushCache::default()),
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Discover the sink, measure the path MTU, open the transport session
    /// and fetch capabilities. Disabled → Enabled.
    pub fn enable(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if self.shared.state.get() != CoreState::Disabled {
            debug!("enable: already enabled");
            return Ok(());
        }

        let targets = session.transport.discover()?;
        if targets.is_empty() {
            return Err(Error::NoSinkFound);
        }
        let index = session.config.target_index;
        if index >= targets.len() {
            return Err(Error::TargetIndexOutOfRange { index, found: targets.len() });
        }
        let target = targets[index].clone();
        info!(name = %target.name, index, "sink selected");

        let mtu = if let Some(mtu) = session.config.mtu_override {
            info!(mtu, "using configured MTU");
            mtu
        } else {
            match session.transport.measure_mtu(&target) {
                Ok(mtu) if mtu > 0 => {
                    info!(mtu, "measured path MTU");
                    mtu
                }
                _ => {
                    let fallback = session.config.mtu_fallback;
                    warn!(fallback, "MTU measurement failed, using fallback");
                    fallback
                }
            }
        };
        session.calculator = Some(CycleCalculator::new(mtu));
        session.target = Some(target);

        let shared = Arc::clone(&self.shared);
        session
            .transport
            .register_cycle_callback(Box::new(move |buf| shared.on_cycle(buf)));

        Self::open_transport_session(&mut session)?;

        self.shared.state.transition(&[CoreState::Disabled], CoreState::Enabled)?;
        info!(mtu, "audio core enabled");
        Ok(())
    }

    /// Inverse of [`enable`](Self::enable); blocks until the cycle callback
    /// is known quiesced.
    pub fn disable(&self) {
        if self.shared.state.get() == CoreState::Disabled {
            return;
        }
        if self.shared.state.get().track_open() {
            self.close();
        }
        let mut session = self.session.lock().unwrap();
        if session.session_open {
            session.transport.close_session();
            session.session_open = false;
        }
        session.connected = false;
        session.sink_configured = false;
        session.previous_format = None;
        session.negotiated = None;
        drop(session);

        self.shared.transport_online.store(false, Ordering::Release);
        self.shared.stop_requested.store(true, Ordering::Release);
        self.wait_callback_quiesced(Duration::from_secs(1));
        self.shared.state.set(CoreState::Disabled);
        info!("audio core disabled");
    }

    fn open_transport_session(session: &mut Session) -> Result<()> {
        let options = session.session_options();
        let policy = retry::OPEN_SESSION;
        let opened = policy.run(|| match session.transport.open_session(&options) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "open_session attempt failed");
                Ok::<bool, Error>(false)
            }
        })?;
        if !opened {
            return Err(Error::SessionOpenFailed { attempts: policy.attempts });
        }
        session.session_open = true;

        let target = session.target.clone().expect("target set before session open");
        session.capabilities = session.transport.query_capabilities(&target)?;
        let caps = session.capabilities;
        debug!(
            pcm = caps.supports_pcm,
            dsd = caps.supports_dsd,
            dsd_lsb = caps.dsd_lsb,
            dsd_msb = caps.dsd_msb,
            "sink capabilities"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Track open / close
    // ------------------------------------------------------------------

    /// Open a track format on the sink. Called on every track change; picks
    /// the cheapest transition that is clean for the sink:
    ///
    /// 1. same format, still configured: clear and replay, no renegotiation
    /// 2. clock-domain change (any rate change, DSD→PCM): full session
    ///    reopen with a rate-dependent settle interval
    /// 3. other format change (PCM→DSD, bit depth): short-settle reconfigure
    /// 4. first open: full path without the pre-stop
    pub fn open(&self, format: AudioFormat) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let state = self.shared.state.get();
        if state == CoreState::Disabled {
            return Err(Error::InvalidState("open before enable".into()));
        }
        info!(%format, "open");

        // Reopen the transport session if release() relinquished the sink
        if !session.session_open {
            debug!("session was released, reopening");
            Self::open_transport_session(&mut session)?;
        }

        let previous = session.previous_format;
        let same_format = previous == Some(format);

        if session.sink_configured && session.connected && same_format {
            self.fast_path_reopen(&mut session);
            return Ok(());
        }

        // A quick reconfigure keeps the DAC clock domain; everything else
        // that tears down is a full reopen with the longer settle.
        let mut quick = false;
        if let Some(prev) = previous.filter(|_| session.sink_configured && session.connected) {
            let dsd_rate_change =
                prev.is_dsd && format.is_dsd && prev.sample_rate != format.sample_rate;
            let pcm_rate_change =
                !prev.is_dsd && !format.is_dsd && prev.sample_rate != format.sample_rate;
            let dsd_to_pcm = prev.is_dsd && !format.is_dsd;

            let settle = if dsd_to_pcm || dsd_rate_change {
                SETTLE_DSD
            } else if pcm_rate_change {
                SETTLE_PCM_RATE
            } else {
                // PCM→DSD or bit-depth change: no DAC clock relock needed
                quick = true;
                session.config.format_switch_delay
            };

            self.shared.state.set(CoreState::Reopening);
            self.teardown_for_reopen(&mut session);

            debug!(settle_ms = settle.as_millis() as u64, "waiting for sink to settle");
            std::thread::sleep(settle);

            Self::open_transport_session(&mut session).map_err(|e| {
                self.shared.state.set(CoreState::Enabled);
                Error::ReconnectFailed(e.to_string())
            })?;
        }

        match self.configure_and_connect(&mut session, format, quick) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.state.set(CoreState::Enabled);
                Err(e)
            }
        }
    }

    /// Same-format fast path: drain the sink's residual with a short
    /// silence burst, clear the ring and replay. No renegotiation, no
    /// reconnect.
    fn fast_path_reopen(&self, session: &mut Session) {
        debug!("same format still configured: quick resume");
        if self.shared.fmt_is_dsd.load(Ordering::Acquire) {
            self.request_shutdown_silence(FAST_PATH_SILENCE_DSD);
            self.wait_silence_drained(FAST_PATH_SILENCE_WAIT);
        }
        self.shared.ring.clear();
        self.shared.reset_playback_flags();
        session.transport.play();
        self.shared.state.set(CoreState::Prefilling);
    }

    /// Stop traffic, disconnect and close the transport session ahead of a
    /// reopen or reconfigure.
    fn teardown_for_reopen(&self, session: &mut Session) {
        self.shared.silence_remaining.store(0, Ordering::Release);
        self.shared.stop_requested.store(true, Ordering::Release);
        session.transport.stop();
        session.transport.disconnect(true);
        session.transport.close_session();
        session.session_open = false;
        session.connected = false;
        session.sink_configured = false;
        self.shared.transport_online.store(false, Ordering::Release);
        self.wait_callback_quiesced(Duration::from_millis(500));
    }

    /// Negotiate the wire format, size the ring, programme the sink and run
    /// the connect sequence. Transitions into Prefilling on success.
    fn configure_and_connect(
        &self,
        session: &mut Session,
        format: AudioFormat,
        quick: bool,
    ) -> Result<()> {
        self.shared.state.set(CoreState::Opening);

        // Quiesce and reset per-track state before touching the ring
        self.shared.stop_requested.store(true, Ordering::Release);
        self.wait_callback_quiesced(Duration::from_millis(500));

        let calculator = session.calculator.expect("calculator set at enable");

        let (negotiated, descriptor) = self.negotiate(session, &format)?;
        info!(
            wire_bits = negotiated.wire_bits,
            pcm_conversion = ?negotiated.pcm_conversion,
            dsd_mode = ?negotiated.conversion_mode,
            "wire format negotiated"
        );

        // Cycle parameters for the negotiated wire format
        let (cycle_us, bytes_per_cycle, wire_byte_rate) = if format.is_dsd {
            let byte_rate = format.dsd_byte_rate();
            (
                calculator.cycle_time_us(format.sample_rate, format.channels, 1),
                CycleCalculator::dsd_bytes_per_cycle(byte_rate, format.channels),
                byte_rate as usize * format.channels as usize,
            )
        } else {
            let wire_bytes = negotiated.wire_bytes_per_sample();
            (
                calculator.cycle_time_us(format.sample_rate, format.channels, negotiated.wire_bits),
                CycleCalculator::pcm_bytes_per_cycle(format.sample_rate, format.channels, wire_bytes),
                format.sample_rate as usize * format.channels as usize * wire_bytes,
            )
        };
        session.cycle_time = Duration::from_micros(cycle_us as u64);
        session.low_bitrate =
            !format.is_dsd && format.sample_rate <= 48_000 && negotiated.wire_bits <= 16;

        self.configure_ring(session, &format, &negotiated, bytes_per_cycle, wire_byte_rate, cycle_us);

        // The sink needs a moment to prepare for a new format before the
        // configure call lands
        std::thread::sleep(if quick {
            PRE_FORMAT_DELAY_QUICK
        } else {
            PRE_FORMAT_DELAY_FULL
        });

        let target = session.target.clone().expect("target set at enable");
        let cycle_time = session.cycle_time;
        let mtu = calculator.mtu();
        let policy = if quick { retry::SET_FORMAT_QUICK } else { retry::SET_FORMAT_FULL };
        let transport = &mut session.transport;
        let configured = policy.run(|| transport.set_sink_format(&target, &descriptor, cycle_time, mtu))?;
        if !configured {
            return Err(Error::ReconnectFailed(format!(
                "sink refused configure after {} attempts",
                policy.attempts
            )));
        }
        session.sink_configured = true;
        session.negotiated = Some(negotiated);

        let mode = TransferMode::Auto.resolve(format.is_dsd, session.low_bitrate);
        session.transport.apply_transfer_mode(mode, cycle_time);

        session.transport.connect_prepare()?;
        let transport = &mut session.transport;
        let connected = retry::CONNECT.run(|| match transport.connect() {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "connect attempt failed");
                Ok::<bool, Error>(false)
            }
        })?;
        if !connected {
            return Err(Error::ReconnectFailed("connect failed".into()));
        }
        if let Err(e) = session.transport.connect_wait() {
            session.transport.disconnect(false);
            return Err(Error::ReconnectFailed(format!("connect_wait: {e}")));
        }
        session.connected = true;

        // Start the cycle flow and wait for the link
        self.shared.ring.clear();
        self.shared.reset_playback_flags();
        session.transport.play();

        let online_wait = session.config.online_wait;
        if !Self::wait_for_online(session, online_wait) {
            warn!("sink did not report online in time, proceeding");
        }
        self.shared.transport_online.store(true, Ordering::Release);
        self.shared.stabilization_count.store(0, Ordering::Release);

        session.previous_format = Some(format);
        self.shared.state.set(CoreState::Prefilling);
        info!(cycle_us, bytes_per_cycle, "open complete");
        Ok(())
    }

    /// Try wire formats in preference order against the sink's capability
    /// matrix.
    fn negotiate(
        &self,
        session: &mut Session,
        format: &AudioFormat,
    ) -> Result<(NegotiatedFormat, FormatDescriptor)> {
        if format.is_dsd {
            let source = format.dsd_source_order;
            let candidates = [
                (DsdSourceOrder::Lsb, DsdEndian::Big),
                (DsdSourceOrder::Msb, DsdEndian::Big),
                (DsdSourceOrder::Lsb, DsdEndian::Little),
                (DsdSourceOrder::Msb, DsdEndian::Little),
            ];
            for (order, endian) in candidates {
                let descriptor = FormatDescriptor::Dsd {
                    bit_rate: format.sample_rate,
                    channels: format.channels,
                    bit_order: order,
                    endian,
                };
                if session.transport.check_format(&descriptor) {
                    return Ok((NegotiatedFormat::dsd(source, order, endian), descriptor));
                }
            }
            // Last resort: base DSD support, wire assumed LSB-first big-endian
            let descriptor = FormatDescriptor::DsdMinimal {
                bit_rate: format.sample_rate,
                channels: format.channels,
            };
            if session.transport.check_format(&descriptor) {
                return Ok((
                    NegotiatedFormat::dsd(source, DsdSourceOrder::Lsb, DsdEndian::Big),
                    descriptor,
                ));
            }
        } else {
            for wire_bits in [32u8, 24, 16] {
                let descriptor = FormatDescriptor::Pcm {
                    rate: format.sample_rate,
                    channels: format.channels,
                    bits: wire_bits,
                };
                if session.transport.check_format(&descriptor) {
                    return Ok((NegotiatedFormat::pcm(format.bit_depth, wire_bits), descriptor));
                }
            }
        }
        Err(Error::UnsupportedFormat {
            rate: format.sample_rate,
            bits: format.bit_depth,
            channels: format.channels,
            kind: if format.is_dsd { "DSD" } else { "PCM" },
        })
    }

    /// Resize the ring and publish the new format snapshot under the gate.
    fn configure_ring(
        &self,
        session: &Session,
        format: &AudioFormat,
        negotiated: &NegotiatedFormat,
        bytes_per_cycle: usize,
        wire_byte_rate: usize,
        cycle_us: u32,
    ) {
        let shared = &self.shared;
        let _gate = ReconfigureGuard::begin(shared);

        let (seconds, silence) = if format.is_dsd {
            (DSD_BUFFER_SECONDS, DSD_SILENCE)
        } else {
            (PCM_BUFFER_SECONDS, PCM_SILENCE)
        };
        let capacity = ((wire_byte_rate as f64 * seconds) as usize).max(bytes_per_cycle * 16);
        shared.ring.reset(capacity, silence);

        let prefill_ms = if session.low_bitrate { PREFILL_LOW_BITRATE_MS } else { PREFILL_MS };
        let prefill = (wire_byte_rate as u64 * prefill_ms / 1000) as usize;
        let prefill = prefill.min(capacity / 4).max(bytes_per_cycle);
        shared.prefill_target.store(prefill, Ordering::Release);

        let warmup = if format.is_dsd {
            let target_ms = DSD_WARMUP_BASE_MS * format.dsd_multiplier() as u64;
            let cycles = (target_ms * 1_000).div_ceil(cycle_us.max(1) as u64) as u32;
            cycles.clamp(WARMUP_CYCLES_MIN, WARMUP_CYCLES_MAX)
        } else {
            PCM_WARMUP_CYCLES
        };
        shared.stabilization_target.store(warmup, Ordering::Release);
        shared.bytes_per_cycle.store(bytes_per_cycle, Ordering::Release);
        shared.wire_byte_rate.store(wire_byte_rate, Ordering::Release);
        shared.sample_rate.store(format.sample_rate, Ordering::Release);
        shared.underrun_count.store(0, Ordering::Release);

        shared.fmt_is_dsd.store(format.is_dsd, Ordering::Release);
        shared.fmt_channels.store(format.channels as usize, Ordering::Release);
        shared
            .fmt_input_frame_bytes
            .store(format.input_bytes_per_frame(), Ordering::Release);
        shared
            .fmt_pcm_conversion
            .store(negotiated.pcm_conversion as u32, Ordering::Release);
        shared
            .fmt_dsd_mode
            .store(negotiated.conversion_mode as u32, Ordering::Release);
        shared.format_generation.fetch_add(1, Ordering::AcqRel);

        debug!(
            capacity,
            prefill,
            warmup,
            bytes_per_cycle,
            "ring configured"
        );
    }

    /// Graceful stop plus disconnect. Playing/Paused → Draining → Enabled.
    pub fn close(&self) {
        let state = self.shared.state.get();
        if !state.track_open() && state != CoreState::Draining {
            debug!("close: no track open");
            return;
        }
        info!("close");
        self.shared.state.set(CoreState::Draining);

        let dsd = self.shared.fmt_is_dsd.load(Ordering::Acquire);
        self.request_shutdown_silence(if dsd { CLOSE_SILENCE_DSD } else { CLOSE_SILENCE_PCM });
        self.wait_silence_drained(CLOSE_SILENCE_WAIT);
        self.shared.stop_requested.store(true, Ordering::Release);

        let mut session = self.session.lock().unwrap();
        session.transport.stop();
        session.transport.disconnect(true);
        session.connected = false;
        drop(session);

        self.shared.transport_online.store(false, Ordering::Release);
        self.wait_callback_quiesced(Duration::from_millis(500));
        self.report_underruns();
        self.shared.state.set(CoreState::Enabled);
    }

    /// `close` plus full session teardown, relinquishing the sink to other
    /// clients. The core stays configured; the next `open` re-opens the
    /// session first.
    pub fn release(&self) {
        if self.shared.state.get().track_open() {
            self.close();
        }
        let mut session = self.session.lock().unwrap();
        if session.session_open {
            info!("releasing sink");
            session.transport.close_session();
            session.session_open = false;
            session.sink_configured = false;
            std::thread::sleep(Duration::from_millis(100));
        }
        session.previous_format = None;
        session.negotiated = None;
    }

    // ------------------------------------------------------------------
    // Playback commands
    // ------------------------------------------------------------------

    /// Start or resume playback
    pub fn play(&self) -> Result<()> {
        match self.shared.state.get() {
            CoreState::Playing | CoreState::Prefilling | CoreState::Warmup => Ok(()),
            CoreState::Paused => {
                self.resume();
                Ok(())
            }
            other => Err(Error::InvalidState(format!("play from {other}"))),
        }
    }

    /// Pause: drain a short silence burst, then halt the transport. The
    /// ring is discarded on resume.
    pub fn pause(&self) {
        let state = self.shared.state.get();
        if !matches!(state, CoreState::Playing | CoreState::Prefilling | CoreState::Warmup) {
            return;
        }
        debug!("pause");
        let dsd = self.shared.fmt_is_dsd.load(Ordering::Acquire);
        self.request_shutdown_silence(if dsd { PAUSE_SILENCE_DSD } else { PAUSE_SILENCE_PCM });
        self.wait_silence_drained(PAUSE_SILENCE_WAIT);

        let mut session = self.session.lock().unwrap();
        session.transport.stop();
        drop(session);
        self.shared.state.set(CoreState::Paused);
    }

    /// Resume from pause: stale buffer content is dropped and a fresh
    /// prefill is required before audio flows again.
    pub fn resume(&self) {
        if self.shared.state.get() != CoreState::Paused {
            return;
        }
        debug!("resume");
        self.shared.draining.store(false, Ordering::Release);
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.silence_remaining.store(0, Ordering::Release);
        self.shared.ring.clear();
        self.shared.prefill_complete.store(false, Ordering::Release);

        let mut session = self.session.lock().unwrap();
        session.transport.play();
        drop(session);
        self.shared.state.set(CoreState::Prefilling);
    }

    /// Stop playback. Unless `immediate`, a shutdown-silence burst drains
    /// the sink's residual first. The sink stays configured and connected,
    /// so a same-format `open` afterwards takes the fast path.
    pub fn stop(&self, immediate: bool) {
        let state = self.shared.state.get();
        if !state.track_open() {
            return;
        }
        info!(immediate, "stop");
        self.shared.state.set(CoreState::Draining);

        if !immediate {
            let dsd = self.shared.fmt_is_dsd.load(Ordering::Acquire);
            self.request_shutdown_silence(if dsd { CLOSE_SILENCE_DSD } else { CLOSE_SILENCE_PCM });
            self.wait_silence_drained(CLOSE_SILENCE_WAIT);
        }
        self.shared.stop_requested.store(true, Ordering::Release);

        let mut session = self.session.lock().unwrap();
        session.transport.stop();
        drop(session);

        self.report_underruns();
        self.shared.state.set(CoreState::Enabled);
    }

    // ------------------------------------------------------------------
    // Producer interface
    // ------------------------------------------------------------------

    /// Push decoded audio. Returns the number of source bytes consumed;
    /// zero while draining, stopping, reconfiguring, or before the
    /// transport is online.
    ///
    /// `frames` bounds the input: for PCM it is the frame count, for DSD
    /// the number of 8-bit-per-channel chunks (`bytes × 8 / channels`).
    pub fn push(&self, data: &[u8], frames: usize) -> usize {
        let shared = &self.shared;
        if shared.draining.load(Ordering::Acquire)
            || shared.stop_requested.load(Ordering::Acquire)
            || !shared.transport_online.load(Ordering::Acquire)
        {
            return 0;
        }

        let guard = RingGuard::enter(shared);
        if !guard.active() {
            return 0;
        }

        // Single producer: this lock is uncontended, it only protects the
        // cache across reconfigurations
        let mut cache = self.push_cache.lock().unwrap();
        let generation = shared.format_generation.load(Ordering::Acquire);
        if !cache.valid || cache.generation != generation {
            cache.is_dsd = shared.fmt_is_dsd.load(Ordering::Acquire);
            cache.channels = shared.fmt_channels.load(Ordering::Acquire);
            cache.input_frame_bytes = shared.fmt_input_frame_bytes.load(Ordering::Acquire);
            cache.pcm_conversion = match shared.fmt_pcm_conversion.load(Ordering::Acquire) {
                1 => PcmConversion::Widen16To32,
                2 => PcmConversion::Pack24In32,
                _ => PcmConversion::Passthrough,
            };
            cache.dsd_mode = match shared.fmt_dsd_mode.load(Ordering::Acquire) {
                1 => DsdConversionMode::BitReverseOnly,
                2 => DsdConversionMode::ByteSwapOnly,
                3 => DsdConversionMode::BitReverseAndSwap,
                _ => DsdConversionMode::Passthrough,
            };
            cache.generation = generation;
            cache.valid = true;
        }

        let consumed = if cache.is_dsd {
            let total = (frames * cache.channels / 8).min(data.len());
            shared.ring.push_dsd(&data[..total], cache.channels, cache.dsd_mode)
        } else {
            let total = (frames * cache.input_frame_bytes).min(data.len());
            match cache.pcm_conversion {
                PcmConversion::Passthrough => shared.ring.push_raw(&data[..total]),
                PcmConversion::Widen16To32 => shared.ring.push_16_to_32(&data[..total]),
                PcmConversion::Pack24In32 => shared.ring.push_24_packed(&data[..total]),
            }
        };
        drop(cache);

        if consumed > 0 {
            if !shared.prefill_complete.load(Ordering::Acquire)
                && shared.ring.available() >= shared.prefill_target.load(Ordering::Acquire)
            {
                shared.prefill_complete.store(true, Ordering::Release);
                debug!(available = shared.ring.available(), "prefill complete");
            }
            let count = shared.push_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count <= 3 || count % 500 == 0 {
                trace!(count, consumed, available = shared.ring.available(), "push");
            }
        }
        consumed
    }

    /// Ring fill level in [0, 1] for upstream backpressure
    pub fn buffer_level(&self) -> f32 {
        let guard = RingGuard::enter(&self.shared);
        if !guard.active() {
            return 0.0;
        }
        self.shared.ring.fill_level()
    }

    /// Free ring space in bytes
    pub fn available_space(&self) -> usize {
        let guard = RingGuard::enter(&self.shared);
        if !guard.active() {
            return 0;
        }
        self.shared.ring.free_space()
    }

    pub fn can_accept(&self) -> bool {
        self.available_space() > 0
            && !self.shared.draining.load(Ordering::Acquire)
            && !self.shared.stop_requested.load(Ordering::Acquire)
    }

    /// Frames of real audio delivered to the sink since the last open
    pub fn position_frames(&self) -> u64 {
        let popped = self.shared.popped_bytes.load(Ordering::Relaxed);
        let rate = self.shared.sample_rate.load(Ordering::Acquire) as u128;
        let byte_rate = self.shared.wire_byte_rate.load(Ordering::Acquire).max(1) as u128;
        (popped as u128 * rate / byte_rate) as u64
    }

    /// Seconds of real audio delivered to the sink since the last open
    pub fn position_seconds(&self) -> u64 {
        let popped = self.shared.popped_bytes.load(Ordering::Relaxed);
        let byte_rate = self.shared.wire_byte_rate.load(Ordering::Acquire).max(1) as u64;
        popped / byte_rate
    }

    /// Wait (bounded) for the buffered audio to reach the sink
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.ring.available() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Discard buffered audio and require a fresh prefill. Used on seek:
    /// the consumer flips to silence the moment the prefill flag drops.
    pub fn flush(&self) {
        self.shared.prefill_complete.store(false, Ordering::Release);
        self.shared.ring.clear();
        self.shared.popped_bytes.store(0, Ordering::Release);
        let state = self.shared.state.get();
        if state == CoreState::Playing || state == CoreState::Warmup {
            self.shared.state.set(CoreState::Prefilling);
        }
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn state(&self) -> CoreState {
        self.shared.state.get()
    }

    pub fn underruns(&self) -> u32 {
        self.shared.underrun_count.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycle_count.load(Ordering::Relaxed)
    }

    /// Whether the transport link is believed up
    pub fn is_online(&self) -> bool {
        self.shared.transport_online.load(Ordering::Acquire)
    }

    /// Poll the transport's live link state, refreshing the producer-side
    /// mirror. Skipped (returning the mirror) when a session operation is
    /// in flight.
    pub fn refresh_online(&self) -> bool {
        if let Ok(session) = self.session.try_lock() {
            if session.connected {
                let online = session.transport.is_online();
                self.shared.transport_online.store(online, Ordering::Release);
                return online;
            }
        }
        self.shared.transport_online.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn request_shutdown_silence(&self, cycles: u32) {
        self.shared.draining.store(true, Ordering::Release);
        self.shared.silence_remaining.store(cycles, Ordering::Release);
        debug!(cycles, "shutdown silence requested");
    }

    /// Bounded wait for the silence burst to be consumed; proceeds on
    /// timeout.
    fn wait_silence_drained(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.shared.silence_remaining.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                debug!("silence drain timed out");
                break;
            }
            std::thread::yield_now();
        }
    }

    fn wait_callback_quiesced(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.shared.callback_active.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("cycle callback did not quiesce in time");
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_for_online(session: &mut Session, timeout: Duration) -> bool {
        let start = Instant::now();
        while !session.transport.is_online() {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "sink online");
        true
    }

    fn report_underruns(&self) {
        let underruns = self.shared.underrun_count.swap(0, Ordering::Relaxed);
        if underruns > 0 {
            warn!(underruns, "session had underruns");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::loopback::LoopbackSink;

    fn enabled_core() -> (AudioCore, crate::sink::loopback::LoopbackHandle) {
        let (sink, handle) = LoopbackSink::new(false);
        let core = AudioCore::new(Box::new(sink), RendererConfig::default());
        core.enable().unwrap();
        (core, handle)
    }

    #[test]
    fn enable_transitions_to_enabled() {
        let (core, handle) = enabled_core();
        assert_eq!(core.state(), CoreState::Enabled);
        assert!(handle.session_open());
        // Idempotent
        core.enable().unwrap();
        assert_eq!(core.state(), CoreState::Enabled);
    }

    #[test]
    fn open_before_enable_is_invalid() {
        let (sink, _handle) = LoopbackSink::new(false);
        let core = AudioCore::new(Box::new(sink), RendererConfig::default());
        let err = core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn push_rejected_before_open() {
        let (core, _handle) = enabled_core();
        assert_eq!(core.push(&[0u8; 64], 16), 0);
    }

    #[test]
    fn open_reaches_prefilling_and_accepts_pushes() {
        let (core, handle) = enabled_core();
        core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();
        assert_eq!(core.state(), CoreState::Prefilling);
        assert!(handle.is_playing());

        let block = vec![0u8; 1764]; // 10ms of 44.1/16/2
        let consumed = core.push(&block, 441);
        assert_eq!(consumed, 1764);
    }

    #[test]
    fn prefill_flag_released_on_threshold() {
        let (core, _handle) = enabled_core();
        core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();

        // 40ms prefill of 176400 B/s = 7056 bytes
        let block = vec![0u8; 3528];
        core.push(&block, 882);
        assert!(!core.shared.prefill_complete.load(Ordering::Acquire));
        core.push(&block, 882);
        assert!(core.shared.prefill_complete.load(Ordering::Acquire));
    }

    #[test]
    fn push_returns_zero_during_reconfigure() {
        let (core, _handle) = enabled_core();
        core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();

        core.shared.reconfiguring.store(true, Ordering::Release);
        assert_eq!(core.push(&[0u8; 64], 16), 0);
        core.shared.reconfiguring.store(false, Ordering::Release);
        assert_eq!(core.push(&[0u8; 64], 16), 64);
    }

    #[test]
    fn unsupported_format_keeps_state_enabled() {
        let (core, handle) = enabled_core();
        handle.set_accept_policy(crate::sink::loopback::AcceptPolicy {
            pcm_bits: vec![],
            dsd: vec![],
            dsd_minimal: false,
            ..Default::default()
        });
        let err = core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
        assert_eq!(core.state(), CoreState::Enabled);
    }

    #[test]
    fn negotiation_prefers_widest_pcm() {
        let (core, handle) = enabled_core();
        core.open(AudioFormat::pcm(44_100, 16, 2)).unwrap();
        let session = core.session.lock().unwrap();
        let negotiated = session.negotiated.unwrap();
        assert_eq!(negotiated.wire_bits, 32);
        assert_eq!(negotiated.pcm_conversion, PcmConversion::Widen16To32);
        drop(session);
        let accepted = handle.accepted_formats();
        assert_eq!(
            accepted.last().unwrap(),
            &FormatDescriptor::Pcm { rate: 44_100, channels: 2, bits: 32 }
        );
    }

    #[test]
    fn dsd_warmup_target_scales_with_multiplier() {
        let (core, _handle) = enabled_core();
        core.open(AudioFormat::dsd(crate::engine::format::DSD64_RATE, 2, DsdSourceOrder::Lsb))
            .unwrap();
        let dsd64_target = core.shared.stabilization_target.load(Ordering::Acquire);

        core.open(AudioFormat::dsd(crate::engine::format::DSD64_RATE * 8, 2, DsdSourceOrder::Lsb))
            .unwrap();
        let dsd512_target = core.shared.stabilization_target.load(Ordering::Acquire);

        assert!(dsd512_target > dsd64_target);
        assert!(dsd512_target <= WARMUP_CYCLES_MAX);
        assert!(dsd64_target >= WARMUP_CYCLES_MIN);
    }
}
