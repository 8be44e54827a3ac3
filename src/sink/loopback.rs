//! In-process loopback transport
//!
//! Implements [`SinkTransport`] against a local pseudo-sink: cycles can be
//! driven manually (deterministic tests) or by a paced thread (development
//! runs without real hardware). The capability matrix is scriptable and
//! every offered/accepted format descriptor is recorded, which is what the
//! format-negotiation tests key on.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use super::{CycleCallback, FormatDescriptor, SessionOptions, SinkTransport, Target, TransferMode};
use crate::engine::cycle::CycleCalculator;
use crate::engine::format::{DsdEndian, DsdSourceOrder, SinkCapabilities};
use crate::error::{Error, Result};

/// What the pseudo-sink accepts during negotiation
#[derive(Debug, Clone)]
pub struct AcceptPolicy {
    /// Accepted PCM wire widths, any rate/channel count
    pub pcm_bits: Vec<u8>,
    /// Accepted (bit order, endian) DSD descriptors
    pub dsd: Vec<(DsdSourceOrder, DsdEndian)>,
    /// Whether the minimal DSD descriptor is accepted as a last resort
    pub dsd_minimal: bool,
    /// Max PCM rate accepted (0 = unlimited)
    pub max_pcm_rate: u32,
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        Self {
            pcm_bits: vec![16, 24, 32],
            dsd: vec![(DsdSourceOrder::Lsb, DsdEndian::Big)],
            dsd_minimal: true,
            max_pcm_rate: 0,
        }
    }
}

impl AcceptPolicy {
    fn accepts(&self, descriptor: &FormatDescriptor) -> bool {
        match descriptor {
            FormatDescriptor::Pcm { rate, bits, .. } => {
                self.pcm_bits.contains(bits)
                    && (self.max_pcm_rate == 0 || *rate <= self.max_pcm_rate)
            }
            FormatDescriptor::Dsd { bit_order, endian, .. } => {
                self.dsd.contains(&(*bit_order, *endian))
            }
            FormatDescriptor::DsdMinimal { .. } => self.dsd_minimal,
        }
    }

    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities {
            supports_pcm: !self.pcm_bits.is_empty(),
            supports_dsd: !self.dsd.is_empty() || self.dsd_minimal,
            dsd_lsb: self.dsd.iter().any(|(o, _)| *o == DsdSourceOrder::Lsb),
            dsd_msb: self.dsd.iter().any(|(o, _)| *o == DsdSourceOrder::Msb),
            dsd_big: self.dsd.iter().any(|(_, e)| *e == DsdEndian::Big),
            dsd_little: self.dsd.iter().any(|(_, e)| *e == DsdEndian::Little),
        }
    }
}

#[derive(Debug, Default)]
struct FormatLog {
    probed: Vec<FormatDescriptor>,
    offered: Vec<FormatDescriptor>,
    accepted: Vec<FormatDescriptor>,
}

struct Shared {
    accept: Mutex<AcceptPolicy>,
    log: Mutex<FormatLog>,
    callback: Mutex<Option<CycleCallback>>,

    mtu: AtomicUsize,
    mtu_probe_fails: AtomicBool,

    session_open: AtomicBool,
    connected: AtomicBool,
    online: AtomicBool,
    playing: AtomicBool,

    /// Per-cycle buffer size derived from the accepted descriptor
    cycle_bytes: AtomicUsize,
    cycle_time_us: AtomicU64,
    cycle_count: AtomicU64,

    capture: AtomicBool,
    captured: Mutex<Vec<u8>>,

    pacing: AtomicBool,
}

impl Shared {
    /// Run one transport cycle if audio is flowing. `forced` models a
    /// transport that keeps invoking the callback regardless of play state.
    fn step(&self, forced: bool) -> bool {
        if !forced
            && (!self.playing.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire))
        {
            return false;
        }
        let n = self.cycle_bytes.load(Ordering::Acquire);
        if n == 0 {
            return false;
        }
        let mut callback = self.callback.lock().unwrap();
        let Some(cb) = callback.as_mut() else {
            return false;
        };
        let mut buf = vec![0u8; n];
        cb(&mut buf);
        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        if self.capture.load(Ordering::Acquire) {
            self.captured.lock().unwrap().extend_from_slice(&buf);
        }
        true
    }
}

/// Loopback transport half, owned by the audio core
pub struct LoopbackSink {
    shared: Arc<Shared>,
    pacer: Option<JoinHandle<()>>,
    auto_pace: bool,
}

/// Test/driver half: steps cycles, scripts capabilities, inspects traffic
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Shared>,
}

impl LoopbackSink {
    /// Create a loopback pair. `auto_pace` spawns a pacing thread between
    /// `play` and `stop`; leave it off to drive cycles manually through the
    /// handle.
    pub fn new(auto_pace: bool) -> (Self, LoopbackHandle) {
        let shared = Arc::new(Shared {
            accept: Mutex::new(AcceptPolicy::default()),
            log: Mutex::new(FormatLog::default()),
            callback: Mutex::new(None),
            mtu: AtomicUsize::new(1500),
            mtu_probe_fails: AtomicBool::new(false),
            session_open: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            online: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            cycle_bytes: AtomicUsize::new(0),
            cycle_time_us: AtomicU64::new(0),
            cycle_count: AtomicU64::new(0),
            capture: AtomicBool::new(false),
            captured: Mutex::new(Vec::new()),
            pacing: AtomicBool::new(false),
        });
        (
            Self {
                shared: Arc::clone(&shared),
                pacer: None,
                auto_pace,
            },
            LoopbackHandle { shared },
        )
    }

    fn start_pacer(&mut self) {
        if !self.auto_pace || self.shared.pacing.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.pacer = Some(std::thread::spawn(move || {
            while shared.pacing.load(Ordering::Acquire) {
                if !shared.step(false) {
                    std::thread::sleep(Duration::from_micros(200));
                    continue;
                }
                let us = shared.cycle_time_us.load(Ordering::Acquire);
                // Pace well below real time so development runs stay
                // responsive without starving the producer
                std::thread::sleep(Duration::from_micros(us.min(2_000).max(100)));
            }
        }));
    }

    fn stop_pacer(&mut self) {
        self.shared.pacing.store(false, Ordering::Release);
        if let Some(handle) = self.pacer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoopbackSink {
    fn drop(&mut self) {
        self.stop_pacer();
    }
}

impl SinkTransport for LoopbackSink {
    fn discover(&mut self) -> Result<Vec<Target>> {
        Ok(vec![Target {
            index: 0,
            name: "Loopback".to_string(),
            output_name: None,
            version: "local".to_string(),
            product_id: 0,
        }])
    }

    fn measure_mtu(&mut self, _target: &Target) -> Result<u32> {
        if self.shared.mtu_probe_fails.load(Ordering::Acquire) {
            return Err(Error::Transport("mtu probe failed".into()));
        }
        Ok(self.shared.mtu.load(Ordering::Acquire) as u32)
    }

    fn open_session(&mut self, options: &SessionOptions) -> Result<()> {
        debug!(client = %options.client_name, "loopback session open");
        self.shared.session_open.store(true, Ordering::Release);
        Ok(())
    }

    fn close_session(&mut self) {
        self.stop_pacer();
        self.shared.session_open.store(false, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);
        self.shared.online.store(false, Ordering::Release);
        self.shared.playing.store(false, Ordering::Release);
    }

    fn query_capabilities(&mut self, _target: &Target) -> Result<SinkCapabilities> {
        Ok(self.shared.accept.lock().unwrap().capabilities())
    }

    fn check_format(&mut self, descriptor: &FormatDescriptor) -> bool {
        let accepted = self.shared.accept.lock().unwrap().accepts(descriptor);
        self.shared.log.lock().unwrap().probed.push(*descriptor);
        accepted
    }

    fn set_sink_format(
        &mut self,
        _target: &Target,
        descriptor: &FormatDescriptor,
        cycle_time: Duration,
        mtu: u32,
    ) -> Result<bool> {
        let accepted = self.shared.accept.lock().unwrap().accepts(descriptor);
        let mut log = self.shared.log.lock().unwrap();
        log.offered.push(*descriptor);
        if !accepted {
            return Ok(false);
        }
        log.accepted.push(*descriptor);
        drop(log);

        let bytes = match descriptor {
            FormatDescriptor::Pcm { rate, channels, bits } => {
                let wire_bytes = match bits {
                    32 => 4,
                    24 => 3,
                    _ => 2,
                };
                CycleCalculator::pcm_bytes_per_cycle(*rate, *channels, wire_bytes)
            }
            FormatDescriptor::Dsd { bit_rate, channels, .. }
            | FormatDescriptor::DsdMinimal { bit_rate, channels } => {
                CycleCalculator::dsd_bytes_per_cycle(bit_rate / 8, *channels)
            }
        };
        self.shared.cycle_bytes.store(bytes, Ordering::Release);
        self.shared
            .cycle_time_us
            .store(cycle_time.as_micros() as u64, Ordering::Release);
        debug!(?descriptor, bytes, mtu, "loopback accepted format");
        Ok(true)
    }

    fn apply_transfer_mode(&mut self, mode: TransferMode, _cycle_time: Duration) {
        debug!(?mode, "loopback transfer mode");
    }

    fn connect_prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.shared.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn connect_wait(&mut self) -> Result<()> {
        self.shared.online.store(true, Ordering::Release);
        Ok(())
    }

    fn disconnect(&mut self, _wait: bool) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.online.store(false, Ordering::Release);
        self.shared.playing.store(false, Ordering::Release);
    }

    fn play(&mut self) {
        self.shared.playing.store(true, Ordering::Release);
        self.start_pacer();
    }

    fn stop(&mut self) {
        self.shared.playing.store(false, Ordering::Release);
    }

    fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::Acquire)
    }

    fn register_cycle_callback(&mut self, callback: CycleCallback) {
        *self.shared.callback.lock().unwrap() = Some(callback);
    }
}

impl LoopbackHandle {
    /// Drive `n` cycles synchronously. Returns how many actually ran
    /// (cycles only run while playing and connected).
    pub fn step_cycles(&self, n: usize) -> usize {
        (0..n).filter(|_| self.shared.step(false)).count()
    }

    /// Drive `n` cycles even when stopped, like a transport that keeps
    /// pulling after `stop`. The callback must still answer every one.
    pub fn step_cycles_forced(&self, n: usize) -> usize {
        (0..n).filter(|_| self.shared.step(true)).count()
    }

    pub fn set_accept_policy(&self, policy: AcceptPolicy) {
        *self.shared.accept.lock().unwrap() = policy;
    }

    pub fn set_mtu(&self, mtu: u32) {
        self.shared.mtu.store(mtu as usize, Ordering::Release);
    }

    pub fn fail_mtu_probe(&self, fail: bool) {
        self.shared.mtu_probe_fails.store(fail, Ordering::Release);
    }

    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Release);
    }

    pub fn probed_formats(&self) -> Vec<FormatDescriptor> {
        self.shared.log.lock().unwrap().probed.clone()
    }

    pub fn offered_formats(&self) -> Vec<FormatDescriptor> {
        self.shared.log.lock().unwrap().offered.clone()
    }

    pub fn accepted_formats(&self) -> Vec<FormatDescriptor> {
        self.shared.log.lock().unwrap().accepted.clone()
    }

    pub fn clear_format_log(&self) {
        *self.shared.log.lock().unwrap() = FormatLog::default();
    }

    pub fn cycle_bytes(&self) -> usize {
        self.shared.cycle_bytes.load(Ordering::Acquire)
    }

    pub fn cycle_count(&self) -> u64 {
        self.shared.cycle_count.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn session_open(&self) -> bool {
        self.shared.session_open.load(Ordering::Acquire)
    }

    /// Start recording every byte handed to the transport
    pub fn capture(&self, enable: bool) {
        if enable {
            self.shared.captured.lock().unwrap().clear();
        }
        self.shared.capture.store(enable, Ordering::Release);
    }

    pub fn captured(&self) -> Vec<u8> {
        self.shared.captured.lock().unwrap().clone()
    }
}
