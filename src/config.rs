//! Renderer configuration

use std::time::Duration;

/// Renderer configuration
///
/// Collected from the CLI and passed to [`AudioCore::enable`].
///
/// [`AudioCore::enable`]: crate::engine::AudioCore::enable
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Friendly name announced to control points and to the sink
    pub name: String,

    /// Device UUID announced to control points
    pub uuid: uuid::Uuid,

    /// Zero-based index into the discovered target list
    pub target_index: usize,

    /// Network interface to bind, if restricted (e.g. "eth0")
    pub interface: Option<String>,

    /// MTU override; when set, path-MTU measurement is skipped
    pub mtu_override: Option<u32>,

    /// MTU used when measurement fails and no override is set
    pub mtu_fallback: u32,

    /// Session cycle time used before the first format is negotiated
    pub initial_cycle_time: Duration,

    /// Transport worker thread mode, passed through to the sink session
    pub thread_mode: u8,

    /// How long open() waits for the transport to report online before
    /// proceeding anyway
    pub online_wait: Duration,

    /// Settle delay for a reconfigure (format change without a clock-domain
    /// change)
    pub format_switch_delay: Duration,

    /// Gapless track transitions enabled
    pub gapless: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            name: "Resona Renderer".to_string(),
            uuid: uuid::Uuid::new_v4(),
            target_index: 0,
            interface: None,
            mtu_override: None,
            mtu_fallback: 1500,
            initial_cycle_time: Duration::from_micros(10_000),
            thread_mode: 0,
            online_wait: Duration::from_secs(2),
            format_switch_delay: Duration::from_millis(150),
            gapless: true,
        }
    }
}
