//! Renderer wiring
//!
//! Assembles the audio core, the control adapter and the position reporter
//! into one running unit. The media-fetch/decode pipeline and the
//! discovery/control protocol front end attach from outside: the pipeline
//! pushes into [`Renderer::core`], the protocol submits commands through
//! the [`ControlHandle`] and subscribes to the event bus.

use std::sync::Arc;

use tracing::info;

use crate::config::RendererConfig;
use crate::control::{adapter::ControlAdapter, position, ControlHandle};
use crate::engine::AudioCore;
use crate::error::Result;
use crate::events::EventBus;
use crate::sink::SinkTransport;

pub struct Renderer {
    core: Arc<AudioCore>,
    events: EventBus,
    handle: Option<ControlHandle>,
    gapless: bool,
}

impl Renderer {
    pub fn new(transport: Box<dyn SinkTransport>, config: RendererConfig) -> Self {
        let gapless = config.gapless;
        Self {
            core: Arc::new(AudioCore::new(transport, config)),
            events: EventBus::default(),
            handle: None,
            gapless,
        }
    }

    /// Enable the sink session and start the control tasks.
    pub async fn start(&mut self) -> Result<ControlHandle> {
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || core.enable())
            .await
            .expect("enable task panicked")?;

        let adapter = Arc::new(ControlAdapter::new(
            Arc::clone(&self.core),
            self.events.clone(),
            self.gapless,
        ));
        let epoch = adapter.epoch();
        let handle = adapter.spawn();

        tokio::spawn(position::run(
            Arc::clone(&self.core),
            self.events.clone(),
            epoch,
        ));

        self.handle = Some(handle.clone());
        info!("renderer started");
        Ok(handle)
    }

    /// Tear everything down; the position reporter and command loop wind
    /// down on their own once the core is disabled.
    pub async fn stop(&mut self) {
        let core = Arc::clone(&self.core);
        let _ = tokio::task::spawn_blocking(move || core.disable()).await;
        self.handle = None;
        info!("renderer stopped");
    }

    /// Open a track format on behalf of the decode pipeline and announce it
    /// on the event bus. Equivalent to `core().open(format)` plus the
    /// `FormatOpened` event.
    pub async fn open_track(&self, format: crate::engine::AudioFormat) -> Result<()> {
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || core.open(format))
            .await
            .expect("open task panicked")?;
        self.events.emit(crate::events::RendererEvent::FormatOpened {
            format,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// The audio core, for the decode pipeline's open/push/close calls
    pub fn core(&self) -> Arc<AudioCore> {
        Arc::clone(&self.core)
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn control(&self) -> Option<ControlHandle> {
        self.handle.clone()
    }
}
