//! # Resona
//!
//! Networked audio renderer for synchronous LAN audio sinks.
//!
//! **Purpose:** present a media-rendering endpoint to control points on the
//! local network and forward decoded audio, bit-perfect and
//! sample-accurate, to an isochronous LAN sink over its synchronous
//! transport.
//!
//! **Architecture:** a lock-free byte ring decouples the bursty producer
//! (decoded PCM/DSD pushed from the network) from the strictly periodic
//! consumer (the sink's per-cycle pull). The [`engine::AudioCore`] state
//! machine owns prefill, warmup, drain and format-change disciplines; the
//! [`control`] layer translates protocol commands and reports position.
//! The sink transport itself is vendored and reached through the
//! [`sink::SinkTransport`] trait.

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod renderer;
pub mod sink;

pub use config::RendererConfig;
pub use error::{Error, Result};
pub use renderer::Renderer;
