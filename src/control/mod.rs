//! Control-protocol boundary
//!
//! The discovery/control protocol itself lives outside this crate; what
//! lives here is the thin translator between its commands and the audio
//! core, plus the slow position reporter. Commands arrive over an mpsc
//! channel, events leave over the broadcast bus.

pub mod adapter;
pub mod position;

pub use adapter::{ControlAdapter, ControlCommand, ControlHandle, MediaInfo, PositionInfo, TransportInfo};
