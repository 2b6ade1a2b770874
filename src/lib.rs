//! Live Narrator - real-time spoken narration over a duplex AI session
//!
//! Streams microphone audio and periodic scene snapshots to a live
//! multimodal model and plays its spoken replies back without gaps:
//! - Microphone capture in fixed 16 kHz PCM16 blocks
//! - JPEG scene snapshots on a fixed cadence
//! - Gapless scheduling of narrated speech on the output clock
//! - Immediate flush when the narrator interrupts itself
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Inputs                              │
//! │   Microphone (cpal)   │   Frame source (image)       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 SessionManager                       │
//! │  Transport │ Decoder │ Scheduler │ Interruptions     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Live model (websocket, JSON)               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod frame;
pub mod session;

pub use audio::CpalBackend;
pub use config::Config;
pub use error::{Error, Result};
pub use frame::{FrameSource, ImageFileSource};
pub use session::{
    LiveTransport, NarratorEvent, PlaybackScheduler, SessionManager, SessionState, Transport,
    TransportEvent,
};
