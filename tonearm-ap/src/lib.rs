//! # Tonearm Audio Player Library (tonearm-ap)
//!
//! Audio playback actor for a music server.
//!
//! **Purpose:** Own one media pipeline, turn playback intents (play, pause,
//! stop, seek, volume) into pipeline operations, and republish the
//! pipeline's bus traffic as a small, stable set of audio events.
//!
//! **Architecture:** A dedicated actor thread owns the pipeline. Callers talk
//! to it through a cloneable async `AudioHandle`; bus messages from engine
//! threads are marshaled into the same mailbox and reconciled by the
//! `EventTranslator`.

pub mod audio;
pub mod error;
pub mod pipeline;
pub mod playback;

pub use error::{Error, Result};
pub use playback::{Audio, AudioHandle, TrackMetadata};
