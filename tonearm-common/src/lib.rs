//! # Tonearm Common Library
//!
//! Shared code for the tonearm audio player and its listeners:
//! - Domain playback state and event types (`AudioEvent`, `MixerEvent`)
//! - Stream tag maps
//! - Listener registry for fan-out event delivery
//! - TOML configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod tags;

pub use error::{Error, Result};
pub use events::{AudioEvent, MixerEvent, PlaybackState};
pub use listener::{AudioListener, ListenerGuard, ListenerRegistry, Subscription};
pub use tags::{TagValue, Tags};
