//! Playback actor
//!
//! Owns the playbin and republishes its bus traffic as [`AudioEvent`]s.
//!
//! [`AudioEvent`]: tonearm_common::AudioEvent

pub mod actor;
pub mod appsrc;
mod core;
mod hooks;
pub mod metadata;
pub mod translator;

pub use actor::{Audio, AudioHandle};
pub use appsrc::{AppSrcCallbacks, APPSRC_URI};
pub use hooks::{AboutToFinishCallback, SourceSetupCallback};
pub use metadata::TrackMetadata;
pub use translator::{EventTranslator, BUFFERING_LOW_WATERMARK};
