//! Event types for the tonearm event system
//!
//! Audio events are the stable vocabulary the audio actor republishes
//! low-level pipeline notifications as. Mixer events are emitted by the
//! software mixer when volume or mute changes.

mod playback_types;

pub use playback_types::PlaybackState;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Audio actor events
///
/// Delivered to every registered listener through a `ListenerRegistry`.
/// Serializes with an `event` tag carrying the event name, followed by the
/// keyword payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AudioEvent {
    /// The confirmed playback state changed
    StateChanged {
        /// State before the change
        old_state: PlaybackState,
        /// State after the change
        new_state: PlaybackState,
        /// State the actor is still heading to, `None` once it has arrived
        target_state: Option<PlaybackState>,
    },

    /// A new stream started playing, `None` when playback stopped
    StreamChanged { uri: Option<String> },

    /// Playback position jumped (new segment, seek or stream switch)
    PositionChanged {
        /// Position in milliseconds
        position: u64,
    },

    /// Stream tags changed
    ///
    /// Carries only the names of the keys whose values changed. Current
    /// values are available from the actor's `get_current_tags`.
    TagsChanged { tags: BTreeSet<String> },

    /// The last stream ended and nothing was queued after it
    ReachedEndOfStream,
}

impl AudioEvent {
    /// Event name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            AudioEvent::StateChanged { .. } => "state_changed",
            AudioEvent::StreamChanged { .. } => "stream_changed",
            AudioEvent::PositionChanged { .. } => "position_changed",
            AudioEvent::TagsChanged { .. } => "tags_changed",
            AudioEvent::ReachedEndOfStream => "reached_end_of_stream",
        }
    }
}

/// Mixer events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MixerEvent {
    /// Volume changed, integer percentage 0-100
    VolumeChanged { volume: u8 },
    /// Mute changed
    MuteChanged { mute: bool },
}

impl MixerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MixerEvent::VolumeChanged { .. } => "volume_changed",
            MixerEvent::MuteChanged { .. } => "mute_changed",
        }
    }
}
