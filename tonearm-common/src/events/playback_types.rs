//! Playback-related type definitions

use serde::{Deserialize, Serialize};

/// Playback state enumeration
///
/// The domain view of the media pipeline. The pipeline's transient READY
/// state has no counterpart here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Paused,
    Playing,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Playing => write!(f, "playing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_stopped() {
        assert_eq!(PlaybackState::default(), PlaybackState::Stopped);
    }

    #[test]
    fn test_serializes_lowercase() {
        let json = serde_json::to_string(&PlaybackState::Playing).unwrap();
        assert_eq!(json, "\"playing\"");
        assert_eq!(PlaybackState::Paused.to_string(), "paused");
    }
}
