//! Out-of-band track metadata
//!
//! Sources that carry no tags of their own (raw pushed audio, some network
//! streams) can have metadata injected into the pipeline as a tag event.

use serde::{Deserialize, Serialize};
use tonearm_common::{TagValue, Tags};

/// Blank value sent for missing fields so downstream outputs (shoutcast)
/// clear what they showed for the previous track
const BLANK: &str = " ";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub uri: Option<String>,
    pub title: Option<String>,
    pub artists: Vec<String>,
    pub album: Option<String>,
}

impl TrackMetadata {
    pub fn to_tags(&self) -> Tags {
        let artists: Vec<&str> = self
            .artists
            .iter()
            .map(String::as_str)
            .filter(|a| !a.is_empty())
            .collect();
        let artist = if artists.is_empty() {
            BLANK.to_string()
        } else {
            artists.join(", ")
        };

        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(BLANK)
                .to_string()
        };

        let mut tags = Tags::new();
        tags.insert("artist".to_string(), vec![TagValue::Str(artist)]);
        tags.insert("title".to_string(), vec![TagValue::Str(non_empty(&self.title))]);
        tags.insert("album".to_string(), vec![TagValue::Str(non_empty(&self.album))]);
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_defaults() {
        let tags = TrackMetadata::default().to_tags();
        assert_eq!(tags["artist"], vec![TagValue::from(" ")]);
        assert_eq!(tags["title"], vec![TagValue::from(" ")]);
        assert_eq!(tags["album"], vec![TagValue::from(" ")]);
    }

    #[test]
    fn test_artists_joined() {
        let metadata = TrackMetadata {
            title: Some("Song".to_string()),
            artists: vec!["A".to_string(), String::new(), "B".to_string()],
            ..TrackMetadata::default()
        };
        let tags = metadata.to_tags();
        assert_eq!(tags["artist"], vec![TagValue::from("A, B")]);
        assert_eq!(tags["title"], vec![TagValue::from("Song")]);
    }
}
