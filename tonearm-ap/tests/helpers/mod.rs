//! Test helpers for tonearm-ap integration tests
//!
//! - TestPlayer: audio actor on a simulated engine with a subscribed event
//!   stream and a software mixer

pub mod test_player;

pub use test_player::{tags, test_audio_config, TestPlayer};
