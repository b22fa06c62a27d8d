//! Audio output chain and mixers

pub mod mixer;
pub mod output;

pub use mixer::{register_builtin_mixers, Mixer, MixerRegistry, SoftwareMixer, SoftwareMixerAdapter};
pub use output::{OutputGraph, OutputGraphBuilder, VolumeControl};
