//! Audio actor harness

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::sync::Arc;
use tonearm_ap::audio::{Mixer, SoftwareMixer};
use tonearm_ap::pipeline::simulated::{SimulatedConfig, SimulatedEngine};
use tonearm_ap::pipeline::MediaEngine;
use tonearm_ap::{Audio, AudioHandle};
use tonearm_common::config::AudioConfig;
use tonearm_common::{AudioEvent, Subscription, TagValue, Tags};

/// Audio configuration writing to the fake sink
pub fn test_audio_config() -> AudioConfig {
    AudioConfig {
        output: "testoutput".to_string(),
        ..AudioConfig::default()
    }
}

pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), vec![TagValue::from(*v)]))
        .collect()
}

/// Running audio actor plus the simulated engine behind it
pub struct TestPlayer {
    pub engine: SimulatedEngine,
    pub audio: AudioHandle,
    pub mixer: Arc<SoftwareMixer>,
    pub events: Subscription<AudioEvent>,
}

impl TestPlayer {
    pub fn start() -> Result<Self> {
        Self::with_config(SimulatedConfig::default(), test_audio_config())
    }

    pub fn with_engine(config: SimulatedConfig) -> Result<Self> {
        Self::with_config(config, test_audio_config())
    }

    pub fn with_config(sim: SimulatedConfig, config: AudioConfig) -> Result<Self> {
        let engine = SimulatedEngine::new(sim);
        let mixer = Arc::new(SoftwareMixer::new());
        let media: Arc<dyn MediaEngine> = Arc::new(engine.clone());
        let software: Arc<dyn Mixer> = mixer.clone();

        let audio = Audio::start(&config, media, Some(software)).context("start audio actor")?;
        let events = audio.subscribe();

        Ok(Self {
            engine,
            audio,
            mixer,
            events,
        })
    }

    /// Wait for the pipeline to settle and every message to be handled
    pub async fn settle(&self) -> Result<()> {
        self.audio.wait_for_state_change().await?;
        Ok(())
    }

    /// Load `uri` and start playing it
    pub async fn play(&self, uri: &str) -> Result<()> {
        self.audio.prepare_change().await?;
        self.audio.set_uri(uri, false, false).await?;
        self.audio.start_playback().await?;
        self.settle().await
    }

    /// End the current track from a streaming thread, then settle
    ///
    /// Returns whether a queued URI took over.
    pub async fn finish_track(&self) -> Result<bool> {
        let engine = self.engine.clone();
        let switched = tokio::task::spawn_blocking(move || engine.finish_track()).await?;
        self.settle().await?;
        Ok(switched)
    }

    pub fn drain(&mut self) -> Vec<AudioEvent> {
        self.events.drain()
    }

    /// State and stream events only
    pub fn drain_transitions(&mut self) -> Vec<AudioEvent> {
        self.drain()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    AudioEvent::StateChanged { .. } | AudioEvent::StreamChanged { .. }
                )
            })
            .collect()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.audio.shutdown().await?;
        Ok(())
    }
}
