//! Audio Player (tonearm-ap) - Main entry point
//!
//! Starts the audio actor on the simulated engine and plays the given URIs
//! back to back, logging every audio and mixer event as JSON.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tonearm_ap::audio::{register_builtin_mixers, Mixer, MixerRegistry, SoftwareMixer};
use tonearm_ap::pipeline::simulated::SimulatedEngine;
use tonearm_ap::pipeline::MediaEngine;
use tonearm_ap::Audio;
use tonearm_common::config::{MixerKind, TomlConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for tonearm-ap
#[derive(Parser, Debug)]
#[command(name = "tonearm-ap")]
#[command(about = "Audio playback actor for the tonearm music server")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "tonearm.toml", env = "TONEARM_CONFIG")]
    config: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(short, long, env = "TONEARM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Simulated length of every track
    #[arg(long, default_value = "30", env = "TONEARM_TRACK_SECONDS")]
    track_seconds: u64,

    /// URIs to play, in order
    uris: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let config = if config_found {
        TomlConfig::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        TomlConfig::default()
    };

    // Initialize tracing
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    if !config_found {
        warn!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
    }
    info!("Starting tonearm audio player: output={}", config.audio.output);

    // Mixer
    register_builtin_mixers();
    let registry = MixerRegistry::global();
    let mixer: Option<Arc<dyn Mixer>> = match config.audio.mixer_kind() {
        MixerKind::Disabled => {
            info!("Mixer disabled");
            None
        }
        MixerKind::Software => registry.create(SoftwareMixer::NAME, &config.audio),
        MixerKind::Named(name) => Some(registry.create(&name, &config.audio).with_context(
            || format!("Unknown mixer \"{}\", available: {:?}", name, registry.names()),
        )?),
    };
    if let (Some(mixer), Some(volume)) = (&mixer, config.audio.mixer_volume) {
        mixer.set_volume(volume);
    }

    let mixer_log = mixer.as_ref().map(|mixer| {
        mixer.events().register(|event| match serde_json::to_string(&event) {
            Ok(json) => info!(target: "tonearm_ap::events", "{}", json),
            Err(e) => warn!("Failed to serialize mixer event: {}", e),
        })
    });

    // Audio actor
    let engine = SimulatedEngine::default();
    let media: Arc<dyn MediaEngine> = Arc::new(engine.clone());
    let audio = Audio::start(&config.audio, media, mixer)
        .context("Failed to start audio actor")?;
    info!("Audio actor initialized");

    let audio_log = audio
        .listeners()
        .register(|event| match serde_json::to_string(&event) {
            Ok(json) => info!(target: "tonearm_ap::events", "{}", json),
            Err(e) => warn!("Failed to serialize audio event: {}", e),
        });

    let mut playlist: VecDeque<String> = args.uris.into_iter().collect();
    let driver = match playlist.pop_front() {
        Some(first) => {
            let upcoming = Arc::new(Mutex::new(playlist));
            let next_handle = audio.clone();
            audio
                .set_about_to_finish_callback(Some(Arc::new(move || {
                    let next = upcoming
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .pop_front();
                    if let Some(uri) = next {
                        if let Err(e) = next_handle.blocking_set_uri(&uri, false, false) {
                            error!("Failed to queue {}: {}", uri, e);
                        }
                    }
                })))
                .await?;

            audio.prepare_change().await?;
            audio.set_uri(&first, false, false).await?;
            audio.start_playback().await?;

            let track_length = Duration::from_secs(args.track_seconds);
            Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(track_length).await;
                    let engine = engine.clone();
                    match tokio::task::spawn_blocking(move || engine.finish_track()).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            error!("Track driver failed: {}", e);
                            break;
                        }
                    }
                }
            }))
        }
        None => {
            info!("No URIs given, idling until shutdown");
            None
        }
    };

    match driver {
        Some(mut driver) => {
            tokio::select! {
                _ = shutdown_signal() => driver.abort(),
                _ = &mut driver => info!("Playlist finished"),
            }
        }
        None => shutdown_signal().await,
    }

    audio.stop_playback().await?;
    audio.shutdown().await?;
    drop(audio_log);
    drop(mixer_log);

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
