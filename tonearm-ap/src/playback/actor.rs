//! Audio actor
//!
//! `Audio::start` builds the pipeline and its sink chain, then hands them to
//! a dedicated `audio-actor` thread. Every operation on [`AudioHandle`] is a
//! command in the actor's mailbox; bus messages are pushed into the same
//! mailbox by the bus subscription, so pipeline state is only ever touched
//! from one thread.

use crate::audio::{Mixer, OutputGraphBuilder, SoftwareMixerAdapter};
use crate::error::{Error, Result};
use crate::pipeline::{BusMessage, MediaEngine, PlayFlags, Pipeline, PropertyValue, State};
use crate::playback::appsrc::AppSrcCallbacks;
use crate::playback::core::{AudioCore, Connections, CoreParts};
use crate::playback::hooks::{AboutToFinishCallback, Hooks, SourceSetupCallback};
use crate::playback::metadata::TrackMetadata;
use crate::playback::translator::EventTranslator;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tonearm_common::config::{AudioConfig, MixerKind};
use tonearm_common::{AudioEvent, ListenerRegistry, PlaybackState, Subscription, Tags};
use tracing::{debug, info, warn};

/// Playbin download buffer: 5 MiB
const BUFFER_SIZE_BYTES: i64 = 5 << 20;
/// Playbin download buffer: 5 seconds
const BUFFER_DURATION_NS: i64 = 5_000_000_000;

pub(crate) enum Command {
    SetUri {
        uri: String,
        live_stream: bool,
        download: bool,
        reply: oneshot::Sender<()>,
    },
    SetAppSrc {
        caps: String,
        callbacks: AppSrcCallbacks,
        reply: oneshot::Sender<()>,
    },
    EmitData(Option<Vec<u8>>, oneshot::Sender<bool>),
    SetAboutToFinish(Option<AboutToFinishCallback>, oneshot::Sender<()>),
    SetSourceSetup(Option<SourceSetupCallback>, oneshot::Sender<()>),
    GetPosition(oneshot::Sender<u64>),
    SetPosition(u64, oneshot::Sender<bool>),
    SetState(State, oneshot::Sender<bool>),
    GetTags(oneshot::Sender<Tags>),
    GetState(oneshot::Sender<PlaybackState>),
    SetMetadata(TrackMetadata, oneshot::Sender<()>),
    /// Round trip through the mailbox
    Sync(oneshot::Sender<()>),
    Bus(BusMessage),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Read-only view of the pipeline state, usable off the actor thread
#[derive(Clone)]
struct StateWatch {
    playbin: Arc<dyn Pipeline>,
}

impl StateWatch {
    /// Block until no state change is in flight
    fn wait_settled(&self) {
        let (result, current, pending) = self.playbin.get_state(None);
        debug!(
            target: "tonearm_ap::gst",
            "Pipeline settled: result={:?} current={} pending={}", result, current, pending
        );
    }
}

struct HandleInner {
    tx: mpsc::UnboundedSender<Command>,
    listeners: Arc<ListenerRegistry<AudioEvent>>,
    mixer: Option<Arc<SoftwareMixerAdapter>>,
    hooks: Arc<Hooks>,
    watch: StateWatch,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Actor may already be gone after an explicit shutdown
        let _ = self.tx.send(Command::Shutdown(None));
    }
}

/// Entry point for starting the audio actor
pub struct Audio;

impl Audio {
    /// Build the pipeline and start the actor thread
    ///
    /// `mixer` is bound to the sink chain's volume element when it is the
    /// software mixer and the configuration selects it. Unusable output
    /// descriptions fail here; a failing visualizer only logs a warning.
    pub fn start(
        config: &AudioConfig,
        engine: Arc<dyn MediaEngine>,
        mixer: Option<Arc<dyn Mixer>>,
    ) -> Result<AudioHandle> {
        config.validate()?;

        let playbin = engine.make_playbin()?;
        playbin.set_property(
            "flags",
            PropertyValue::UInt(u64::from(PlayFlags::AUDIO.bits())),
        )?;
        playbin.set_property("buffer-size", PropertyValue::Int(BUFFER_SIZE_BYTES))?;
        playbin.set_property("buffer-duration", PropertyValue::Int(BUFFER_DURATION_NS))?;

        let builder = OutputGraphBuilder::new(engine.as_ref(), config);
        let graph = builder.build(playbin.as_ref())?;
        let visualizer_active = builder.setup_visualizer(playbin.as_ref());

        let listeners = Arc::new(ListenerRegistry::new());
        let hooks = Arc::new(Hooks::default());
        let (tx, rx) = mpsc::unbounded_channel();

        let bus_tx = tx.clone();
        let bus = playbin.subscribe_bus(Box::new(move |message| {
            // Closed mailbox means the actor is shutting down
            let _ = bus_tx.send(Command::Bus(message));
        }));

        let finish_hooks = Arc::clone(&hooks);
        let about_to_finish =
            playbin.connect_about_to_finish(Box::new(move || finish_hooks.on_about_to_finish()));
        let setup_hooks = Arc::clone(&hooks);
        let source_setup =
            playbin.connect_source_setup(Box::new(move |source| setup_hooks.on_source_setup(source)));

        let software = mixer.as_ref().and_then(|m| m.as_software());
        let adapter = match (config.mixer_kind(), software) {
            (MixerKind::Software, Some(software)) => {
                let adapter = Arc::new(SoftwareMixerAdapter::new(
                    graph.volume.clone(),
                    software.event_registry(),
                ));
                software.setup(Arc::clone(&adapter));
                Some(adapter)
            }
            (MixerKind::Software, None) => {
                warn!("Software mixer configured but none given, volume control disabled");
                None
            }
            (kind, _) => {
                debug!("Software volume not bound: mixer={:?}", kind);
                None
            }
        };

        let watch = StateWatch {
            playbin: Arc::clone(&playbin),
        };

        let core = AudioCore::new(CoreParts {
            playbin,
            queue: graph.queue,
            mixer: adapter.clone(),
            software_mixer: mixer,
            listeners: Arc::clone(&listeners),
            hooks: Arc::clone(&hooks),
            connections: Connections {
                bus: Some(bus),
                signals: vec![about_to_finish, source_setup],
            },
            visualizer_active,
        });

        thread::Builder::new()
            .name("audio-actor".to_string())
            .spawn(move || run(core, rx))
            .map_err(|e| Error::Internal(format!("Failed to spawn audio actor: {}", e)))?;

        info!("Audio actor started: output={}", config.output);

        Ok(AudioHandle {
            inner: Arc::new(HandleInner {
                tx,
                listeners,
                mixer: adapter,
                hooks,
                watch,
            }),
        })
    }
}

fn run(mut core: AudioCore, mut rx: mpsc::UnboundedReceiver<Command>) {
    core.hooks.bind_actor_thread();
    let translator = EventTranslator::new();

    // Reply failures mean the caller stopped waiting
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Bus(message) => translator.handle(&mut core, message),
            Command::SetUri {
                uri,
                live_stream,
                download,
                reply,
            } => {
                core.set_uri(uri, live_stream, download);
                let _ = reply.send(());
            }
            Command::SetAppSrc {
                caps,
                callbacks,
                reply,
            } => {
                core.set_appsrc(caps, callbacks);
                let _ = reply.send(());
            }
            Command::EmitData(buffer, reply) => {
                let _ = reply.send(core.emit_data(buffer));
            }
            Command::SetAboutToFinish(callback, reply) => {
                core.hooks.set_about_to_finish(callback);
                let _ = reply.send(());
            }
            Command::SetSourceSetup(callback, reply) => {
                core.hooks.set_source_setup(callback);
                let _ = reply.send(());
            }
            Command::GetPosition(reply) => {
                let _ = reply.send(core.get_position());
            }
            Command::SetPosition(position, reply) => {
                let _ = reply.send(core.set_position(position));
            }
            Command::SetState(state, reply) => {
                let _ = reply.send(core.set_state(state));
            }
            Command::GetTags(reply) => {
                let _ = reply.send(core.tags.clone());
            }
            Command::GetState(reply) => {
                let _ = reply.send(core.state);
            }
            Command::SetMetadata(metadata, reply) => {
                core.set_metadata(metadata);
                let _ = reply.send(());
            }
            Command::Sync(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                core.teardown();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                break;
            }
        }
    }

    info!("Audio actor stopped");
}

/// Cloneable handle to the audio actor
///
/// Dropping the last handle stops the actor. A handle captured by an
/// about-to-finish callback keeps the actor alive until [`shutdown`] is
/// called, so hosts should always shut down explicitly.
///
/// [`shutdown`]: AudioHandle::shutdown
#[derive(Clone)]
pub struct AudioHandle {
    inner: Arc<HandleInner>,
}

impl AudioHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(make(reply))
            .map_err(|_| Error::ActorStopped)?;
        rx.await.map_err(|_| Error::ActorStopped)
    }

    /// Queue `uri` as the next stream
    ///
    /// Outside a gapless callback, call [`prepare_change`] first.
    ///
    /// [`prepare_change`]: AudioHandle::prepare_change
    pub async fn set_uri(&self, uri: &str, live_stream: bool, download: bool) -> Result<()> {
        let uri = uri.to_string();
        self.request(|reply| Command::SetUri {
            uri,
            live_stream,
            download,
            reply,
        })
        .await
    }

    /// Synchronous `set_uri` for about-to-finish callbacks
    ///
    /// Blocks the calling thread until the actor has applied the URI. Fails
    /// on the actor thread itself and must not be called from async code.
    pub fn blocking_set_uri(&self, uri: &str, live_stream: bool, download: bool) -> Result<()> {
        if self.inner.hooks.on_actor_thread() {
            return Err(Error::Internal(
                "blocking_set_uri called on the audio actor thread".to_string(),
            ));
        }

        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::SetUri {
                uri: uri.to_string(),
                live_stream,
                download,
                reply,
            })
            .map_err(|_| Error::ActorStopped)?;
        rx.blocking_recv().map_err(|_| Error::ActorStopped)
    }

    /// Play raw audio pushed with [`emit_data`] instead of a URI
    ///
    /// `caps` describes the audio format to expect. Call [`prepare_change`]
    /// first, as for [`set_uri`].
    ///
    /// [`emit_data`]: AudioHandle::emit_data
    /// [`prepare_change`]: AudioHandle::prepare_change
    /// [`set_uri`]: AudioHandle::set_uri
    pub async fn set_appsrc(&self, caps: &str, callbacks: AppSrcCallbacks) -> Result<()> {
        let caps = caps.to_string();
        self.request(|reply| Command::SetAppSrc {
            caps,
            callbacks,
            reply,
        })
        .await
    }

    /// Deliver raw audio to the application source
    ///
    /// `None` queues the end-of-stream token; `reached_end_of_stream` is
    /// sent once playback gets there. Returns whether the data was
    /// delivered.
    pub async fn emit_data(&self, buffer: Option<Vec<u8>>) -> Result<bool> {
        self.request(|reply| Command::EmitData(buffer, reply)).await
    }

    /// Same as `emit_data(None)`
    pub async fn emit_end_of_stream(&self) -> Result<()> {
        self.emit_data(None).await.map(|_| ())
    }

    /// Replace the about-to-finish callback, `None` clears it
    ///
    /// The callback runs on a pipeline streaming thread shortly before the
    /// current stream ends; it should call [`blocking_set_uri`] to play the
    /// next track gaplessly.
    ///
    /// [`blocking_set_uri`]: AudioHandle::blocking_set_uri
    pub async fn set_about_to_finish_callback(
        &self,
        callback: Option<AboutToFinishCallback>,
    ) -> Result<()> {
        self.request(|reply| Command::SetAboutToFinish(callback, reply))
            .await
    }

    pub async fn set_source_setup_callback(
        &self,
        callback: Option<SourceSetupCallback>,
    ) -> Result<()> {
        self.request(|reply| Command::SetSourceSetup(callback, reply))
            .await
    }

    /// Playback position in milliseconds, 0 when unknown
    pub async fn get_position(&self) -> Result<u64> {
        self.request(Command::GetPosition).await
    }

    /// Seek to `position` milliseconds; returns whether the seek was accepted
    pub async fn set_position(&self, position: u64) -> Result<bool> {
        self.request(|reply| Command::SetPosition(position, reply))
            .await
    }

    pub async fn start_playback(&self) -> Result<bool> {
        self.request(|reply| Command::SetState(State::Playing, reply))
            .await
    }

    pub async fn pause_playback(&self) -> Result<bool> {
        self.request(|reply| Command::SetState(State::Paused, reply))
            .await
    }

    /// Move to READY, ahead of a `set_uri`
    pub async fn prepare_change(&self) -> Result<bool> {
        self.request(|reply| Command::SetState(State::Ready, reply))
            .await
    }

    pub async fn stop_playback(&self) -> Result<bool> {
        self.request(|reply| Command::SetState(State::Null, reply))
            .await
    }

    /// Tags of the stream now playing
    pub async fn get_current_tags(&self) -> Result<Tags> {
        self.request(Command::GetTags).await
    }

    /// Last confirmed playback state
    pub async fn state(&self) -> Result<PlaybackState> {
        self.request(Command::GetState).await
    }

    /// Inject track metadata as a tag event
    ///
    /// Held back while a stream start is pending, then sent right after it.
    pub async fn set_metadata(&self, metadata: TrackMetadata) -> Result<()> {
        self.request(|reply| Command::SetMetadata(metadata, reply))
            .await
    }

    /// Wait until the pipeline has no state change in flight and every
    /// message it posted has been handled
    pub async fn wait_for_state_change(&self) -> Result<()> {
        self.request(Command::Sync).await?;

        let watch = self.inner.watch.clone();
        tokio::task::spawn_blocking(move || watch.wait_settled())
            .await
            .map_err(|e| Error::Internal(format!("State watch failed: {}", e)))?;

        // Messages the actor posts while draining land behind the first pass
        for _ in 0..2 {
            self.request(Command::Sync).await?;
        }
        Ok(())
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry<AudioEvent>> {
        &self.inner.listeners
    }

    /// Subscribe to audio events
    pub fn subscribe(&self) -> Subscription<AudioEvent> {
        self.inner.listeners.subscribe()
    }

    /// Software mixer binding, when the software mixer is in use
    pub fn mixer(&self) -> Option<Arc<SoftwareMixerAdapter>> {
        self.inner.mixer.clone()
    }

    /// Tear down the pipeline and stop the actor
    ///
    /// Later calls on any clone of this handle fail with
    /// [`Error::ActorStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown(Some(reply))).await
    }
}
