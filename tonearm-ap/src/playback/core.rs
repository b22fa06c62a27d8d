//! Audio actor state
//!
//! `AudioCore` is owned by the actor thread and is only ever touched from
//! it. It holds the pipeline, the authoritative playback state and the tag
//! buffers, and implements the operations behind `AudioHandle`.

use crate::audio::{Mixer, SoftwareMixerAdapter};
use crate::pipeline::{
    BusSubscription, ElementRef, PlayFlags, Pipeline, PropertyValue, SeekFlags, SignalHandle,
    State, StateChangeReturn,
};
use crate::playback::appsrc::{AppSrcCallbacks, APPSRC_URI};
use crate::playback::hooks::Hooks;
use crate::playback::metadata::TrackMetadata;
use std::sync::Arc;
use std::time::Duration;
use tonearm_common::tags::describe;
use tonearm_common::{AudioEvent, ListenerRegistry, PlaybackState, Tags};
use tracing::{debug, warn};

pub(crate) const GST_TARGET: &str = "tonearm_ap::gst";

/// Pipeline connections released on teardown
#[derive(Default)]
pub(crate) struct Connections {
    pub(crate) bus: Option<BusSubscription>,
    pub(crate) signals: Vec<SignalHandle>,
}

pub(crate) struct AudioCore {
    pub(crate) playbin: Arc<dyn Pipeline>,
    queue: ElementRef,
    pub(crate) mixer: Option<Arc<SoftwareMixerAdapter>>,
    software_mixer: Option<Arc<dyn Mixer>>,
    listeners: Arc<ListenerRegistry<AudioEvent>>,
    pub(crate) hooks: Arc<Hooks>,
    connections: Connections,
    visualizer_active: bool,

    /// Confirmed playback state
    pub(crate) state: PlaybackState,
    /// Pipeline state last requested
    pub(crate) target_state: State,
    /// Paused by the buffering policy, waiting for 100%
    pub(crate) buffering: bool,
    /// Tags of the stream now playing
    pub(crate) tags: Tags,
    /// URI handed to the pipeline, reported on the next stream start
    pub(crate) pending_uri: Option<String>,
    /// Tags collected for a stream that has not started yet
    pub(crate) pending_tags: Option<Tags>,
    pending_metadata: Option<Tags>,
}

pub(crate) struct CoreParts {
    pub(crate) playbin: Arc<dyn Pipeline>,
    pub(crate) queue: ElementRef,
    pub(crate) mixer: Option<Arc<SoftwareMixerAdapter>>,
    pub(crate) software_mixer: Option<Arc<dyn Mixer>>,
    pub(crate) listeners: Arc<ListenerRegistry<AudioEvent>>,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) connections: Connections,
    pub(crate) visualizer_active: bool,
}

impl AudioCore {
    pub(crate) fn new(parts: CoreParts) -> Self {
        Self {
            playbin: parts.playbin,
            queue: parts.queue,
            mixer: parts.mixer,
            software_mixer: parts.software_mixer,
            listeners: parts.listeners,
            hooks: parts.hooks,
            connections: parts.connections,
            visualizer_active: parts.visualizer_active,
            state: PlaybackState::Stopped,
            target_state: State::Null,
            buffering: false,
            tags: Tags::new(),
            pending_uri: None,
            pending_tags: None,
            pending_metadata: None,
        }
    }

    pub(crate) fn emit(&self, event: AudioEvent) {
        self.listeners.send(event);
    }

    /// Request a raw pipeline state
    ///
    /// Records the target before asking the pipeline, so the translator can
    /// tell confirmations of this request from stale ones.
    pub(crate) fn set_state(&mut self, state: State) -> bool {
        if state < State::Paused {
            self.buffering = false;
        }

        self.target_state = state;
        let result = self.playbin.set_state(state);
        debug!(target: GST_TARGET, "Changing state to {}: result={:?}", state, result);

        if result == StateChangeReturn::Failure {
            warn!("Setting pipeline state to {} failed", state);
            return false;
        }
        true
    }

    pub(crate) fn set_uri(&mut self, uri: String, live_stream: bool, download: bool) {
        // Volume does not survive a URI change on every platform
        let current_volume = self.mixer.as_ref().map(|m| m.get_volume());

        let mut flags = PlayFlags::AUDIO;
        if download {
            flags = flags | PlayFlags::DOWNLOAD;
        }
        if self.visualizer_active {
            flags = flags | PlayFlags::VIS;
        }

        debug!("Flags: {:#x}", flags.bits());
        if live_stream && download {
            warn!("Ambiguous buffering flags: 'live_stream' and 'download' should not both be set");
        }

        self.pending_uri = Some(uri.clone());
        self.pending_tags = Some(Tags::new());
        self.hooks.set_live_stream(live_stream);

        if let Err(e) = self
            .playbin
            .set_property("flags", PropertyValue::UInt(u64::from(flags.bits())))
        {
            warn!("Failed to set play flags: {}", e);
        }
        if let Err(e) = self.playbin.set_property("uri", PropertyValue::Str(uri)) {
            warn!("Failed to set uri: {}", e);
        }

        if let (Some(mixer), Some(volume)) = (&self.mixer, current_volume) {
            mixer.set_volume(volume);
        }
    }

    /// Switch to an application source fed through `emit_data`
    pub(crate) fn set_appsrc(&mut self, caps: String, callbacks: AppSrcCallbacks) {
        self.hooks.appsrc.prepare(Some(caps), callbacks);
        self.set_uri(APPSRC_URI.to_string(), false, false);
    }

    pub(crate) fn emit_data(&self, buffer: Option<Vec<u8>>) -> bool {
        if !self.hooks.appsrc.is_active() {
            debug!("No application source to deliver data to");
            return false;
        }
        self.hooks.appsrc.push(buffer)
    }

    /// Position in milliseconds, 0 when unknown
    pub(crate) fn get_position(&self) -> u64 {
        match self.playbin.query_position() {
            Some(position) => position.as_millis() as u64,
            None => {
                debug!("Position query failed");
                0
            }
        }
    }

    pub(crate) fn set_position(&self, position_ms: u64) -> bool {
        debug!(target: GST_TARGET, "Sending flushing seek: position={}ms", position_ms);
        // Seek on the sink queue rather than the playbin, which would
        // forward the event to every sink
        self.queue
            .seek_simple(Duration::from_millis(position_ms), SeekFlags::FLUSH)
    }

    pub(crate) fn set_metadata(&mut self, metadata: TrackMetadata) {
        let tags = metadata.to_tags();
        if self.pending_tags.is_some() {
            debug!("Stream start pending, queueing metadata");
            self.pending_metadata = Some(tags);
        } else {
            self.send_tags(tags, metadata.uri.as_deref());
        }
    }

    pub(crate) fn flush_pending_metadata(&mut self) {
        if let Some(tags) = self.pending_metadata.take() {
            self.send_tags(tags, None);
        }
    }

    fn send_tags(&self, tags: Tags, uri: Option<&str>) {
        let summary = describe(&tags);
        if self.playbin.send_tag_event(tags) {
            debug!(target: GST_TARGET, "Sent tag event: track={} tags={}", uri.unwrap_or("-"), summary);
        } else {
            warn!("Pipeline rejected tag event");
        }
    }

    /// Release pipeline connections, stop the pipeline and the mixer
    pub(crate) fn teardown(&mut self) {
        if let Some(mixer) = self.software_mixer.as_ref().and_then(|m| m.as_software()) {
            mixer.teardown();
        }

        self.connections.bus = None;
        self.connections.signals.clear();
        self.hooks.clear();

        if self.playbin.set_state(State::Null) == StateChangeReturn::Failure {
            warn!("Failed to stop pipeline during teardown");
        }
        self.target_state = State::Null;
        debug!("Audio pipeline torn down");
    }
}
