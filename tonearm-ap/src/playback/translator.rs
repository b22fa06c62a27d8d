//! Bus message translation
//!
//! Reconciles the pipeline's raw, sometimes redundant and sometimes missing
//! notifications into the three-state playback model and the audio event
//! vocabulary.
//!
//! State change rules, applied in order:
//!
//! 1. `(new=READY, pending=NULL)` is treated as `(new=NULL, pending=VOID)`.
//!    The pipeline never posts its final READY to NULL step.
//! 2. Messages with a pending state are intermediate steps and are ignored.
//! 3. READY has no playback state and is ignored.
//! 4. The playback state is updated. If the recorded target has no playback
//!    state (a request raced the confirmation) no event is sent.
//! 5. `state_changed` carries the target only while it differs from the new
//!    state. Reaching STOPPED also sends `stream_changed(None)`.

use crate::pipeline::{BufferingMode, BusMessage, State};
use crate::playback::core::{AudioCore, GST_TARGET};
use std::collections::BTreeSet;
use std::time::Duration;
use tonearm_common::tags::{describe, merge_changed};
use tonearm_common::{AudioEvent, PlaybackState, Tags};
use tracing::{debug, error, info, trace, warn};

/// Buffer fill (percent) below which playback is paused to rebuffer
pub const BUFFERING_LOW_WATERMARK: u32 = 10;

fn playback_state(state: State) -> Option<PlaybackState> {
    match state {
        State::Playing => Some(PlaybackState::Playing),
        State::Paused => Some(PlaybackState::Paused),
        State::Null => Some(PlaybackState::Stopped),
        State::Ready | State::VoidPending => None,
    }
}

/// Stateless bus message handler; all state lives in `AudioCore`
#[derive(Debug, Default, Clone, Copy)]
pub struct EventTranslator;

impl EventTranslator {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn handle(&self, core: &mut AudioCore, message: BusMessage) {
        trace!(target: GST_TARGET, "Handling {} bus message", message.kind());
        match message {
            BusMessage::StateChanged {
                src,
                old,
                new,
                pending,
            } => {
                if src != core.playbin.name() {
                    trace!(target: GST_TARGET, "Ignoring state change of {}", src);
                    return;
                }
                self.on_state_changed(core, old, new, pending);
            }
            BusMessage::Buffering { percent, mode } => {
                if percent > 100 {
                    debug!(target: GST_TARGET, "Dropping malformed BUFFERING message: percent={}", percent);
                    return;
                }
                self.on_buffering(core, percent, mode);
            }
            BusMessage::Eos => self.on_end_of_stream(core),
            BusMessage::Error { message, debug: details } => {
                self.on_error(core, &message, details.as_deref())
            }
            BusMessage::Warning { message, debug: details } => {
                warn!(target: GST_TARGET, "Pipeline warning: {}", message);
                debug!(target: GST_TARGET, "Got WARNING bus message: warning={:?} debug={:?}", message, details);
            }
            BusMessage::AsyncDone => debug!(target: GST_TARGET, "Got ASYNC_DONE bus message."),
            BusMessage::Tag(tags) => self.on_tag(core, tags),
            BusMessage::MissingPlugin {
                description,
                installer_detail,
            } => {
                debug!(target: GST_TARGET, "Got missing-plugin bus message: description={:?}", description);
                warn!("Could not find a {} to handle media.", description);
                if let Some(detail) = installer_detail {
                    info!("You might be able to fix this by running: 'gst-installer \"{}\"'", detail);
                }
            }
            BusMessage::StreamStart => self.on_stream_start(core),
            BusMessage::Segment { position } => self.on_segment(core, position),
            BusMessage::Other { kind } => trace!(target: GST_TARGET, "Ignoring {} bus message", kind),
        }
    }

    fn on_state_changed(&self, core: &mut AudioCore, old: State, new: State, pending: State) {
        debug!(
            target: GST_TARGET,
            "Got STATE_CHANGED bus message: old={} new={} pending={}", old, new, pending
        );

        let (new, pending) = if new == State::Ready && pending == State::Null {
            (State::Null, State::VoidPending)
        } else {
            (new, pending)
        };

        if pending != State::VoidPending {
            return;
        }

        if new == State::Ready {
            return;
        }

        let Some(new_state) = playback_state(new) else {
            debug!(target: GST_TARGET, "Dropping state change to {}", new);
            return;
        };
        let old_state = std::mem::replace(&mut core.state, new_state);

        let Some(target_state) = playback_state(core.target_state) else {
            warn!(
                "Race condition happened: confirmed {} while targeting {}",
                new_state, core.target_state
            );
            return;
        };
        let target_state = (target_state != new_state).then_some(target_state);

        debug!(
            "Audio event: state_changed(old_state={}, new_state={}, target_state={:?})",
            old_state, new_state, target_state
        );
        core.emit(AudioEvent::StateChanged {
            old_state,
            new_state,
            target_state,
        });

        if new_state == PlaybackState::Stopped {
            debug!("Audio event: stream_changed(uri=None)");
            core.emit(AudioEvent::StreamChanged { uri: None });
        }
    }

    fn on_buffering(&self, core: &mut AudioCore, percent: u32, mode: Option<BufferingMode>) {
        if core.target_state < State::Paused {
            debug!(target: GST_TARGET, "Skip buffering during track change.");
            return;
        }

        // Live sources stall in paused
        if mode == Some(BufferingMode::Live) || core.hooks.live_stream() {
            trace!(target: GST_TARGET, "Skip buffering for live source: percent={}%", percent);
            return;
        }

        let mut notable = false;
        if percent < BUFFERING_LOW_WATERMARK && !core.buffering {
            core.playbin.set_state(State::Paused);
            core.buffering = true;
            notable = true;
        }
        if percent == 100 {
            core.buffering = false;
            if core.target_state == State::Playing {
                core.playbin.set_state(State::Playing);
            }
            notable = true;
        }

        if notable {
            debug!(target: GST_TARGET, "Got BUFFERING bus message: percent={}%", percent);
        } else {
            trace!(target: GST_TARGET, "Got BUFFERING bus message: percent={}%", percent);
        }
    }

    fn on_end_of_stream(&self, core: &mut AudioCore) {
        debug!(target: GST_TARGET, "Got EOS (end of stream) bus message.");
        debug!("Audio event: reached_end_of_stream()");
        core.tags = Tags::new();
        core.emit(AudioEvent::ReachedEndOfStream);
    }

    fn on_error(&self, core: &mut AudioCore, message: &str, details: Option<&str>) {
        error!(target: GST_TARGET, "Pipeline error: {}", message);
        debug!(target: GST_TARGET, "Got ERROR bus message: error={:?} debug={:?}", message, details);
        core.set_state(State::Null);
    }

    fn on_tag(&self, core: &mut AudioCore, tags: Tags) {
        debug!(target: GST_TARGET, "Got TAG bus message: tags={}", describe(&tags));

        // Held back until the stream they belong to starts
        if let Some(pending) = core.pending_tags.as_mut() {
            pending.extend(tags);
            return;
        }

        let changed = merge_changed(&mut core.tags, tags);
        if !changed.is_empty() {
            debug!("Audio event: tags_changed(tags={:?})", changed);
            core.emit(AudioEvent::TagsChanged { tags: changed });
        }
    }

    fn on_stream_start(&self, core: &mut AudioCore) {
        debug!(target: GST_TARGET, "Got STREAM_START bus message");

        let uri = core.pending_uri.clone();
        debug!("Audio event: stream_changed(uri={:?})", uri);
        core.emit(AudioEvent::StreamChanged { uri });

        core.tags = core.pending_tags.take().unwrap_or_default();
        if !core.tags.is_empty() {
            let keys: BTreeSet<String> = core.tags.keys().cloned().collect();
            debug!("Audio event: tags_changed(tags={:?})", keys);
            core.emit(AudioEvent::TagsChanged { tags: keys });
        }

        core.flush_pending_metadata();
    }

    fn on_segment(&self, core: &mut AudioCore, position: Duration) {
        debug!(target: GST_TARGET, "Got SEGMENT event: position={:?}", position);
        let position = position.as_millis() as u64;
        debug!("Audio event: position_changed(position={})", position);
        core.emit(AudioEvent::PositionChanged { position });
    }
}
