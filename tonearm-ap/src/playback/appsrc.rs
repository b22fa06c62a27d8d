//! Application-fed playback
//!
//! [`AudioHandle::set_appsrc`] stores caps and data callbacks here and
//! points the playbin at `appsrc://`. When the pipeline creates the
//! matching source, source-setup configures it from the stored values. Any
//! other source resets the slot, so buffers are never pushed into a stale
//! source.
//!
//! [`AudioHandle::set_appsrc`]: crate::AudioHandle::set_appsrc

use crate::pipeline::{ElementRef, PropertyValue, SignalHandle};
use crate::playback::core::GST_TARGET;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// URI that makes the playbin create an application source
pub const APPSRC_URI: &str = "appsrc://";

/// Source queue limit: 1 MiB
const MAX_BYTES: u64 = 1 << 20;
/// Queue fill (percent) below which the source asks for more data
const MIN_PERCENT: u64 = 50;

/// Called with a length hint in milliseconds when the source wants data
pub type NeedDataCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Called when the source queue is full
pub type EnoughDataCallback = Arc<dyn Fn() + Send + Sync>;

/// Called with the position in milliseconds data must continue from
pub type SeekDataCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Data callbacks for an application source
///
/// Callbacks run on pipeline threads. `enough_data` can fire from inside
/// `emit_data`, on the actor thread, so none of them may wait on the
/// [`AudioHandle`](crate::AudioHandle).
#[derive(Clone, Default)]
pub struct AppSrcCallbacks {
    pub need_data: Option<NeedDataCallback>,
    pub enough_data: Option<EnoughDataCallback>,
    pub seek_data: Option<SeekDataCallback>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct SlotState {
    caps: Option<String>,
    callbacks: AppSrcCallbacks,
    source: Option<ElementRef>,
    signals: Vec<SignalHandle>,
}

/// Pending application source configuration and the source it applies to
#[derive(Default)]
pub(crate) struct AppSrcSlot {
    state: Mutex<SlotState>,
}

impl AppSrcSlot {
    /// Store what the next application source is configured with
    pub(crate) fn prepare(&self, caps: Option<String>, callbacks: AppSrcCallbacks) {
        let old = {
            let mut st = lock(&self.state);
            st.source = None;
            st.caps = caps;
            st.callbacks = callbacks;
            std::mem::take(&mut st.signals)
        };
        // Disconnect outside the lock
        drop(old);
    }

    pub(crate) fn reset(&self) {
        self.prepare(None, AppSrcCallbacks::default());
    }

    /// Configure a freshly created application source
    pub(crate) fn configure(&self, source: &ElementRef) {
        let Some(app) = source.as_app_src() else {
            warn!("Source {} is not an application source", source.name());
            return;
        };

        let mut st = lock(&self.state);
        let mut settings = vec![
            ("format", PropertyValue::Str("time".to_string())),
            ("stream-type", PropertyValue::Str("seekable".to_string())),
            ("max-bytes", PropertyValue::UInt(MAX_BYTES)),
            ("min-percent", PropertyValue::UInt(MIN_PERCENT)),
        ];
        if let Some(caps) = &st.caps {
            settings.push(("caps", PropertyValue::Str(caps.clone())));
        }
        for (name, value) in settings {
            if let Err(e) = source.set_property(name, value) {
                warn!("Failed to configure appsrc {}: {}", name, e);
            }
        }

        let callbacks = st.callbacks.clone();
        if let Some(callback) = callbacks.need_data {
            st.signals
                .push(app.connect_need_data(Box::new(move |hint| callback(hint))));
        }
        if let Some(callback) = callbacks.seek_data {
            st.signals
                .push(app.connect_seek_data(Box::new(move |position| callback(position))));
        }
        if let Some(callback) = callbacks.enough_data {
            st.signals
                .push(app.connect_enough_data(Box::new(move || callback())));
        }

        debug!(
            target: GST_TARGET,
            "Configured appsrc {}: caps={:?}", source.name(), st.caps
        );
        st.source = Some(Arc::clone(source));
    }

    /// Push a buffer, or the end-of-stream token for `None`
    ///
    /// Returns false when no application source is active or it refused
    /// the data.
    pub(crate) fn push(&self, buffer: Option<Vec<u8>>) -> bool {
        let source = lock(&self.state).source.clone();
        let Some(source) = source else {
            return false;
        };
        let Some(app) = source.as_app_src() else {
            return false;
        };

        match buffer {
            Some(buffer) => app.push_buffer(buffer),
            None => {
                debug!(target: GST_TARGET, "Sending appsrc end-of-stream event.");
                app.end_of_stream()
            }
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        lock(&self.state).source.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::simulated::SimulatedEngine;
    use crate::pipeline::MediaEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_push_without_source_is_refused() {
        let slot = AppSrcSlot::default();
        slot.prepare(Some("audio/x-raw".to_string()), AppSrcCallbacks::default());

        assert!(!slot.is_active());
        assert!(!slot.push(Some(vec![0; 16])));
        assert!(!slot.push(None));
    }

    #[test]
    fn test_configure_sets_caps_and_limits() {
        let engine = SimulatedEngine::default();
        let source = engine.make_element("appsrc", None).unwrap();
        let slot = AppSrcSlot::default();
        slot.prepare(
            Some("audio/x-raw,format=S16LE,rate=44100,channels=2".to_string()),
            AppSrcCallbacks::default(),
        );

        slot.configure(&source);

        assert!(slot.is_active());
        assert_eq!(
            source.property("caps").as_ref().and_then(|v| v.as_str()),
            Some("audio/x-raw,format=S16LE,rate=44100,channels=2")
        );
        assert_eq!(source.property("max-bytes"), Some(PropertyValue::UInt(1 << 20)));
        assert_eq!(source.property("min-percent"), Some(PropertyValue::UInt(50)));
        assert_eq!(
            source.property("stream-type"),
            Some(PropertyValue::Str("seekable".to_string()))
        );
        assert!(slot.push(Some(vec![0; 64])));
    }

    #[test]
    fn test_enough_data_fires_at_queue_limit() {
        let engine = SimulatedEngine::default();
        let source = engine.make_element("appsrc", None).unwrap();
        let full = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&full);
        let slot = AppSrcSlot::default();
        slot.prepare(
            None,
            AppSrcCallbacks {
                enough_data: Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..AppSrcCallbacks::default()
            },
        );
        slot.configure(&source);

        assert!(slot.push(Some(vec![0; 1 << 19])));
        assert_eq!(full.load(Ordering::SeqCst), 0);
        assert!(slot.push(Some(vec![0; 1 << 19])));
        assert_eq!(full.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_disconnects_callbacks() {
        let engine = SimulatedEngine::default();
        let source = engine.make_element("appsrc", None).unwrap();
        let full = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&full);
        let slot = AppSrcSlot::default();
        slot.prepare(
            None,
            AppSrcCallbacks {
                enough_data: Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..AppSrcCallbacks::default()
            },
        );
        slot.configure(&source);
        slot.reset();

        assert!(!slot.is_active());
        let app = source.as_app_src().unwrap();
        assert!(app.push_buffer(vec![0; 1 << 21]));
        assert_eq!(full.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_other_elements_are_not_configured() {
        let engine = SimulatedEngine::default();
        let source = engine.make_element("filesrc", None).unwrap();
        let slot = AppSrcSlot::default();
        slot.prepare(Some("audio/x-raw".to_string()), AppSrcCallbacks::default());

        slot.configure(&source);
        assert!(!slot.is_active());
    }
}
