//! Pipeline signal hooks
//!
//! About-to-finish and source-setup fire synchronously on engine streaming
//! threads. They never enter the actor mailbox; they only read the callback
//! slots, the live-stream flag and the application source slot shared here.

use crate::pipeline::{Element, ElementRef, PropertyValue};
use crate::playback::appsrc::AppSrcSlot;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::{debug, error, warn};

/// Gapless lookahead callback; must call `blocking_set_uri` before returning
pub type AboutToFinishCallback = Arc<dyn Fn() + Send + Sync>;

/// Called with every new source element, before it starts
pub type SourceSetupCallback = Arc<dyn Fn(&dyn Element) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub(crate) struct Hooks {
    actor_thread: OnceCell<ThreadId>,
    about_to_finish: Mutex<Option<AboutToFinishCallback>>,
    source_setup: Mutex<Option<SourceSetupCallback>>,
    live_stream: AtomicBool,
    pub(crate) appsrc: AppSrcSlot,
}

impl Hooks {
    /// Record the calling thread as the actor thread
    pub(crate) fn bind_actor_thread(&self) {
        if self.actor_thread.set(thread::current().id()).is_err() {
            warn!("Audio actor thread already bound");
        }
    }

    pub(crate) fn on_actor_thread(&self) -> bool {
        self.actor_thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn set_about_to_finish(&self, callback: Option<AboutToFinishCallback>) {
        *lock(&self.about_to_finish) = callback;
    }

    pub(crate) fn set_source_setup(&self, callback: Option<SourceSetupCallback>) {
        *lock(&self.source_setup) = callback;
    }

    pub(crate) fn set_live_stream(&self, live: bool) {
        self.live_stream.store(live, Ordering::SeqCst);
    }

    pub(crate) fn live_stream(&self) -> bool {
        self.live_stream.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.set_about_to_finish(None);
        self.set_source_setup(None);
        self.appsrc.reset();
    }

    pub(crate) fn on_about_to_finish(&self) {
        if self.on_actor_thread() {
            error!("about-to-finish in actor, aborting to avoid deadlock");
            return;
        }

        debug!(target: "tonearm_ap::gst", "Got about-to-finish event");
        let callback = lock(&self.about_to_finish).clone();
        if let Some(callback) = callback {
            debug!("Running about-to-finish callback");
            callback();
        }
    }

    pub(crate) fn on_source_setup(&self, source: &ElementRef) {
        debug!(target: "tonearm_ap::gst", "Got source-setup signal: element={}", source.factory());

        if source.as_app_src().is_some() {
            self.appsrc.configure(source);
        } else {
            self.appsrc.reset();
        }

        let callback = lock(&self.source_setup).clone();
        if let Some(callback) = callback {
            debug!("Running source-setup callback");
            callback(source.as_ref());
        }

        if self.live_stream() && source.has_property("is-live") {
            debug!(target: "tonearm_ap::gst", "Enabling live stream mode");
            if let Err(e) = source.set_property("is-live", PropertyValue::Bool(true)) {
                warn!("Failed to enable live mode on {}: {}", source.name(), e);
            }
        }
    }
}
