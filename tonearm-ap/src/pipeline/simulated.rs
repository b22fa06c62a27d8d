//! Simulated media engine
//!
//! An in-process engine with playbin-like semantics:
//!
//! - Upward changes past READY preroll asynchronously on a streaming thread
//!   and are confirmed on the bus (tags, stream-start, segment, state
//!   changes, async-done).
//! - Downward changes are synchronous and stepwise. The message for the
//!   final step into NULL is not posted (configurable), like the real
//!   playbin.
//! - A newer request supersedes a preroll still in flight; the stale
//!   confirmation is never posted.
//! - Setting `uri` while prerolled queues it for the next gapless switch,
//!   performed by [`SimulatedEngine::finish_track`].
//! - Sources are picked by URI scheme. An `appsrc` asks for data once it
//!   prerolls and after every seek, and posts EOS when its end-of-stream
//!   token is queued.
//!
//! The engine simulates a single playbin: every pipeline and element made
//! from one engine shares its state.

use super::{
    AboutToFinishHandler, AppSrc, AudioSinkGraph, BusMessage, BusSink, BusSubscription,
    Connection, Element, ElementError, ElementRef, EnoughDataHandler, MediaEngine,
    NeedDataHandler, Pipeline, PlayFlags, PropertyValue, SeekDataHandler, SeekFlags,
    SignalHandle, SourceSetupHandler, State, StateChangeReturn,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tonearm_common::Tags;
use tracing::{debug, error, trace, warn};

const PIPELINE_NAME: &str = "playbin";

/// Simulated engine behaviour
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Time a preroll takes on the streaming thread
    pub preroll_delay: Duration,

    /// When false, state requests are only recorded and nothing is posted.
    /// Tests then drive the bus by hand with [`SimulatedEngine::post`].
    pub auto_advance: bool,

    /// Skip the bus message for the final step into NULL
    pub drop_final_null_transition: bool,

    /// Tags posted when a URI starts streaming
    pub tags: HashMap<String, Tags>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            preroll_delay: Duration::from_millis(5),
            auto_advance: true,
            drop_final_null_transition: true,
            tags: HashMap::new(),
        }
    }
}

impl SimulatedConfig {
    /// Record-only engine for driving the bus by hand
    pub fn manual() -> Self {
        Self {
            auto_advance: false,
            ..Self::default()
        }
    }

    pub fn with_tags(mut self, uri: &str, tags: Tags) -> Self {
        self.tags.insert(uri.to_string(), tags);
        self
    }
}

type BusHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;
type FinishHandler = Arc<dyn Fn() + Send + Sync>;
type SetupHandler = Arc<dyn Fn(&ElementRef) + Send + Sync>;
type DataHandler = Arc<dyn Fn(u64) + Send + Sync>;
type NotifyHandler = Arc<dyn Fn() + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn state_changed(old: State, new: State, pending: State) -> BusMessage {
    BusMessage::StateChanged {
        src: PIPELINE_NAME.to_string(),
        old,
        new,
        pending,
    }
}

fn step_down(state: State) -> State {
    match state {
        State::Playing => State::Paused,
        State::Paused => State::Ready,
        _ => State::Null,
    }
}

struct PrerollJob {
    generation: u64,
}

/// Work for the streaming thread
enum StreamingJob {
    Preroll(PrerollJob),
    /// Ask an application source for data from a new position
    SeekData {
        source: Arc<SimElement>,
        position: Duration,
    },
}

struct SimState {
    current: State,
    /// Target of an in-flight change, `VoidPending` once settled
    pending: State,
    target: State,
    /// Bumped by every state request; stale preroll jobs compare against it
    generation: u64,
    uri: Option<String>,
    next_uri: Option<String>,
    props: HashMap<String, PropertyValue>,
    base_position: Duration,
    playing_since: Option<Instant>,
    requests: Vec<State>,
    sent_tags: Vec<Tags>,
    sink_factories: Vec<String>,
    visualizer: Option<String>,
    last_source: Option<Arc<SimElement>>,
}

impl SimState {
    fn new() -> Self {
        let props = [
            ("flags", PropertyValue::UInt(0x17)),
            ("buffer-size", PropertyValue::Int(-1)),
            ("buffer-duration", PropertyValue::Int(-1)),
            ("volume", PropertyValue::Double(1.0)),
            ("mute", PropertyValue::Bool(false)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            current: State::Null,
            pending: State::VoidPending,
            target: State::Null,
            generation: 0,
            uri: None,
            next_uri: None,
            props,
            base_position: Duration::ZERO,
            playing_since: None,
            requests: Vec::new(),
            sent_tags: Vec::new(),
            sink_factories: Vec::new(),
            visualizer: None,
            last_source: None,
        }
    }

    fn position(&self) -> Duration {
        self.base_position + self.playing_since.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn freeze_clock(&mut self) {
        self.base_position = self.position();
        self.playing_since = None;
    }

    fn start_clock(&mut self) {
        self.playing_since = Some(Instant::now());
    }
}

struct SimCore {
    config: SimulatedConfig,
    state: Mutex<SimState>,
    settled: Condvar,
    /// Serializes every sequence of bus posts
    transition: Mutex<()>,
    bus: Mutex<HashMap<u64, BusHandler>>,
    about_to_finish: Mutex<HashMap<u64, FinishHandler>>,
    source_setup: Mutex<HashMap<u64, SetupHandler>>,
    next_id: AtomicU64,
    element_count: AtomicU64,
    jobs: Mutex<Option<mpsc::Sender<StreamingJob>>>,
}

impl SimCore {
    fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::new()),
            settled: Condvar::new(),
            transition: Mutex::new(()),
            bus: Mutex::new(HashMap::new()),
            about_to_finish: Mutex::new(HashMap::new()),
            source_setup: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            element_count: AtomicU64::new(0),
            jobs: Mutex::new(None),
        }
    }

    fn emit(&self, message: BusMessage) {
        trace!(target: "tonearm_ap::gst", "sim bus: {:?}", message);
        let sinks: Vec<BusHandler> = lock(&self.bus).values().cloned().collect();
        for sink in sinks {
            sink(message.clone());
        }
    }

    fn emit_all(&self, messages: Vec<BusMessage>) {
        for message in messages {
            self.emit(message);
        }
    }

    fn settle(&self, generation: u64) {
        {
            let mut st = lock(&self.state);
            if st.generation == generation {
                st.pending = State::VoidPending;
            }
        }
        self.settled.notify_all();
    }

    fn element_name(&self, factory: &str) -> String {
        let n = self.element_count.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", factory, n)
    }

    fn set_state(self: &Arc<Self>, target: State) -> StateChangeReturn {
        let _transition = lock(&self.transition);
        let mut st = lock(&self.state);
        st.requests.push(target);
        st.generation += 1;
        st.target = target;
        let generation = st.generation;
        let current = st.current;

        if !self.config.auto_advance {
            return if target > current {
                StateChangeReturn::Async
            } else {
                StateChangeReturn::Success
            };
        }

        if target == current {
            drop(st);
            self.settle(generation);
            return StateChangeReturn::Success;
        }

        let mut messages = Vec::new();

        if target < current {
            st.freeze_clock();
            let mut from = current;
            while from > target {
                let to = step_down(from);
                let pending = if to == target { State::VoidPending } else { target };
                let dropped = to == State::Null && self.config.drop_final_null_transition;
                if !dropped {
                    messages.push(state_changed(from, to, pending));
                }
                from = to;
            }
            st.current = target;
            st.pending = target;
            if target <= State::Ready {
                st.base_position = Duration::ZERO;
                st.next_uri = None;
            }
            drop(st);

            self.emit_all(messages);
            self.settle(generation);
            return StateChangeReturn::Success;
        }

        if current < State::Ready {
            let pending = if target == State::Ready { State::VoidPending } else { target };
            messages.push(state_changed(State::Null, State::Ready, pending));
            st.current = State::Ready;
        }

        if target == State::Ready {
            st.pending = target;
            drop(st);
            self.emit_all(messages);
            self.settle(generation);
            return StateChangeReturn::Success;
        }

        if st.current == State::Paused {
            // Already prerolled
            messages.push(state_changed(State::Paused, State::Playing, State::VoidPending));
            st.current = State::Playing;
            st.pending = target;
            st.start_clock();
            drop(st);
            self.emit_all(messages);
            self.settle(generation);
            return StateChangeReturn::Success;
        }

        if st.uri.is_none() {
            drop(st);
            messages.push(BusMessage::Error {
                message: "No URI set".to_string(),
                debug: Some(format!("{}: cannot preroll without a uri", PIPELINE_NAME)),
            });
            self.emit_all(messages);
            self.settle(generation);
            return StateChangeReturn::Failure;
        }

        st.pending = target;
        drop(st);
        self.emit_all(messages);
        self.schedule(StreamingJob::Preroll(PrerollJob { generation }));
        StateChangeReturn::Async
    }

    fn schedule(self: &Arc<Self>, job: StreamingJob) {
        let mut jobs = lock(&self.jobs);
        if jobs.is_none() {
            let (tx, rx) = mpsc::channel();
            let core = Arc::downgrade(self);
            let spawned = thread::Builder::new()
                .name("sim-streaming".to_string())
                .spawn(move || streaming_loop(core, rx));
            match spawned {
                Ok(_) => *jobs = Some(tx),
                Err(e) => {
                    error!("Failed to spawn simulated streaming thread: {}", e);
                    return;
                }
            }
        }
        if let Some(tx) = jobs.as_ref() {
            if tx.send(job).is_err() {
                warn!("Simulated streaming thread is gone, job dropped");
            }
        }
    }

    fn setup_source(self: &Arc<Self>, uri: &str) -> Arc<SimElement> {
        let factory = match uri.split_once("://").map(|(scheme, _)| scheme) {
            Some("file") => "filesrc",
            Some("http") | Some("https") => "souphttpsrc",
            _ => "appsrc",
        };
        let source = Arc::new(SimElement::new(
            self.element_name("source"),
            factory,
            Arc::downgrade(self),
        ));
        if source.has_property("location") {
            let _ = source.set_property("location", PropertyValue::Str(uri.to_string()));
        }

        debug!(target: "tonearm_ap::gst", "sim source-setup: factory={}", factory);
        let handlers: Vec<SetupHandler> = lock(&self.source_setup).values().cloned().collect();
        let element: ElementRef = source.clone();
        for handler in handlers {
            handler(&element);
        }
        source
    }

    fn preroll(self: &Arc<Self>, job: PrerollJob) {
        let uri = {
            let st = lock(&self.state);
            if st.generation != job.generation {
                trace!("sim preroll superseded before start");
                return;
            }
            st.uri.clone()
        };
        let Some(uri) = uri else {
            return;
        };

        let source = self.setup_source(&uri);

        let transition = lock(&self.transition);
        let mut st = lock(&self.state);
        if st.generation != job.generation {
            trace!("sim preroll superseded during source setup");
            return;
        }
        st.last_source = Some(Arc::clone(&source));

        let target = st.target;
        let mut messages = Vec::new();
        if let Some(tags) = self.config.tags.get(&uri) {
            messages.push(BusMessage::Tag(tags.clone()));
        }
        messages.push(BusMessage::StreamStart);
        messages.push(BusMessage::Segment {
            position: st.base_position,
        });
        let after_paused = if target == State::Playing {
            State::Playing
        } else {
            State::VoidPending
        };
        messages.push(state_changed(State::Ready, State::Paused, after_paused));
        messages.push(BusMessage::AsyncDone);
        st.current = State::Paused;

        if target == State::Playing {
            messages.push(state_changed(State::Paused, State::Playing, State::VoidPending));
            st.current = State::Playing;
            st.start_clock();
        }
        drop(st);

        self.emit_all(messages);
        self.settle(job.generation);
        drop(transition);
        source.request_data();
    }

    fn get_state(&self, timeout: Option<Duration>) -> (StateChangeReturn, State, State) {
        let mut st = lock(&self.state);
        match timeout {
            None => {
                while st.pending != State::VoidPending {
                    st = self
                        .settled
                        .wait(st)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while st.pending != State::VoidPending {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .settled
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    st = guard;
                }
            }
        }

        let result = if st.pending == State::VoidPending {
            StateChangeReturn::Success
        } else {
            StateChangeReturn::Async
        };
        (result, st.current, st.pending)
    }

    fn set_uri(&self, uri: String) {
        let mut st = lock(&self.state);
        if st.current >= State::Paused {
            debug!(target: "tonearm_ap::gst", "sim queued next uri {}", uri);
            st.next_uri = Some(uri);
        } else {
            st.uri = Some(uri);
            st.base_position = Duration::ZERO;
        }
    }

    fn seek(self: &Arc<Self>, position: Duration) -> bool {
        let _transition = lock(&self.transition);
        let mut st = lock(&self.state);
        if st.current < State::Paused {
            return false;
        }
        st.base_position = position;
        if st.current == State::Playing {
            st.start_clock();
        } else {
            st.playing_since = None;
        }
        let fed = st.last_source.clone().filter(|s| s.app.is_some());
        drop(st);
        self.emit(BusMessage::Segment { position });
        if let Some(source) = fed {
            self.schedule(StreamingJob::SeekData { source, position });
        }
        true
    }

    /// EOS from an application source
    fn source_end_of_stream(&self) -> bool {
        let _transition = lock(&self.transition);
        let mut st = lock(&self.state);
        if st.current < State::Paused {
            debug!(target: "tonearm_ap::gst", "sim appsrc end-of-stream ignored below PAUSED");
            return false;
        }
        st.freeze_clock();
        drop(st);
        self.emit(BusMessage::Eos);
        true
    }

    fn finish_track(self: &Arc<Self>) -> bool {
        let handlers: Vec<FinishHandler> = lock(&self.about_to_finish).values().cloned().collect();
        debug!(target: "tonearm_ap::gst", "sim about-to-finish: {} handler(s)", handlers.len());
        for handler in handlers {
            handler();
        }

        let next = lock(&self.state).next_uri.clone();
        let source = next.as_deref().map(|uri| self.setup_source(uri));

        let transition = lock(&self.transition);
        let mut st = lock(&self.state);
        if st.current < State::Paused {
            debug!("sim finish_track ignored below PAUSED");
            return false;
        }

        let mut messages = Vec::new();
        let switched = match st.next_uri.take() {
            Some(uri) => {
                if let Some(tags) = self.config.tags.get(&uri) {
                    messages.push(BusMessage::Tag(tags.clone()));
                }
                messages.push(BusMessage::StreamStart);
                messages.push(BusMessage::Segment {
                    position: Duration::ZERO,
                });
                st.uri = Some(uri);
                st.base_position = Duration::ZERO;
                if st.current == State::Playing {
                    st.start_clock();
                } else {
                    st.playing_since = None;
                }
                if source.is_some() {
                    st.last_source = source.clone();
                }
                true
            }
            None => {
                st.freeze_clock();
                messages.push(BusMessage::Eos);
                false
            }
        };
        drop(st);

        self.emit_all(messages);
        drop(transition);
        if let (true, Some(source)) = (switched, source) {
            source.request_data();
        }
        switched
    }

    fn make_element(
        self: &Arc<Self>,
        factory: &str,
        name: Option<&str>,
    ) -> Result<Arc<SimElement>, ElementError> {
        if factory_properties(factory).is_none() {
            return Err(ElementError::NoSuchFactory(factory.to_string()));
        }
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| self.element_name(factory));
        Ok(Arc::new(SimElement::new(name, factory, Arc::downgrade(self))))
    }

    fn parse_bin(self: &Arc<Self>, description: &str) -> Result<Arc<SimElement>, ElementError> {
        let invalid = |reason: String| ElementError::InvalidDescription {
            description: description.to_string(),
            reason,
        };

        let mut children: Vec<ElementRef> = Vec::new();
        for segment in description.split('!') {
            let mut tokens = segment.split_whitespace();
            let Some(factory) = tokens.next() else {
                return Err(invalid("empty element".to_string()));
            };
            let element = self
                .make_element(factory, None)
                .map_err(|e| invalid(e.to_string()))?;
            for token in tokens {
                let Some((key, value)) = token.split_once('=') else {
                    return Err(invalid(format!("expected key=value, got '{}'", token)));
                };
                element
                    .set_property(key, parse_value(value))
                    .map_err(|e| invalid(e.to_string()))?;
            }
            children.push(element);
        }

        for pair in children.windows(2) {
            pair[0].link(&pair[1])?;
        }

        Ok(Arc::new(SimElement::bin(
            self.element_name("bin"),
            children,
            Arc::downgrade(self),
        )))
    }
}

fn streaming_loop(core: Weak<SimCore>, jobs: mpsc::Receiver<StreamingJob>) {
    while let Ok(job) = jobs.recv() {
        match job {
            StreamingJob::Preroll(job) => {
                let delay = match core.upgrade() {
                    Some(core) => core.config.preroll_delay,
                    None => break,
                };
                thread::sleep(delay);
                match core.upgrade() {
                    Some(core) => core.preroll(job),
                    None => break,
                }
            }
            StreamingJob::SeekData { source, position } => source.request_seek(position),
        }
    }
    trace!("sim streaming thread exiting");
}

fn parse_value(raw: &str) -> PropertyValue {
    let raw = raw.trim_matches('"');
    match raw {
        "true" => return PropertyValue::Bool(true),
        "false" => return PropertyValue::Bool(false),
        _ => {}
    }
    if let Ok(v) = raw.parse::<i64>() {
        return PropertyValue::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return PropertyValue::Double(v);
    }
    PropertyValue::Str(raw.to_string())
}

/// Convert `value` to the type of `existing`, if compatible
fn coerce(existing: &PropertyValue, value: PropertyValue) -> Option<PropertyValue> {
    use PropertyValue::*;
    match (existing, value) {
        (Bool(_), v @ Bool(_)) => Some(v),
        (Str(_), v @ Str(_)) => Some(v),
        (Double(_), v @ Double(_)) => Some(v),
        (Double(_), Int(v)) => Some(Double(v as f64)),
        (Double(_), UInt(v)) => Some(Double(v as f64)),
        (UInt(_), v @ UInt(_)) => Some(v),
        (UInt(_), Int(v)) if v >= 0 => Some(UInt(v as u64)),
        (Int(_), v @ Int(_)) => Some(v),
        (Int(_), UInt(v)) => i64::try_from(v).ok().map(Int),
        _ => None,
    }
}

/// Properties (with defaults) of each known factory
fn factory_properties(factory: &str) -> Option<Vec<(&'static str, PropertyValue)>> {
    use PropertyValue::*;
    let props = match factory {
        "queue" => vec![
            ("max-size-time", UInt(1_000_000_000)),
            ("max-size-buffers", UInt(200)),
            ("max-size-bytes", UInt(10 * 1024 * 1024)),
        ],
        "volume" => vec![("volume", Double(1.0)), ("mute", Bool(false))],
        "tee" => vec![("allow-not-linked", Bool(false))],
        "fakesink" => vec![("sync", Bool(false))],
        "autoaudiosink" => vec![("sync", Bool(true))],
        "alsasink" | "pulsesink" | "jackaudiosink" => {
            vec![("device", Str(String::new())), ("sync", Bool(true))]
        }
        "filesink" => vec![("location", Str(String::new()))],
        "shout2send" => vec![
            ("ip", Str("127.0.0.1".to_string())),
            ("port", Int(8000)),
            ("mount", Str(String::new())),
            ("password", Str("hackme".to_string())),
        ],
        "audioconvert" | "audioresample" | "oggmux" => vec![],
        "lamemp3enc" => vec![("bitrate", Int(128)), ("cbr", Bool(false))],
        "vorbisenc" => vec![("quality", Double(0.3))],
        "goom" | "wavescope" | "monoscope" | "spectrascope" | "synaesthesia" => vec![],
        "filesrc" => vec![("location", Str(String::new()))],
        "souphttpsrc" => vec![("location", Str(String::new())), ("is-live", Bool(false))],
        "appsrc" => vec![
            ("is-live", Bool(false)),
            ("caps", Str(String::new())),
            ("format", Str("bytes".to_string())),
            ("stream-type", Str("stream".to_string())),
            ("max-bytes", UInt(200_000)),
            ("min-percent", UInt(0)),
        ],
        _ => return None,
    };
    Some(props)
}

fn is_sink_factory(factory: &str) -> bool {
    factory.ends_with("sink") || factory == "shout2send"
}

/// Queue and signal handlers of an `appsrc`
#[derive(Default)]
struct SimAppSrc {
    next_id: u64,
    need_data: HashMap<u64, DataHandler>,
    enough_data: HashMap<u64, NotifyHandler>,
    seek_data: HashMap<u64, DataHandler>,
    /// Bytes pushed since the source last asked for data
    queued_bytes: u64,
    buffers: usize,
    eos: bool,
}

/// Element made by the simulated engine
pub struct SimElement {
    name: String,
    factory: String,
    props: Mutex<HashMap<String, PropertyValue>>,
    links: Mutex<Vec<String>>,
    children: Vec<ElementRef>,
    app: Option<Arc<Mutex<SimAppSrc>>>,
    core: Weak<SimCore>,
}

impl SimElement {
    fn new(name: String, factory: &str, core: Weak<SimCore>) -> Self {
        let props = factory_properties(factory)
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            name,
            factory: factory.to_string(),
            props: Mutex::new(props),
            links: Mutex::new(Vec::new()),
            children: Vec::new(),
            app: (factory == "appsrc").then(|| Arc::new(Mutex::new(SimAppSrc::default()))),
            core,
        }
    }

    fn bin(name: String, children: Vec<ElementRef>, core: Weak<SimCore>) -> Self {
        Self {
            name,
            factory: "bin".to_string(),
            props: Mutex::new(HashMap::new()),
            links: Mutex::new(Vec::new()),
            children,
            app: None,
            core,
        }
    }

    fn is_sink(&self) -> bool {
        match self.children.last() {
            Some(last) => is_sink_factory(last.factory()),
            None => is_sink_factory(&self.factory),
        }
    }

    /// Fire `need-data`; whatever was queued counts as consumed
    fn request_data(&self) {
        let Some(app) = &self.app else {
            return;
        };
        let handlers: Vec<DataHandler> = {
            let mut st = lock(app);
            st.queued_bytes = 0;
            st.need_data.values().cloned().collect()
        };
        trace!(target: "tonearm_ap::gst", "sim need-data on {}: {} handler(s)", self.name, handlers.len());
        for handler in handlers {
            handler(0);
        }
    }

    /// Fire `seek-data`, dropping queued data and any end-of-stream token
    fn request_seek(&self, position: Duration) {
        let Some(app) = &self.app else {
            return;
        };
        let handlers: Vec<DataHandler> = {
            let mut st = lock(app);
            st.queued_bytes = 0;
            st.eos = false;
            st.seek_data.values().cloned().collect()
        };
        let position_ms = u64::try_from(position.as_millis()).unwrap_or(u64::MAX);
        for handler in handlers {
            handler(position_ms);
        }
    }

    fn connect_app(
        &self,
        connect: impl FnOnce(&mut SimAppSrc, u64),
        disconnect: fn(&mut SimAppSrc, u64),
    ) -> SignalHandle {
        let Some(app) = &self.app else {
            return Connection::new(|| {});
        };
        let id = {
            let mut st = lock(app);
            st.next_id += 1;
            let id = st.next_id;
            connect(&mut *st, id);
            id
        };
        let weak = Arc::downgrade(app);
        Connection::new(move || {
            if let Some(app) = weak.upgrade() {
                let mut st = lock(&app);
                disconnect(&mut *st, id);
            }
        })
    }

    fn pushed_buffers(&self) -> Option<usize> {
        self.app.as_ref().map(|app| lock(app).buffers)
    }

    /// Names of the elements this one links to
    #[cfg(test)]
    fn links(&self) -> Vec<String> {
        lock(&self.links).clone()
    }

    /// Factories of a bin's children, in link order
    #[cfg(test)]
    fn child_factories(&self) -> Vec<String> {
        self.children.iter().map(|c| c.factory().to_string()).collect()
    }
}

impl Element for SimElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self) -> &str {
        &self.factory
    }

    fn has_property(&self, name: &str) -> bool {
        lock(&self.props).contains_key(name)
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<(), ElementError> {
        let mut props = lock(&self.props);
        let Some(existing) = props.get(name) else {
            return Err(ElementError::NoSuchProperty {
                element: self.name.clone(),
                property: name.to_string(),
            });
        };
        let invalid = |value: &PropertyValue| ElementError::InvalidValue {
            property: name.to_string(),
            value: value.to_string(),
        };
        let coerced = coerce(existing, value.clone()).ok_or_else(|| invalid(&value))?;
        if let (true, PropertyValue::Double(v)) = (name == "volume", &coerced) {
            if !(0.0..=10.0).contains(v) {
                return Err(invalid(&coerced));
            }
        }
        props.insert(name.to_string(), coerced);
        Ok(())
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        lock(&self.props).get(name).cloned()
    }

    fn link(&self, downstream: &ElementRef) -> Result<(), ElementError> {
        if self.is_sink() {
            return Err(ElementError::LinkFailed {
                src: self.name.clone(),
                sink: downstream.name().to_string(),
            });
        }
        lock(&self.links).push(downstream.name().to_string());
        Ok(())
    }

    fn seek_simple(&self, position: Duration, flags: SeekFlags) -> bool {
        trace!(target: "tonearm_ap::gst", "sim seek on {}: flush={}", self.name, flags.contains(SeekFlags::FLUSH));
        self.core
            .upgrade()
            .map(|core| core.seek(position))
            .unwrap_or(false)
    }

    fn as_app_src(&self) -> Option<&dyn AppSrc> {
        self.app.as_ref().map(|_| self as &dyn AppSrc)
    }
}

impl AppSrc for SimElement {
    fn push_buffer(&self, buffer: Vec<u8>) -> bool {
        let Some(app) = &self.app else {
            return false;
        };
        let limit = self
            .property("max-bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::MAX);

        let mut st = lock(app);
        if st.eos {
            debug!(target: "tonearm_ap::gst", "sim appsrc {} refused buffer after end-of-stream", self.name);
            return false;
        }
        let before = st.queued_bytes;
        st.queued_bytes = before.saturating_add(buffer.len() as u64);
        st.buffers += 1;
        let handlers: Vec<NotifyHandler> = if before < limit && st.queued_bytes >= limit {
            st.enough_data.values().cloned().collect()
        } else {
            Vec::new()
        };
        drop(st);

        for handler in handlers {
            handler();
        }
        true
    }

    fn end_of_stream(&self) -> bool {
        let Some(app) = &self.app else {
            return false;
        };
        if lock(app).eos {
            return false;
        }
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let accepted = core.source_end_of_stream();
        if accepted {
            lock(app).eos = true;
        }
        accepted
    }

    fn connect_need_data(&self, handler: NeedDataHandler) -> SignalHandle {
        let handler: DataHandler = Arc::from(handler);
        self.connect_app(
            move |st, id| {
                st.need_data.insert(id, handler);
            },
            |st, id| {
                st.need_data.remove(&id);
            },
        )
    }

    fn connect_enough_data(&self, handler: EnoughDataHandler) -> SignalHandle {
        let handler: NotifyHandler = Arc::from(handler);
        self.connect_app(
            move |st, id| {
                st.enough_data.insert(id, handler);
            },
            |st, id| {
                st.enough_data.remove(&id);
            },
        )
    }

    fn connect_seek_data(&self, handler: SeekDataHandler) -> SignalHandle {
        let handler: DataHandler = Arc::from(handler);
        self.connect_app(
            move |st, id| {
                st.seek_data.insert(id, handler);
            },
            |st, id| {
                st.seek_data.remove(&id);
            },
        )
    }
}

/// The simulated playbin
pub struct SimPipeline {
    core: Arc<SimCore>,
}

impl Element for SimPipeline {
    fn name(&self) -> &str {
        PIPELINE_NAME
    }

    fn factory(&self) -> &str {
        "playbin"
    }

    fn has_property(&self, name: &str) -> bool {
        name == "uri" || lock(&self.core.state).props.contains_key(name)
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<(), ElementError> {
        if name == "uri" {
            return match value {
                PropertyValue::Str(uri) => {
                    self.core.set_uri(uri);
                    Ok(())
                }
                other => Err(ElementError::InvalidValue {
                    property: name.to_string(),
                    value: other.to_string(),
                }),
            };
        }

        let mut st = lock(&self.core.state);
        let Some(existing) = st.props.get(name) else {
            return Err(ElementError::NoSuchProperty {
                element: PIPELINE_NAME.to_string(),
                property: name.to_string(),
            });
        };
        let coerced = coerce(existing, value.clone()).ok_or_else(|| ElementError::InvalidValue {
            property: name.to_string(),
            value: value.to_string(),
        })?;
        st.props.insert(name.to_string(), coerced);
        Ok(())
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        let st = lock(&self.core.state);
        if name == "uri" {
            return st.uri.clone().map(PropertyValue::Str);
        }
        st.props.get(name).cloned()
    }

    fn link(&self, downstream: &ElementRef) -> Result<(), ElementError> {
        Err(ElementError::LinkFailed {
            src: PIPELINE_NAME.to_string(),
            sink: downstream.name().to_string(),
        })
    }

    fn seek_simple(&self, position: Duration, _flags: SeekFlags) -> bool {
        self.core.seek(position)
    }
}

impl Pipeline for SimPipeline {
    fn set_state(&self, state: State) -> StateChangeReturn {
        self.core.set_state(state)
    }

    fn get_state(&self, timeout: Option<Duration>) -> (StateChangeReturn, State, State) {
        self.core.get_state(timeout)
    }

    fn query_position(&self) -> Option<Duration> {
        let st = lock(&self.core.state);
        if st.current < State::Paused {
            return None;
        }
        Some(st.position())
    }

    fn subscribe_bus(&self, sink: BusSink) -> BusSubscription {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.core.bus).insert(id, Arc::from(sink));
        let core = Arc::downgrade(&self.core);
        Connection::new(move || {
            if let Some(core) = core.upgrade() {
                lock(&core.bus).remove(&id);
            }
        })
    }

    fn connect_about_to_finish(&self, handler: AboutToFinishHandler) -> SignalHandle {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.core.about_to_finish).insert(id, Arc::from(handler));
        let core = Arc::downgrade(&self.core);
        Connection::new(move || {
            if let Some(core) = core.upgrade() {
                lock(&core.about_to_finish).remove(&id);
            }
        })
    }

    fn connect_source_setup(&self, handler: SourceSetupHandler) -> SignalHandle {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.core.source_setup).insert(id, Arc::from(handler));
        let core = Arc::downgrade(&self.core);
        Connection::new(move || {
            if let Some(core) = core.upgrade() {
                lock(&core.source_setup).remove(&id);
            }
        })
    }

    fn set_audio_sink(&self, sink: AudioSinkGraph) -> Result<(), ElementError> {
        let mut st = lock(&self.core.state);
        if st.current > State::Null {
            return Err(ElementError::InvalidValue {
                property: "audio-sink".to_string(),
                value: format!("<set while {}>", st.current),
            });
        }
        st.sink_factories = sink
            .elements
            .iter()
            .map(|e| e.factory().to_string())
            .collect();
        debug!(target: "tonearm_ap::gst", "sim audio-sink entry={} elements={:?}", sink.entry.name(), st.sink_factories);
        Ok(())
    }

    fn set_visualizer(&self, visualizer: ElementRef) -> Result<(), ElementError> {
        lock(&self.core.state).visualizer = Some(visualizer.factory().to_string());
        Ok(())
    }

    fn send_tag_event(&self, tags: Tags) -> bool {
        let _transition = lock(&self.core.transition);
        let mut st = lock(&self.core.state);
        st.sent_tags.push(tags.clone());
        let flowing = st.current >= State::Paused;
        drop(st);
        if flowing {
            self.core.emit(BusMessage::Tag(tags));
        }
        true
    }
}

/// Engine handle, also the test control surface
#[derive(Clone)]
pub struct SimulatedEngine {
    core: Arc<SimCore>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl SimulatedEngine {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            core: Arc::new(SimCore::new(config)),
        }
    }

    /// Fire about-to-finish, then switch to the queued URI or post EOS
    ///
    /// Returns true when a queued URI started streaming. Must not be called
    /// from inside an async runtime: about-to-finish handlers block.
    pub fn finish_track(&self) -> bool {
        self.core.finish_track()
    }

    /// Post a message on the bus as if the engine had produced it
    pub fn post(&self, message: BusMessage) {
        let _transition = lock(&self.core.transition);
        self.core.emit(message);
    }

    /// Every state requested so far, oldest first
    pub fn state_requests(&self) -> Vec<State> {
        lock(&self.core.state).requests.clone()
    }

    pub fn current_state(&self) -> State {
        lock(&self.core.state).current
    }

    pub fn sent_tag_events(&self) -> Vec<Tags> {
        lock(&self.core.state).sent_tags.clone()
    }

    pub fn uri(&self) -> Option<String> {
        lock(&self.core.state).uri.clone()
    }

    pub fn next_uri(&self) -> Option<String> {
        lock(&self.core.state).next_uri.clone()
    }

    pub fn flags(&self) -> PlayFlags {
        let bits = lock(&self.core.state)
            .props
            .get("flags")
            .and_then(PropertyValue::as_u64)
            .unwrap_or_default();
        PlayFlags::from_bits(bits as u32)
    }

    /// A playbin property as last set
    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        lock(&self.core.state).props.get(name).cloned()
    }

    /// `is-live` of the most recent source, `None` when it has no such property
    pub fn source_is_live(&self) -> Option<bool> {
        self.source_property("is-live").and_then(|v| v.as_bool())
    }

    /// Property of the most recently created source element
    pub fn source_property(&self, name: &str) -> Option<PropertyValue> {
        lock(&self.core.state)
            .last_source
            .as_ref()
            .and_then(|s| s.property(name))
    }

    /// Buffers pushed into the current source, when it is an `appsrc`
    pub fn source_buffers(&self) -> Option<usize> {
        lock(&self.core.state)
            .last_source
            .as_ref()
            .and_then(|s| s.pushed_buffers())
    }

    /// Factories of the installed audio sink chain
    pub fn audio_sink_factories(&self) -> Vec<String> {
        lock(&self.core.state).sink_factories.clone()
    }

    pub fn visualizer(&self) -> Option<String> {
        lock(&self.core.state).visualizer.clone()
    }

    pub fn bus_subscribers(&self) -> usize {
        lock(&self.core.bus).len()
    }

    pub fn signal_handlers(&self) -> usize {
        lock(&self.core.about_to_finish).len() + lock(&self.core.source_setup).len()
    }
}

impl MediaEngine for SimulatedEngine {
    fn make_playbin(&self) -> Result<Arc<dyn Pipeline>, ElementError> {
        Ok(Arc::new(SimPipeline {
            core: Arc::clone(&self.core),
        }))
    }

    fn make_element(&self, factory: &str, name: Option<&str>) -> Result<ElementRef, ElementError> {
        let element: ElementRef = self.core.make_element(factory, name)?;
        Ok(element)
    }

    fn parse_bin(&self, description: &str) -> Result<ElementRef, ElementError> {
        let bin: ElementRef = self.core.parse_bin(description)?;
        Ok(bin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(pipeline: &Arc<dyn Pipeline>) -> (Arc<Mutex<Vec<BusMessage>>>, BusSubscription) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        let sub = pipeline.subscribe_bus(Box::new(move |m| sink.lock().unwrap().push(m)));
        (messages, sub)
    }

    fn states(messages: &[BusMessage]) -> Vec<(State, State, State)> {
        messages
            .iter()
            .filter_map(|m| match m {
                BusMessage::StateChanged { old, new, pending, .. } => Some((*old, *new, *pending)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_preroll_to_playing_sequence() {
        let engine = SimulatedEngine::default();
        let playbin = engine.make_playbin().unwrap();
        let (messages, _sub) = collect(&playbin);

        playbin.set_property("uri", PropertyValue::Str("file:///a.ogg".into())).unwrap();
        assert_eq!(playbin.set_state(State::Playing), StateChangeReturn::Async);

        let (result, current, pending) = playbin.get_state(None);
        assert_eq!(result, StateChangeReturn::Success);
        assert_eq!(current, State::Playing);
        assert_eq!(pending, State::VoidPending);

        let messages = messages.lock().unwrap().clone();
        assert_eq!(
            states(&messages),
            vec![
                (State::Null, State::Ready, State::Playing),
                (State::Ready, State::Paused, State::Playing),
                (State::Paused, State::Playing, State::VoidPending),
            ]
        );
        assert!(messages.contains(&BusMessage::StreamStart));
        assert!(messages.contains(&BusMessage::AsyncDone));
    }

    #[test]
    fn test_stop_drops_final_null_message() {
        let engine = SimulatedEngine::default();
        let playbin = engine.make_playbin().unwrap();
        playbin.set_property("uri", PropertyValue::Str("file:///a.ogg".into())).unwrap();
        playbin.set_state(State::Playing);
        playbin.get_state(None);

        let (messages, _sub) = collect(&playbin);
        assert_eq!(playbin.set_state(State::Null), StateChangeReturn::Success);

        assert_eq!(
            states(&messages.lock().unwrap()),
            vec![
                (State::Playing, State::Paused, State::Null),
                (State::Paused, State::Ready, State::Null),
            ]
        );
        assert_eq!(engine.current_state(), State::Null);
    }

    #[test]
    fn test_stop_posts_final_message_when_configured() {
        let engine = SimulatedEngine::new(SimulatedConfig {
            drop_final_null_transition: false,
            ..SimulatedConfig::default()
        });
        let playbin = engine.make_playbin().unwrap();
        playbin.set_state(State::Ready);

        let (messages, _sub) = collect(&playbin);
        playbin.set_state(State::Null);
        assert_eq!(
            states(&messages.lock().unwrap()),
            vec![(State::Ready, State::Null, State::VoidPending)]
        );
    }

    #[test]
    fn test_superseded_preroll_is_never_confirmed() {
        let engine = SimulatedEngine::new(SimulatedConfig {
            preroll_delay: Duration::from_millis(50),
            ..SimulatedConfig::default()
        });
        let playbin = engine.make_playbin().unwrap();
        let (messages, _sub) = collect(&playbin);

        playbin.set_property("uri", PropertyValue::Str("file:///a.ogg".into())).unwrap();
        playbin.set_state(State::Paused);
        playbin.set_state(State::Null);
        playbin.get_state(None);
        thread::sleep(Duration::from_millis(120));

        let messages = messages.lock().unwrap();
        assert!(!messages.contains(&BusMessage::AsyncDone));
        assert_eq!(states(&messages), vec![(State::Null, State::Ready, State::Paused)]);
        assert_eq!(engine.state_requests(), vec![State::Paused, State::Null]);
    }

    #[test]
    fn test_no_uri_fails_preroll() {
        let engine = SimulatedEngine::default();
        let playbin = engine.make_playbin().unwrap();
        let (messages, _sub) = collect(&playbin);

        assert_eq!(playbin.set_state(State::Paused), StateChangeReturn::Failure);
        assert!(messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| matches!(m, BusMessage::Error { .. })));
    }

    #[test]
    fn test_seek_and_position() {
        let engine = SimulatedEngine::default();
        let playbin = engine.make_playbin().unwrap();
        assert!(playbin.query_position().is_none());
        assert!(!playbin.seek_simple(Duration::from_secs(1), SeekFlags::FLUSH));

        playbin.set_property("uri", PropertyValue::Str("file:///a.ogg".into())).unwrap();
        playbin.set_state(State::Paused);
        playbin.get_state(None);

        let (messages, _sub) = collect(&playbin);
        assert!(playbin.seek_simple(Duration::from_millis(2500), SeekFlags::FLUSH));
        assert_eq!(playbin.query_position(), Some(Duration::from_millis(2500)));
        assert_eq!(
            messages.lock().unwrap().as_slice(),
            &[BusMessage::Segment {
                position: Duration::from_millis(2500)
            }]
        );
    }

    #[test]
    fn test_finish_track_switches_or_ends() {
        let engine = SimulatedEngine::default();
        let playbin = engine.make_playbin().unwrap();
        playbin.set_property("uri", PropertyValue::Str("file:///a.ogg".into())).unwrap();
        playbin.set_state(State::Playing);
        playbin.get_state(None);

        let queued = Arc::clone(&playbin);
        let signal = playbin.connect_about_to_finish(Box::new(move || {
            let _ = queued.set_property("uri", PropertyValue::Str("file:///b.ogg".into()));
        }));

        let (messages, _sub) = collect(&playbin);
        assert!(engine.finish_track());
        assert_eq!(engine.uri().as_deref(), Some("file:///b.ogg"));
        assert!(messages.lock().unwrap().contains(&BusMessage::StreamStart));

        drop(signal);
        assert!(!engine.finish_track());
        assert_eq!(messages.lock().unwrap().last(), Some(&BusMessage::Eos));
    }

    #[test]
    fn test_parse_bin() {
        let engine = SimulatedEngine::default();
        let bin = engine
            .parse_bin("audioconvert ! lamemp3enc bitrate=192 ! filesink location=/tmp/out.mp3")
            .unwrap();
        assert_eq!(bin.factory(), "bin");

        assert!(matches!(
            engine.parse_bin("audioconvert ! nosuchsink"),
            Err(ElementError::InvalidDescription { .. })
        ));
        assert!(matches!(
            engine.parse_bin("filesink colour=blue"),
            Err(ElementError::InvalidDescription { .. })
        ));
    }

    #[test]
    fn test_bin_children_and_links() {
        let engine = SimulatedEngine::default();
        let bin = engine
            .core
            .parse_bin("audioconvert ! lamemp3enc ! filesink location=/tmp/out.mp3")
            .unwrap();
        assert_eq!(bin.child_factories(), vec!["audioconvert", "lamemp3enc", "filesink"]);
        assert!(bin.links().is_empty());

        let queue = engine.core.make_element("queue", Some("q")).unwrap();
        let sink: ElementRef = engine.core.make_element("fakesink", Some("out")).unwrap();
        queue.link(&sink).unwrap();
        assert_eq!(queue.links(), vec!["out"]);
        assert!(queue.child_factories().is_empty());

        let tail: ElementRef = queue.clone();
        assert!(matches!(
            sink.link(&tail),
            Err(ElementError::LinkFailed { .. })
        ));
    }

    #[test]
    fn test_appsrc_end_of_stream_needs_preroll() {
        let engine = SimulatedEngine::default();
        let source = engine.make_element("appsrc", None).unwrap();
        let app = source.as_app_src().unwrap();

        assert!(app.push_buffer(vec![0; 8]));
        assert!(!app.end_of_stream());
        assert!(app.push_buffer(vec![0; 8]));

        let file = engine.make_element("filesrc", None).unwrap();
        assert!(file.as_app_src().is_none());
    }

    #[test]
    fn test_element_properties() {
        let engine = SimulatedEngine::default();
        let volume = engine.make_element("volume", Some("vol")).unwrap();
        assert_eq!(volume.name(), "vol");

        volume.set_property("volume", PropertyValue::Double(0.25)).unwrap();
        assert_eq!(volume.property("volume"), Some(PropertyValue::Double(0.25)));
        assert!(volume.set_property("volume", PropertyValue::Double(11.0)).is_err());
        assert!(volume.set_property("mute", PropertyValue::Str("yes".into())).is_err());
        assert!(matches!(
            engine.make_element("nosuch", None),
            Err(ElementError::NoSuchFactory(_))
        ));

        let sink = engine.make_element("fakesink", None).unwrap();
        assert!(matches!(sink.link(&volume), Err(ElementError::LinkFailed { .. })));
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let engine = SimulatedEngine::default();
        let playbin = engine.make_playbin().unwrap();
        let (messages, sub) = collect(&playbin);
        assert_eq!(engine.bus_subscribers(), 1);

        drop(sub);
        assert_eq!(engine.bus_subscribers(), 0);
        engine.post(BusMessage::Eos);
        assert!(messages.lock().unwrap().is_empty());
    }
}
