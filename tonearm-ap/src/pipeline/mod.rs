//! Media pipeline contract
//!
//! The audio actor drives a playbin-style pipeline through these traits.
//! Decoding, demuxing and device output are the engine's business; the
//! actor only requests state changes, sets properties and reacts to bus
//! messages.
//!
//! **Threading:** engines deliver bus messages and signals on their own
//! threads. Handlers must be `Send + Sync` and must not assume they run on
//! the thread that requested the change.

pub mod message;
pub mod simulated;

pub use message::{BufferingMode, BusMessage};

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonearm_common::Tags;

/// Pipeline element state, ordered from "no state" to fully running
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// No pending state
    VoidPending,
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::VoidPending => "VOID_PENDING",
            State::Null => "NULL",
            State::Ready => "READY",
            State::Paused => "PAUSED",
            State::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// Result of a state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeReturn {
    Success,
    /// Completes later, confirmed through the bus
    Async,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Double(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            PropertyValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(v) => Some(*v),
            PropertyValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// Playbin `flags` property bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayFlags(u32);

impl PlayFlags {
    pub const AUDIO: PlayFlags = PlayFlags(0x02);
    pub const VIS: PlayFlags = PlayFlags(0x08);
    pub const DOWNLOAD: PlayFlags = PlayFlags(0x80);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        PlayFlags(bits)
    }

    pub const fn contains(self, other: PlayFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PlayFlags {
    type Output = PlayFlags;

    fn bitor(self, rhs: PlayFlags) -> PlayFlags {
        PlayFlags(self.0 | rhs.0)
    }
}

/// Seek behaviour bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekFlags(u32);

impl SeekFlags {
    pub const FLUSH: SeekFlags = SeekFlags(0x01);

    pub const fn contains(self, other: SeekFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Element construction and manipulation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ElementError {
    #[error("No element factory named '{0}'")]
    NoSuchFactory(String),

    #[error("Element '{element}' has no property '{property}'")]
    NoSuchProperty { element: String, property: String },

    #[error("Invalid value {value} for property '{property}'")]
    InvalidValue { property: String, value: String },

    #[error("Invalid pipeline description '{description}': {reason}")]
    InvalidDescription { description: String, reason: String },

    #[error("Failed to link '{src}' to '{sink}'")]
    LinkFailed { src: String, sink: String },
}

/// A node in the media graph
pub trait Element: Send + Sync {
    fn name(&self) -> &str;

    /// Factory the element was made from (`queue`, `volume`, ...)
    fn factory(&self) -> &str;

    fn has_property(&self, name: &str) -> bool;

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<(), ElementError>;

    fn property(&self, name: &str) -> Option<PropertyValue>;

    /// Link this element's output to `downstream`
    fn link(&self, downstream: &ElementRef) -> Result<(), ElementError>;

    /// Seek to `position`, returning whether the seek was accepted
    fn seek_simple(&self, position: Duration, flags: SeekFlags) -> bool;

    /// The application source interface, for `appsrc` elements
    fn as_app_src(&self) -> Option<&dyn AppSrc> {
        None
    }
}

pub type ElementRef = Arc<dyn Element>;

/// Called when an application source runs low, with a length hint in
/// milliseconds (0 when the source has no estimate)
pub type NeedDataHandler = Box<dyn Fn(u64) + Send + Sync>;

pub type EnoughDataHandler = Box<dyn Fn() + Send + Sync>;

/// Called with the position, in milliseconds, data must continue from
pub type SeekDataHandler = Box<dyn Fn(u64) + Send + Sync>;

/// A source fed with buffers by the application
///
/// Handlers run on whichever thread triggers them: `enough-data` fires
/// inside [`AppSrc::push_buffer`], `need-data` and `seek-data` on streaming
/// threads.
pub trait AppSrc: Send + Sync {
    /// Queue raw audio, returning whether the source accepted it
    fn push_buffer(&self, buffer: Vec<u8>) -> bool;

    /// Queue the end-of-stream token; EOS is posted once it is reached
    fn end_of_stream(&self) -> bool;

    fn connect_need_data(&self, handler: NeedDataHandler) -> SignalHandle;

    fn connect_enough_data(&self, handler: EnoughDataHandler) -> SignalHandle;

    fn connect_seek_data(&self, handler: SeekDataHandler) -> SignalHandle;
}

/// Receives every message posted on a pipeline bus
pub type BusSink = Box<dyn Fn(BusMessage) + Send + Sync>;

/// Called on a streaming thread when the current stream is about to end
pub type AboutToFinishHandler = Box<dyn Fn() + Send + Sync>;

/// Called on a streaming thread with each newly created source element
pub type SourceSetupHandler = Box<dyn Fn(&ElementRef) + Send + Sync>;

/// Disconnects its handler when dropped
pub struct Connection {
    disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl Connection {
    pub fn new(disconnect: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disconnect: Some(Box::new(disconnect)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

/// Bus watch, removed when dropped
pub type BusSubscription = Connection;

/// Signal connection, removed when dropped
pub type SignalHandle = Connection;

/// Sink chain handed to the playbin as its audio sink
pub struct AudioSinkGraph {
    /// Element receiving decoded audio
    pub entry: ElementRef,
    /// Every element in the chain, entry included
    pub elements: Vec<ElementRef>,
}

/// A playbin-style pipeline
pub trait Pipeline: Element {
    fn set_state(&self, state: State) -> StateChangeReturn;

    /// Returns `(result, current, pending)`, waiting up to `timeout` for an
    /// in-flight change to finish (`None` waits indefinitely)
    fn get_state(&self, timeout: Option<Duration>) -> (StateChangeReturn, State, State);

    fn query_position(&self) -> Option<Duration>;

    fn subscribe_bus(&self, sink: BusSink) -> BusSubscription;

    fn connect_about_to_finish(&self, handler: AboutToFinishHandler) -> SignalHandle;

    fn connect_source_setup(&self, handler: SourceSetupHandler) -> SignalHandle;

    fn set_audio_sink(&self, sink: AudioSinkGraph) -> Result<(), ElementError>;

    fn set_visualizer(&self, visualizer: ElementRef) -> Result<(), ElementError>;

    /// Inject tags downstream, returning whether the event was accepted
    fn send_tag_event(&self, tags: Tags) -> bool;
}

/// Factory for pipelines and elements
pub trait MediaEngine: Send + Sync {
    fn make_playbin(&self) -> Result<Arc<dyn Pipeline>, ElementError>;

    fn make_element(&self, factory: &str, name: Option<&str>) -> Result<ElementRef, ElementError>;

    /// Build a bin from a `factory prop=value ! factory` description
    fn parse_bin(&self, description: &str) -> Result<ElementRef, ElementError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_state_ordering() {
        assert!(State::VoidPending < State::Null);
        assert!(State::Null < State::Ready);
        assert!(State::Ready < State::Paused);
        assert!(State::Paused < State::Playing);
    }

    #[test]
    fn test_play_flags() {
        let flags = PlayFlags::AUDIO | PlayFlags::DOWNLOAD;
        assert_eq!(flags.bits(), 0x82);
        assert!(flags.contains(PlayFlags::AUDIO));
        assert!(!flags.contains(PlayFlags::VIS));
    }

    #[test]
    fn test_property_value_conversions() {
        assert_eq!(PropertyValue::Double(0.5).as_f64(), Some(0.5));
        assert_eq!(PropertyValue::Int(-1).as_u64(), None);
        assert_eq!(PropertyValue::UInt(7).as_u64(), Some(7));
        assert_eq!(PropertyValue::Str("x".into()).as_bool(), None);
        assert_eq!(PropertyValue::Str("x".into()).as_str(), Some("x"));
        assert_eq!(PropertyValue::Bool(true).as_str(), None);
    }

    #[test]
    fn test_connection_disconnects_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);
        let conn = Connection::new(move || flag_clone.store(true, Ordering::SeqCst));

        assert!(!flag.load(Ordering::SeqCst));
        drop(conn);
        assert!(flag.load(Ordering::SeqCst));
    }
}
