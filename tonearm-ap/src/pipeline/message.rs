//! Bus messages posted by a pipeline
//!
//! Engines decode their native notifications into this closed set before
//! handing them to a [`BusSink`](super::BusSink).

use super::State;
use std::time::Duration;
use tonearm_common::Tags;

/// Buffering mode reported with a buffering message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    Stream,
    Download,
    Timeshift,
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// An element changed state
    StateChanged {
        /// Name of the element that changed state
        src: String,
        old: State,
        new: State,
        pending: State,
    },

    /// Fill level of the stream buffer
    Buffering {
        percent: u32,
        mode: Option<BufferingMode>,
    },

    Eos,

    Error {
        message: String,
        debug: Option<String>,
    },

    Warning {
        message: String,
        debug: Option<String>,
    },

    /// An asynchronous state change completed
    AsyncDone,

    Tag(Tags),

    /// No element could handle the media
    MissingPlugin {
        description: String,
        installer_detail: Option<String>,
    },

    /// First data of a new stream reached the sink
    StreamStart,

    /// A new segment started at `position` (seek, stream switch, preroll)
    Segment { position: Duration },

    /// A message type with no meaning for playback
    Other { kind: String },
}

impl BusMessage {
    pub fn kind(&self) -> &str {
        match self {
            BusMessage::StateChanged { .. } => "state-changed",
            BusMessage::Buffering { .. } => "buffering",
            BusMessage::Eos => "eos",
            BusMessage::Error { .. } => "error",
            BusMessage::Warning { .. } => "warning",
            BusMessage::AsyncDone => "async-done",
            BusMessage::Tag(_) => "tag",
            BusMessage::MissingPlugin { .. } => "missing-plugin",
            BusMessage::StreamStart => "stream-start",
            BusMessage::Segment { .. } => "segment",
            BusMessage::Other { kind } => kind,
        }
    }
}
