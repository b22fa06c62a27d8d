//! Error types for tonearm-ap
//!
//! Construction failures surface from `Audio::start`. Once the actor runs,
//! the only error a caller can see is `ActorStopped`; pipeline trouble is
//! reported through logs and `state_changed` events instead.

use crate::pipeline::ElementError;
use thiserror::Error;

/// Main error type for tonearm-ap
#[derive(Error, Debug)]
pub enum Error {
    /// Pipeline element could not be created, configured or linked
    #[error("Element error: {0}")]
    Element(#[from] ElementError),

    /// Audio output could not be set up
    #[error("Audio output error: {0}")]
    Output(String),

    /// The audio actor has shut down
    #[error("Audio actor has stopped")]
    ActorStopped,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from tonearm-common (config loading)
    #[error(transparent)]
    Common(#[from] tonearm_common::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using tonearm-ap Error
pub type Result<T> = std::result::Result<T, Error>;
