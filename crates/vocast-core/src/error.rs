//! Error types for the vocast playback pipeline

use thiserror::Error;

use crate::playback::PlaybackMode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Audio decoding error: {0}")]
    DecodeError(String),

    #[error("Audio encoding error: {0}")]
    AudioError(String),

    #[error("Playback error: {0}")]
    PlaybackError(String),

    #[error("Output device error: {0}")]
    OutputDevice(String),

    #[error("Playback mode {requested} is not active (current mode: {active})")]
    ModeInactive {
        requested: PlaybackMode,
        active: PlaybackMode,
    },

    #[error("No combined track available")]
    NoCombinedTrack,

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Base64 error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Error::DecodeError(e.to_string())
    }
}
