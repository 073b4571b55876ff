//! Error types for the adaptive voice session

use crate::sequencer::{SessionState, TurnSignal};
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice session core
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Microphone unavailable: {0}")]
    Permission(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    /// The live input stream is gone; the session treats this as its end.
    #[error("Audio stream closed")]
    StreamClosed,

    #[error("Capture busy: a recording is already active")]
    CaptureBusy,

    #[error("No audio captured")]
    NoAudio,

    #[error("Invalid transition: {signal} while {from}")]
    InvalidTransition { from: SessionState, signal: TurnSignal },

    #[error("Audio encoding error: {0}")]
    Encode(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Response timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Permission(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Permission(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Encode(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Backend(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Backend(format!("reply audio is not valid base64: {}", err))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
