//! Error types for the voice interaction engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while capturing, transcribing, synthesizing or playing audio
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone permission refused or no capture device could be opened.
    #[error("Microphone access denied: {0}")]
    DeviceAccessDenied(String),

    /// Stop was requested before a single chunk was captured.
    #[error("No audio was recorded")]
    EmptyRecording,

    /// Payload below the minimum-bytes threshold; never sent to the network.
    #[error("Recording too short ({bytes} bytes, need at least {min_bytes})")]
    RecordingTooShort { bytes: usize, min_bytes: usize },

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("Speech synthesis failed: {message}")]
    SynthesisFailed { message: String, transient: bool },

    /// The audio sink rejected playback.
    #[error("Audio playback failed: {0}")]
    PlaybackFailed(String),

    /// Deliberate barge-in. Not a user-facing failure.
    #[error("Interrupted")]
    Aborted,

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    pub fn synthesis(message: impl Into<String>) -> Self {
        VoiceError::SynthesisFailed {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient_synthesis(message: impl Into<String>) -> Self {
        VoiceError::SynthesisFailed {
            message: message.into(),
            transient: true,
        }
    }

    /// True for the barge-in outcome, which callers swallow silently.
    pub fn is_aborted(&self) -> bool {
        matches!(self, VoiceError::Aborted)
    }

    /// True when a single automatic retry is allowed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VoiceError::SynthesisFailed { transient: true, .. })
    }

    /// Message for the UI error field. `None` for `Aborted`.
    pub fn user_message(&self) -> Option<String> {
        let msg = match self {
            VoiceError::Aborted => return None,
            VoiceError::DeviceAccessDenied(_) => {
                "Microphone access was denied. Allow microphone access and try again.".to_string()
            }
            VoiceError::EmptyRecording => "No audio was recorded. Please try again.".to_string(),
            VoiceError::RecordingTooShort { .. } => {
                "Recording was too short. Please speak a little longer.".to_string()
            }
            VoiceError::TranscriptionFailed(m) => format!("Could not transcribe audio: {}", m),
            VoiceError::SynthesisFailed { message, .. } => {
                format!("Could not generate speech: {}", message)
            }
            other => other.to_string(),
        };
        Some(msg)
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceAccessDenied(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceAccessDenied(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
