use thiserror::Error;

/// Failures reported by a recognition or synthesis backend.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("failed to open recognition stream: {message}")]
    Open { message: String },
    #[error("recognition stream already ended")]
    StreamEnded,
    #[error("failed to end recognition stream: {message}")]
    End { message: String },
    #[error("failed to synthesize speech: no audio content returned")]
    NoAudioContent,
}
