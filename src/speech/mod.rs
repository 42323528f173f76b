//! # Speech Backends
//!
//! Narrow interfaces to the external speech services the gateway depends on.
//! Recognition and synthesis themselves happen elsewhere; this module only
//! defines how the gateway talks to them.
//!
//! ## Key Components:
//! - **Recognition**: `SpeechBackend` opens one bidirectional `RecognitionStream`
//!   per window; results come back as `StreamEvent`s tagged with the window id
//! - **Synthesis**: `SynthesisBackend` turns text into encoded audio bytes
//! - **Mock / silence backends**: built-in implementations for local runs

pub mod error;
pub mod mock;
pub mod recognition;
pub mod synthesis;

pub use error::BackendError;
pub use mock::MockSpeechBackend;
pub use recognition::{
    RecognitionConfig, RecognitionStream, SpeechBackend, StreamEvent, StreamEvents, WindowEvent,
    WindowEventReceiver, WindowId,
};
pub use synthesis::{
    synthesize_audio, SilenceSynthesizer, SynthesisAudioConfig, SynthesisBackend, VoiceConfig,
    VoiceGender,
};

use crate::config::AppConfig;
use std::sync::Arc;

/// Build the recognition backend named in configuration.
///
/// ## Errors:
/// Unknown backend names are a startup failure. `AppConfig::validate`
/// rejects them earlier, so this only fails on a config that skipped validation.
pub fn build_speech_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn SpeechBackend>> {
    match config.recognition.backend.as_str() {
        "mock" => {
            let format = config.audio.format();
            let after_bytes = format.window_threshold_bytes(config.recognition.mock_transcript_after_ms);
            Ok(Arc::new(MockSpeechBackend::new(after_bytes.max(1))))
        }
        other => Err(anyhow::anyhow!("Unknown recognition backend: {}", other)),
    }
}

/// Build the synthesis backend from configuration.
pub fn build_synthesis_backend(config: &AppConfig) -> Arc<dyn SynthesisBackend> {
    Arc::new(SilenceSynthesizer::new(
        config.audio.sample_rate,
        config.synthesis.silence_duration_ms,
    ))
}
