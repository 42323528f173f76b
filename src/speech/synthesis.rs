//! # Speech Synthesis
//!
//! Request/response conversion of text to encoded audio. The gateway sends
//! the returned bytes back to the client as a binary frame.

use super::error::BackendError;
use crate::audio::processor::AudioEncoding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Voice gender requested from the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceGender {
    Male,
    Female,
    Neutral,
}

/// Voice selection for a synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub language_code: String,
    pub gender: VoiceGender,
}

/// Output format for a synthesis request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthesisAudioConfig {
    pub encoding: AudioEncoding,
}

/// Text-to-speech backend.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: lets a trait object (`Arc<dyn SynthesisBackend>`) expose an async method
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        audio: &SynthesisAudioConfig,
    ) -> Result<Vec<u8>, BackendError>;
}

/// Synthesize `text` and require that the backend actually returned audio.
pub async fn synthesize_audio(
    backend: &dyn SynthesisBackend,
    text: &str,
    voice: &VoiceConfig,
    audio: &SynthesisAudioConfig,
) -> Result<Vec<u8>, BackendError> {
    let bytes = backend.synthesize(text, voice, audio).await?;
    if bytes.is_empty() {
        return Err(BackendError::NoAudioContent);
    }
    Ok(bytes)
}

/// Placeholder synthesizer that answers every request with silence.
///
/// Blank text produces no audio at all.
#[derive(Debug, Clone)]
pub struct SilenceSynthesizer {
    sample_rate: u32,
    duration_ms: u32,
}

impl SilenceSynthesizer {
    pub fn new(sample_rate: u32, duration_ms: u32) -> Self {
        Self {
            sample_rate,
            duration_ms,
        }
    }
}

#[async_trait]
impl SynthesisBackend for SilenceSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceConfig,
        audio: &SynthesisAudioConfig,
    ) -> Result<Vec<u8>, BackendError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let samples = self.sample_rate as usize * self.duration_ms as usize / 1000;
        let len = samples * audio.encoding.bytes_per_sample();
        Ok(vec![audio.encoding.silence_byte(); len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice() -> VoiceConfig {
        VoiceConfig {
            language_code: "en-US".to_string(),
            gender: VoiceGender::Neutral,
        }
    }

    #[tokio::test]
    async fn test_silence_synthesizer_fills_requested_duration() {
        let synth = SilenceSynthesizer::new(8000, 5000);
        let audio = SynthesisAudioConfig {
            encoding: AudioEncoding::Mulaw,
        };

        let bytes = synthesize_audio(&synth, "hello", &voice(), &audio).await.unwrap();
        assert_eq!(bytes.len(), 40_000);
        assert!(bytes.iter().all(|&b| b == 0xFF));
    }

    #[tokio::test]
    async fn test_blank_text_has_no_audio_content() {
        let synth = SilenceSynthesizer::new(8000, 5000);
        let audio = SynthesisAudioConfig {
            encoding: AudioEncoding::Linear16,
        };

        let result = synthesize_audio(&synth, "   ", &voice(), &audio).await;
        assert_eq!(result, Err(BackendError::NoAudioContent));
    }
}
