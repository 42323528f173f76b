use super::error::BackendError;
use super::recognition::{
    RecognitionConfig, RecognitionResult, RecognitionStream, SpeechBackend, StreamEvent,
    StreamEvents,
};
use tracing::debug;

/// Recognizer stand-in for local runs.
///
/// Each stream emits one synthetic transcript once it has received
/// `transcript_after_bytes` bytes of audio, and an `End` event when ended.
#[derive(Debug, Clone)]
pub struct MockSpeechBackend {
    transcript_after_bytes: usize,
}

impl MockSpeechBackend {
    pub fn new(transcript_after_bytes: usize) -> Self {
        Self {
            transcript_after_bytes,
        }
    }
}

impl SpeechBackend for MockSpeechBackend {
    fn open(
        &self,
        config: &RecognitionConfig,
        events: StreamEvents,
    ) -> Result<Box<dyn RecognitionStream>, BackendError> {
        debug!(
            window = events.window(),
            encoding = %config.encoding,
            sample_rate = config.sample_rate_hertz,
            language = %config.language_code,
            "Mock recognition stream opened"
        );

        Ok(Box::new(MockStream {
            events,
            transcript_after_bytes: self.transcript_after_bytes,
            received_bytes: 0,
            transcript_sent: false,
            ended: false,
        }))
    }
}

struct MockStream {
    events: StreamEvents,
    transcript_after_bytes: usize,
    received_bytes: usize,
    transcript_sent: bool,
    ended: bool,
}

impl RecognitionStream for MockStream {
    fn write(&mut self, chunk: &[u8]) -> Result<(), BackendError> {
        if self.ended {
            return Err(BackendError::StreamEnded);
        }

        self.received_bytes += chunk.len();
        if !self.transcript_sent && self.received_bytes >= self.transcript_after_bytes {
            self.transcript_sent = true;
            let text = format!(
                "window {} recognized {} bytes of audio",
                self.events.window(),
                self.received_bytes
            );
            self.events
                .emit(StreamEvent::Data(vec![RecognitionResult::new(text)]));
        }

        Ok(())
    }

    fn end(&mut self) -> Result<(), BackendError> {
        if self.ended {
            return Err(BackendError::StreamEnded);
        }

        self.ended = true;
        self.events.emit(StreamEvent::End);
        Ok(())
    }
}
