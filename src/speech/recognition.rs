//! # Streaming Recognition Interface
//!
//! A `SpeechBackend` opens a `RecognitionStream` for one window of audio.
//! The stream accepts raw audio bytes and is ended when the window closes.
//! Results flow back asynchronously through the `StreamEvents` handle the
//! backend was given at open time.
//!
//! ## Event Routing:
//! Every `StreamEvents` handle is tagged with the id of the window it was
//! opened for and shares an "attached" flag with the segmenter. Once the
//! segmenter retires a window it detaches the handle, and anything the
//! backend emits afterwards is dropped at the source. Events that were
//! already queued still carry their window id, so the segmenter can tell
//! them apart from events of the window that replaced it.

use super::error::BackendError;
use crate::audio::processor::AudioEncoding;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Monotonic per-session window number. The first window is 1.
pub type WindowId = u64;

/// Fixed recognizer request configuration, built once per session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionConfig {
    pub encoding: AudioEncoding,
    pub sample_rate_hertz: u32,
    pub audio_channel_count: u8,
    pub language_code: String,
}

/// One hypothesis for a recognized span of audio.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionAlternative {
    pub transcript: String,
    pub confidence: Option<f32>,
}

/// One recognition result; `alternatives[0]` is the most likely hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub alternatives: Vec<RecognitionAlternative>,
    pub is_final: bool,
}

impl RecognitionResult {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            alternatives: vec![RecognitionAlternative {
                transcript: transcript.into(),
                confidence: None,
            }],
            is_final: true,
        }
    }

    /// Transcript of the top alternative, if the result has any.
    pub fn top_transcript(&self) -> Option<&str> {
        self.alternatives.first().map(|alt| alt.transcript.as_str())
    }
}

/// Events a recognition stream can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Recognition results, in the order the backend produced them
    Data(Vec<RecognitionResult>),
    /// Backend-side failure for this stream
    Error(String),
    /// The backend finished the stream
    End,
}

/// A stream event tagged with the window whose stream produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEvent {
    pub window: WindowId,
    pub event: StreamEvent,
}

/// Receiving side of a session's recognizer events.
pub type WindowEventReceiver = mpsc::UnboundedReceiver<WindowEvent>;

/// Emitter handed to a backend when a stream is opened.
#[derive(Debug, Clone)]
pub struct StreamEvents {
    window: WindowId,
    tx: mpsc::UnboundedSender<WindowEvent>,
    attached: Arc<AtomicBool>,
}

impl StreamEvents {
    pub(crate) fn new(window: WindowId, tx: mpsc::UnboundedSender<WindowEvent>) -> Self {
        Self {
            window,
            tx,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Window this emitter belongs to.
    pub fn window(&self) -> WindowId {
        self.window
    }

    /// Whether the owning segmenter still listens to this stream.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Deliver an event to the owning session.
    ///
    /// Returns `false` when the event was dropped because the stream was
    /// detached or the session is gone.
    pub fn emit(&self, event: StreamEvent) -> bool {
        if !self.is_attached() {
            return false;
        }

        self.tx
            .send(WindowEvent {
                window: self.window,
                event,
            })
            .is_ok()
    }

    /// Stop delivering events from this stream. Affects every clone.
    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }
}

/// Factory for recognition streams.
///
/// ## Rust Concepts:
/// - **Send + Sync**: one backend is shared by every session through `Arc<dyn SpeechBackend>`
/// - **Box<dyn RecognitionStream>**: each window owns its stream exclusively
pub trait SpeechBackend: Send + Sync {
    fn open(
        &self,
        config: &RecognitionConfig,
        events: StreamEvents,
    ) -> Result<Box<dyn RecognitionStream>, BackendError>;
}

/// Write half of one open recognition stream.
pub trait RecognitionStream: Send {
    /// Forward audio bytes to the recognizer, in order.
    fn write(&mut self, chunk: &[u8]) -> Result<(), BackendError>;

    /// Signal that no more audio follows for this stream.
    fn end(&mut self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_events_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = StreamEvents::new(3, tx);
        let backend_copy = events.clone();

        assert!(backend_copy.emit(StreamEvent::End));
        events.detach();
        assert!(!backend_copy.emit(StreamEvent::Error("late".to_string())));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.window, 3);
        assert_eq!(received.event, StreamEvent::End);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_top_transcript() {
        let result = RecognitionResult::new("hello");
        assert_eq!(result.top_transcript(), Some("hello"));

        let empty = RecognitionResult {
            alternatives: vec![],
            is_final: false,
        };
        assert_eq!(empty.top_transcript(), None);
    }
}
