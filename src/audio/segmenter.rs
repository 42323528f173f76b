//! # Audio Segmentation
//!
//! Turns the unbounded stream of audio chunks arriving on one connection into
//! a sequence of bounded recognition windows. Each window drives exactly one
//! backend recognition stream from open to end.
//!
//! ## Window Lifecycle:
//! 1. **Idle**: no stream open (before the first chunk, or after a failed reopen)
//! 2. **Streaming**: a stream is open and receives every chunk verbatim
//! 3. **Draining**: the current stream is ended and detached, the byte count
//!    resets, and a new stream opens before control returns to the caller
//! 4. **Closed**: terminal; writes are ignored
//!
//! Rotation happens only when a window has buffered at least
//! `threshold_bytes`. A transcript marks its window `Complete` but the window
//! keeps taking audio until the threshold; later results for it are dropped.
//!
//! ## Ownership:
//! The open stream lives inside `Window::Streaming`, so "stream present" and
//! "state is Streaming" cannot disagree. Retiring a window consumes it: the
//! stream is ended, its event emitter detached, and the handle dropped before
//! the next stream is opened.

use crate::audio::processor;
use crate::speech::{
    BackendError, RecognitionConfig, RecognitionStream, SpeechBackend, StreamEvent, StreamEvents,
    WindowEvent, WindowEventReceiver, WindowId,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Byte written to keep a stream alive when a chunk carries no audio.
const KEEP_ALIVE: [u8; 1] = [0];

/// Fixed per-session segmentation settings.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Recognizer request configuration used for every window
    pub recognition: RecognitionConfig,
    /// Window boundary in bytes
    pub threshold_bytes: usize,
    /// Mean squared amplitude below which a chunk counts as silent
    pub silence_threshold: f64,
}

/// Externally visible window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    Idle,
    Streaming,
    Draining,
    Closed,
}

/// Recognition progress of the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionStatus {
    /// No audio forwarded yet
    None,
    /// Audio is flowing into the current window
    Processing,
    /// The current (or last) window delivered its transcript
    Complete,
}

/// Recognized text for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    pub window: WindowId,
    pub text: String,
    pub confidence: f32,
}

/// What happened to a chunk passed to `write`.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Segmenter is closed; nothing was forwarded
    Ignored,
    /// Empty chunk; a single keep-alive byte was written instead
    KeepAlive,
    /// Chunk forwarded; the window now holds `buffered_bytes`
    Forwarded { buffered_bytes: usize },
    /// Chunk forwarded and the window rotated. `opened` is `None` when the
    /// replacement stream could not be opened.
    Rotated {
        closed: WindowId,
        opened: Option<WindowId>,
    },
}

#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("recognition stream unavailable: {0}")]
    StreamUnavailable(#[source] BackendError),
    #[error("Speech recognition has already completed.")]
    AlreadyCompleted,
}

/// Counters for one segmenter, exposed through the sessions API.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SegmenterStats {
    pub windows_opened: u64,
    pub rotations: u64,
    pub transcripts: u64,
    pub bytes_forwarded: u64,
    pub keep_alives: u64,
    pub silent_chunks: u64,
    pub backend_errors: u64,
    pub stale_events: u64,
}

/// The stream currently owned by a window, plus its event subscription.
struct ActiveWindow {
    id: WindowId,
    stream: Box<dyn RecognitionStream>,
    events: StreamEvents,
    transcribed: bool,
}

impl ActiveWindow {
    /// End the stream for writes, unsubscribe from its events, and release it.
    fn retire(mut self) -> Result<(), BackendError> {
        let ended = self.stream.end();
        self.events.detach();
        ended
    }
}

enum Window {
    Idle,
    Streaming(ActiveWindow),
    Draining,
    Closed,
}

/// Per-session windowing state machine in front of a `SpeechBackend`.
pub struct AudioSegmenter {
    backend: Arc<dyn SpeechBackend>,
    config: SegmenterConfig,
    window: Window,
    last_window: WindowId,
    buffered_bytes: usize,
    silent: bool,
    status: RecognitionStatus,
    events_tx: mpsc::UnboundedSender<WindowEvent>,
    stats: SegmenterStats,
}

impl AudioSegmenter {
    /// Create an idle segmenter.
    ///
    /// ## Returns:
    /// The segmenter and the receiver on which every stream it opens will
    /// deliver its events. The owner feeds those events back through
    /// `handle_backend_event`.
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        config: SegmenterConfig,
    ) -> (Self, WindowEventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let segmenter = Self {
            backend,
            config,
            window: Window::Idle,
            last_window: 0,
            buffered_bytes: 0,
            silent: false,
            status: RecognitionStatus::None,
            events_tx,
            stats: SegmenterStats::default(),
        };
        (segmenter, events_rx)
    }

    pub fn window_state(&self) -> WindowState {
        match self.window {
            Window::Idle => WindowState::Idle,
            Window::Streaming(_) => WindowState::Streaming,
            Window::Draining => WindowState::Draining,
            Window::Closed => WindowState::Closed,
        }
    }

    /// Id of the window whose stream is currently open.
    pub fn current_window(&self) -> Option<WindowId> {
        match &self.window {
            Window::Streaming(active) => Some(active.id),
            _ => None,
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn threshold_bytes(&self) -> usize {
        self.config.threshold_bytes
    }

    /// Silence verdict of the most recent non-empty chunk.
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn status(&self) -> RecognitionStatus {
        self.status
    }

    pub fn stats(&self) -> &SegmenterStats {
        &self.stats
    }

    /// Forward one chunk of audio to the current window.
    ///
    /// ## Behaviour:
    /// - Closed segmenter: no-op
    /// - Empty chunk: one keep-alive byte is written, nothing is counted
    /// - Otherwise the chunk is written in full, counted, and the threshold is
    ///   checked only after the whole chunk went to the current window
    ///
    /// ## Errors:
    /// A write is rejected only when no stream can be opened for it.
    pub fn write(&mut self, chunk: &[u8]) -> Result<WriteOutcome, SegmenterError> {
        if matches!(self.window, Window::Closed) {
            trace!(bytes = chunk.len(), "Write on closed segmenter ignored");
            return Ok(WriteOutcome::Ignored);
        }

        if chunk.is_empty() {
            let (window, result) = {
                let active = self.active_window()?;
                (active.id, active.stream.write(&KEEP_ALIVE))
            };
            self.stats.keep_alives += 1;
            if let Err(err) = result {
                self.record_backend_error(window, &err);
            }
            return Ok(WriteOutcome::KeepAlive);
        }

        self.silent = processor::is_silent(
            chunk,
            self.config.recognition.encoding,
            self.config.silence_threshold,
        );
        if self.silent {
            self.stats.silent_chunks += 1;
        }

        let (window, transcribed, result) = {
            let active = self.active_window()?;
            (active.id, active.transcribed, active.stream.write(chunk))
        };
        if let Err(err) = result {
            self.record_backend_error(window, &err);
        }

        self.buffered_bytes += chunk.len();
        self.stats.bytes_forwarded += chunk.len() as u64;
        if !transcribed {
            self.status = RecognitionStatus::Processing;
        }
        trace!(
            window,
            bytes = chunk.len(),
            buffered = self.buffered_bytes,
            silent = self.silent,
            "Audio chunk forwarded"
        );

        if self.buffered_bytes >= self.config.threshold_bytes {
            let opened = self.rotate();
            return Ok(WriteOutcome::Rotated {
                closed: window,
                opened,
            });
        }

        Ok(WriteOutcome::Forwarded {
            buffered_bytes: self.buffered_bytes,
        })
    }

    /// Apply one event produced by a recognition stream.
    ///
    /// Events from a window that is no longer current, or that arrive after
    /// close, are discarded. The first data event on the current window
    /// yields its transcript; the window stays open and later data events
    /// for it are dropped.
    pub fn handle_backend_event(&mut self, event: WindowEvent) -> Option<TranscriptEvent> {
        if matches!(self.window, Window::Closed) {
            debug!(window = event.window, "Discarding recognizer event for closed segmenter");
            return None;
        }

        if self.current_window() != Some(event.window) {
            self.stats.stale_events += 1;
            debug!(
                window = event.window,
                current = ?self.current_window(),
                "Ignoring event from retired recognition stream"
            );
            return None;
        }

        match event.event {
            StreamEvent::Data(results) => {
                let Window::Streaming(active) = &mut self.window else {
                    return None;
                };
                if active.transcribed {
                    debug!(window = event.window, "Window already transcribed; extra results dropped");
                    return None;
                }
                active.transcribed = true;

                let text: String = results
                    .iter()
                    .filter_map(|result| result.top_transcript())
                    .collect();

                self.status = RecognitionStatus::Complete;
                self.stats.transcripts += 1;
                info!(window = event.window, chars = text.len(), "Window transcript received");

                Some(TranscriptEvent {
                    window: event.window,
                    text,
                    confidence: 1.0,
                })
            }
            StreamEvent::Error(message) => {
                self.stats.backend_errors += 1;
                warn!(window = event.window, error = %message, "Speech recognition error");
                None
            }
            StreamEvent::End => {
                debug!(window = event.window, "Speech recognition stream ended");
                None
            }
        }
    }

    /// End and release any open stream; every later write is a no-op.
    ///
    /// Calling this again performs no backend operations.
    pub fn close(&mut self) -> Result<(), BackendError> {
        let previous = std::mem::replace(&mut self.window, Window::Closed);
        self.buffered_bytes = 0;

        match previous {
            Window::Closed => Ok(()),
            Window::Streaming(active) => {
                info!(window = active.id, "Closing recognition window");
                active.retire()
            }
            Window::Idle | Window::Draining => Ok(()),
        }
    }

    /// The open window, opening one first when idle.
    fn active_window(&mut self) -> Result<&mut ActiveWindow, SegmenterError> {
        if matches!(self.window, Window::Idle) {
            match self.open_window() {
                Ok(active) => self.window = Window::Streaming(active),
                Err(err) => {
                    warn!(error = %err, "Unable to open recognition stream");
                    return Err(if self.status == RecognitionStatus::Complete {
                        SegmenterError::AlreadyCompleted
                    } else {
                        SegmenterError::StreamUnavailable(err)
                    });
                }
            }
        }

        match &mut self.window {
            Window::Streaming(active) => Ok(active),
            _ => Err(SegmenterError::StreamUnavailable(BackendError::Open {
                message: "no recognition window is open".to_string(),
            })),
        }
    }

    fn open_window(&mut self) -> Result<ActiveWindow, BackendError> {
        let id = self.last_window + 1;
        let events = StreamEvents::new(id, self.events_tx.clone());

        match self.backend.open(&self.config.recognition, events.clone()) {
            Ok(stream) => {
                self.last_window = id;
                self.stats.windows_opened += 1;
                info!(window = id, threshold = self.config.threshold_bytes, "Recognition window opened");
                Ok(ActiveWindow {
                    id,
                    stream,
                    events,
                    transcribed: false,
                })
            }
            Err(err) => {
                events.detach();
                Err(err)
            }
        }
    }

    /// Close the current window and open its successor.
    ///
    /// Returns the new window id, or `None` if the backend refused to open
    /// one; the segmenter is then idle and the next write retries.
    fn rotate(&mut self) -> Option<WindowId> {
        let previous = std::mem::replace(&mut self.window, Window::Draining);
        if let Window::Streaming(active) = previous {
            let id = active.id;
            if let Err(err) = active.retire() {
                self.record_backend_error(id, &err);
            }
        }

        self.buffered_bytes = 0;
        self.stats.rotations += 1;

        match self.open_window() {
            Ok(active) => {
                let id = active.id;
                self.window = Window::Streaming(active);
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, "Recognition window could not be reopened");
                self.window = Window::Idle;
                None
            }
        }
    }

    fn record_backend_error(&mut self, window: WindowId, err: &BackendError) {
        self.stats.backend_errors += 1;
        warn!(window, error = %err, "Recognition stream operation failed");
    }
}

impl Drop for AudioSegmenter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "Recognition stream failed to end on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::AudioEncoding;
    use crate::speech::recognition::RecognitionResult;
    use crate::testing::{BackendOp, RecordingBackend};

    const THRESHOLD: usize = 10;

    fn segmenter(backend: &RecordingBackend) -> (AudioSegmenter, WindowEventReceiver) {
        let config = SegmenterConfig {
            recognition: RecognitionConfig {
                encoding: AudioEncoding::Mulaw,
                sample_rate_hertz: 8000,
                audio_channel_count: 1,
                language_code: "en-US".to_string(),
            },
            threshold_bytes: THRESHOLD,
            silence_threshold: 0.0001,
        };
        AudioSegmenter::new(Arc::new(backend.clone()), config)
    }

    fn drain(rx: &mut WindowEventReceiver, seg: &mut AudioSegmenter) -> Vec<TranscriptEvent> {
        let mut transcripts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Some(t) = seg.handle_backend_event(event) {
                transcripts.push(t);
            }
        }
        transcripts
    }

    fn write_total(seg: &mut AudioSegmenter, sizes: &[usize]) {
        for &size in sizes {
            seg.write(&vec![0x10u8; size]).unwrap();
        }
    }

    #[test]
    fn test_below_threshold_keeps_window() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);

        write_total(&mut seg, &[3, 3, 3]);

        assert_eq!(backend.opens(), 1);
        assert_eq!(backend.ends(), 0);
        assert_eq!(seg.buffered_bytes(), THRESHOLD - 1);
        assert_eq!(seg.current_window(), Some(1));
        assert_eq!(seg.window_state(), WindowState::Streaming);
    }

    #[test]
    fn test_exact_threshold_rotates_once() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);

        seg.write(&[0x10; 3]).unwrap();
        seg.write(&[0x10; 3]).unwrap();
        let outcome = seg.write(&[0x10; 4]).unwrap();

        assert_eq!(
            outcome,
            WriteOutcome::Rotated {
                closed: 1,
                opened: Some(2)
            }
        );
        assert_eq!(backend.opens(), 2);
        assert_eq!(backend.ends(), 1);
        assert_eq!(seg.buffered_bytes(), 0);
        assert_eq!(seg.current_window(), Some(2));
    }

    #[test]
    fn test_crossing_chunk_stays_in_its_window() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);

        write_total(&mut seg, &[3, 3, 5]);

        assert_eq!(backend.opens(), 2);
        assert_eq!(backend.ends(), 1);
        assert_eq!(seg.buffered_bytes(), 0);
        assert!(backend.writes().iter().all(|(window, _)| *window == 1));
        assert_eq!(backend.writes().iter().map(|(_, b)| b.len()).sum::<usize>(), 11);
    }

    #[test]
    fn test_writes_are_forwarded_in_order_before_rotation() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);
        let a = vec![0x11u8; THRESHOLD - 1];
        let b = vec![0x22u8; 2];

        seg.write(&a).unwrap();
        seg.write(&b).unwrap();

        assert_eq!(
            backend.ops(),
            vec![
                BackendOp::Open(1),
                BackendOp::Write(1, a),
                BackendOp::Write(1, b),
                BackendOp::End(1),
                BackendOp::Open(2),
            ]
        );
    }

    #[test]
    fn test_empty_chunk_writes_keep_alive_byte() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);

        assert_eq!(seg.write(&[]).unwrap(), WriteOutcome::KeepAlive);
        assert_eq!(backend.writes(), vec![(1, vec![0u8])]);
        assert_eq!(seg.buffered_bytes(), 0);
        assert_eq!(seg.stats().keep_alives, 1);
    }

    #[test]
    fn test_silence_does_not_gate_forwarding() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);

        seg.write(&[0xFF; 4]).unwrap();
        assert!(seg.is_silent());
        assert_eq!(backend.writes().len(), 1);

        seg.write(&[0x00, 0x80, 0x00, 0x80]).unwrap();
        assert!(!seg.is_silent());
        assert_eq!(backend.writes().len(), 2);
        assert_eq!(seg.buffered_bytes(), 8);
        assert_eq!(seg.stats().silent_chunks, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);
        seg.write(&[0x10; 4]).unwrap();

        seg.close().unwrap();
        let after_first = backend.ops().len();
        seg.close().unwrap();

        assert_eq!(backend.ops().len(), after_first);
        assert_eq!(backend.ends(), 1);
        assert_eq!(seg.window_state(), WindowState::Closed);

        assert_eq!(seg.write(&[0x10; 4]).unwrap(), WriteOutcome::Ignored);
        assert_eq!(backend.ops().len(), after_first);
    }

    #[test]
    fn test_drop_releases_open_stream() {
        let backend = RecordingBackend::new();
        {
            let (mut seg, _rx) = segmenter(&backend);
            seg.write(&[0x10; 4]).unwrap();
        }
        assert_eq!(backend.ends(), 1);
    }

    #[test]
    fn test_transcript_does_not_rotate_window() {
        let backend = RecordingBackend::new();
        let (mut seg, mut rx) = segmenter(&backend);
        seg.write(&[0x10; 4]).unwrap();

        backend.emit(
            1,
            StreamEvent::Data(vec![
                RecognitionResult::new("hello "),
                RecognitionResult::new("world"),
            ]),
        );
        let transcripts = drain(&mut rx, &mut seg);

        assert_eq!(
            transcripts,
            vec![TranscriptEvent {
                window: 1,
                text: "hello world".to_string(),
                confidence: 1.0,
            }]
        );
        assert_eq!(seg.status(), RecognitionStatus::Complete);
        assert_eq!(seg.current_window(), Some(1));
        assert_eq!(seg.buffered_bytes(), 4);
        assert_eq!(backend.opens(), 1);
        assert_eq!(backend.ends(), 0);
    }

    #[test]
    fn test_window_after_transcript_rotates_only_at_threshold() {
        let backend = RecordingBackend::new();
        let (mut seg, mut rx) = segmenter(&backend);
        seg.write(&[0x10; 4]).unwrap();

        backend.emit(1, StreamEvent::Data(vec![RecognitionResult::new("first")]));
        backend.emit(1, StreamEvent::Data(vec![RecognitionResult::new("again")]));
        let transcripts = drain(&mut rx, &mut seg);
        assert_eq!(transcripts.len(), 1);
        assert_eq!(transcripts[0].text, "first");
        assert_eq!(seg.stats().transcripts, 1);

        seg.write(&[0x10; 5]).unwrap();
        assert_eq!(seg.current_window(), Some(1));
        assert_eq!(seg.buffered_bytes(), THRESHOLD - 1);
        assert_eq!(seg.status(), RecognitionStatus::Complete);

        let outcome = seg.write(&[0x10; 1]).unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Rotated {
                closed: 1,
                opened: Some(2)
            }
        );
        assert!(backend.writes().iter().all(|(window, _)| *window == 1));

        seg.write(&[0x10; 2]).unwrap();
        assert_eq!(seg.status(), RecognitionStatus::Processing);
        assert_eq!(seg.stats().rotations, 1);
    }

    #[test]
    fn test_stale_stream_events_are_not_attributed_to_new_window() {
        let backend = RecordingBackend::new();
        let (mut seg, mut rx) = segmenter(&backend);
        seg.write(&[0x10; 4]).unwrap();

        // Queued before rotation, delivered after it.
        assert!(backend.emit(1, StreamEvent::Data(vec![RecognitionResult::new("late")])));
        seg.write(&[0x10; THRESHOLD]).unwrap();
        assert_eq!(seg.current_window(), Some(2));

        // Emitted after rotation: dropped at the source.
        assert!(!backend.emit(1, StreamEvent::Data(vec![RecognitionResult::new("later")])));

        assert!(drain(&mut rx, &mut seg).is_empty());
        assert_eq!(seg.current_window(), Some(2));
        assert_eq!(seg.status(), RecognitionStatus::Processing);
        assert_eq!(seg.stats().stale_events, 1);
    }

    #[test]
    fn test_missing_transcript_does_not_block_next_window() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);

        seg.write(&[0x10; THRESHOLD]).unwrap();
        seg.write(&[0x20; 3]).unwrap();

        assert_eq!(backend.writes().last(), Some(&(2, vec![0x20; 3])));
        assert_eq!(seg.buffered_bytes(), 3);
    }

    #[test]
    fn test_backend_error_keeps_window_open() {
        let backend = RecordingBackend::new();
        let (mut seg, mut rx) = segmenter(&backend);
        seg.write(&[0x10; 4]).unwrap();

        backend.emit(1, StreamEvent::Error("quota exceeded".to_string()));
        assert!(drain(&mut rx, &mut seg).is_empty());
        assert_eq!(seg.current_window(), Some(1));
        assert_eq!(seg.stats().backend_errors, 1);

        seg.write(&[0x10; 6]).unwrap();
        assert_eq!(seg.current_window(), Some(2));
        assert_eq!(backend.ends(), 1);
    }

    #[test]
    fn test_open_failure_rejects_write_deterministically() {
        let backend = RecordingBackend::new();
        let (mut seg, _rx) = segmenter(&backend);
        backend.fail_open(true);

        assert!(matches!(
            seg.write(&[0x10; 4]),
            Err(SegmenterError::StreamUnavailable(_))
        ));
        assert!(backend.writes().is_empty());
        assert_eq!(seg.buffered_bytes(), 0);

        backend.fail_open(false);
        seg.write(&[0x10; 4]).unwrap();
        assert_eq!(seg.current_window(), Some(1));
        assert_eq!(seg.buffered_bytes(), 4);
    }

    #[test]
    fn test_write_after_completed_window_without_successor_is_rejected() {
        let backend = RecordingBackend::new();
        let (mut seg, mut rx) = segmenter(&backend);
        seg.write(&[0x10; 4]).unwrap();

        backend.emit(1, StreamEvent::Data(vec![RecognitionResult::new("done")]));
        assert_eq!(drain(&mut rx, &mut seg).len(), 1);

        backend.fail_open(true);
        assert_eq!(
            seg.write(&[0x10; 6]).unwrap(),
            WriteOutcome::Rotated {
                closed: 1,
                opened: None
            }
        );
        assert_eq!(seg.window_state(), WindowState::Idle);

        assert!(matches!(
            seg.write(&[0x10; 4]),
            Err(SegmenterError::AlreadyCompleted)
        ));
        assert_eq!(backend.writes().len(), 2);
    }

    #[test]
    fn test_events_after_close_are_discarded() {
        let backend = RecordingBackend::new();
        let (mut seg, mut rx) = segmenter(&backend);
        seg.write(&[0x10; 4]).unwrap();
        backend.emit(1, StreamEvent::Data(vec![RecognitionResult::new("queued")]));

        seg.close().unwrap();

        assert!(drain(&mut rx, &mut seg).is_empty());
        assert_eq!(backend.opens(), 1);
    }
}
