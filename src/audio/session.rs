//! # Audio Session
//!
//! One `Session` is bound to one AudioHook connection for its whole life.
//! It owns the connection's `AudioSegmenter`, turns recognizer output into
//! `transcript` messages, and handles the small JSON control envelope that
//! arrives on text frames.
//!
//! ## Session Lifecycle:
//! 1. **Created**: registered when the connection opens; no recognizer stream yet
//! 2. **Active**: binary frames flow into the segmenter, windows rotate
//! 3. **Closed**: the segmenter is closed and every later frame is ignored
//!
//! Sessions never touch the socket. Everything bound for the client goes
//! through the `ClientSink` they were created with.

use crate::audio::processor::AudioFormat;
use crate::audio::segmenter::{
    AudioSegmenter, RecognitionStatus, SegmenterConfig, SegmenterError, SegmenterStats,
    WindowState, WriteOutcome,
};
use crate::config::AppConfig;
use crate::protocol::{ClientMessage, ClientSink, DisconnectNotice, Outbound, ServerMessage};
use crate::registry::RoutingIds;
use crate::speech::{
    synthesize_audio, BackendError, RecognitionConfig, SpeechBackend, SynthesisAudioConfig,
    SynthesisBackend, VoiceConfig, WindowEvent, WindowEventReceiver, WindowId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to release recognition stream: {0}")]
    Teardown(#[from] BackendError),
}

/// Settings every new session is created with.
///
/// Derived from `AppConfig` at startup and replaced whenever the runtime
/// configuration changes; sessions that already exist keep their copy.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub segmenter: SegmenterConfig,
    pub voice: VoiceConfig,
    pub synthesis_audio: SynthesisAudioConfig,
    pub max_concurrent_sessions: usize,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let format = AudioFormat::new(
            config.audio.encoding,
            config.audio.sample_rate,
            config.audio.channels,
        );

        Self {
            segmenter: SegmenterConfig {
                recognition: RecognitionConfig {
                    encoding: config.audio.encoding,
                    sample_rate_hertz: config.audio.sample_rate,
                    audio_channel_count: config.audio.channels,
                    language_code: config.audio.language_code.clone(),
                },
                threshold_bytes: format.window_threshold_bytes(config.audio.window_duration_ms),
                silence_threshold: config.audio.silence_threshold,
            },
            voice: VoiceConfig {
                language_code: config.synthesis.language_code.clone(),
                gender: config.synthesis.voice_gender,
            },
            synthesis_audio: SynthesisAudioConfig {
                encoding: config.synthesis.encoding,
            },
            max_concurrent_sessions: config.performance.max_concurrent_sessions,
        }
    }
}

/// Who a session belongs to.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub connection_id: Uuid,
    /// Value of the `audiohook-session-id` header
    pub session_id: String,
    pub routing: RoutingIds,
    /// Request URL the connection was upgraded from
    pub url: String,
}

/// Backends a session talks to.
#[derive(Clone)]
pub struct SessionBackends {
    pub speech: Arc<dyn SpeechBackend>,
    pub synthesis: Arc<dyn SynthesisBackend>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionCounters {
    pub binary_frames: u64,
    pub text_frames: u64,
    pub audio_bytes: u64,
    pub transcripts: u64,
    pub errors: u64,
}

/// Snapshot of one session for the sessions API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub connection_id: Uuid,
    pub session_id: String,
    pub channel_id: String,
    pub transaction_id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub window_state: WindowState,
    pub current_window: Option<WindowId>,
    pub buffered_bytes: usize,
    pub threshold_bytes: usize,
    pub recognition_status: RecognitionStatus,
    pub silent: bool,
    pub counters: SessionCounters,
    pub segmenter: SegmenterStats,
}

pub struct Session {
    identity: SessionIdentity,
    created_at: DateTime<Utc>,
    segmenter: AudioSegmenter,
    client: Arc<dyn ClientSink>,
    synthesizer: Arc<dyn SynthesisBackend>,
    voice: VoiceConfig,
    synthesis_audio: SynthesisAudioConfig,
    pending_synthesis: Vec<JoinHandle<()>>,
    counters: SessionCounters,
    closed: bool,
}

impl Session {
    /// Create a session and the receiver for its recognizer events.
    pub fn new(
        identity: SessionIdentity,
        settings: &SessionSettings,
        backends: &SessionBackends,
        client: Arc<dyn ClientSink>,
    ) -> (Self, WindowEventReceiver) {
        let (segmenter, events) =
            AudioSegmenter::new(backends.speech.clone(), settings.segmenter.clone());

        info!(
            connection_id = %identity.connection_id,
            session_id = %identity.session_id,
            channel_id = %identity.routing.channel_id,
            transaction_id = %identity.routing.transaction_id,
            threshold = settings.segmenter.threshold_bytes,
            "Session created"
        );

        let session = Self {
            identity,
            created_at: Utc::now(),
            segmenter,
            client,
            synthesizer: backends.synthesis.clone(),
            voice: settings.voice.clone(),
            synthesis_audio: settings.synthesis_audio,
            pending_synthesis: Vec::new(),
            counters: SessionCounters::default(),
            closed: false,
        };
        (session, events)
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Forward one binary frame of audio to the segmenter.
    ///
    /// A write the segmenter refuses is reported to the client as an
    /// `error` message; the connection stays open.
    pub fn process_binary_message(&mut self, bytes: &[u8], channel_id: &str, transaction_id: &str) {
        if self.closed {
            debug!(session_id = %self.identity.session_id, "Audio after session close ignored");
            return;
        }

        self.counters.binary_frames += 1;
        self.counters.audio_bytes += bytes.len() as u64;

        match self.segmenter.write(bytes) {
            Ok(WriteOutcome::Rotated { closed, opened }) => {
                debug!(
                    session_id = %self.identity.session_id,
                    channel_id,
                    transaction_id,
                    closed,
                    opened = ?opened,
                    "Recognition window rotated"
                );
            }
            Ok(_) => {}
            Err(err) => {
                self.counters.errors += 1;
                warn!(
                    session_id = %self.identity.session_id,
                    channel_id,
                    transaction_id,
                    error = %err,
                    "Audio frame rejected"
                );
                let code = match err {
                    SegmenterError::AlreadyCompleted => "recognition_completed",
                    SegmenterError::StreamUnavailable(_) => "recognition_unavailable",
                };
                self.send(ServerMessage::error(
                    code,
                    err.to_string(),
                    Some(self.identity.session_id.clone()),
                ));
            }
        }
    }

    /// Handle one text frame of the control envelope.
    pub fn process_text_message(&mut self, text: &str) {
        if self.closed {
            return;
        }
        self.counters.text_frames += 1;

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                self.counters.errors += 1;
                warn!(session_id = %self.identity.session_id, error = %err, "Invalid control message");
                self.send(ServerMessage::error(
                    "invalid_message",
                    format!("Invalid message: {}", err),
                    Some(self.identity.session_id.clone()),
                ));
                return;
            }
        };

        match message {
            ClientMessage::Ping { timestamp } => {
                let timestamp =
                    timestamp.unwrap_or_else(|| Utc::now().timestamp_millis().max(0) as u64);
                self.send(ServerMessage::Pong { timestamp });
            }
            ClientMessage::Synthesize { text } => {
                let handle = self.synthesize(text);
                self.pending_synthesis.retain(|task| !task.is_finished());
                self.pending_synthesis.push(handle);
            }
            ClientMessage::Close { reason } => {
                info!(session_id = %self.identity.session_id, reason = ?reason, "Client requested close");
                let message = reason
                    .clone()
                    .unwrap_or_else(|| "Session closed by client.".to_string());
                self.send_disconnect("completed", &message, Map::new());
                self.client.send(Outbound::Close(reason));
            }
        }
    }

    /// Synthesize `text` in the background and send the audio as a binary
    /// frame, or an `error` message if the backend produced nothing.
    pub fn synthesize(&self, text: String) -> JoinHandle<()> {
        let synthesizer = self.synthesizer.clone();
        let client = self.client.clone();
        let voice = self.voice.clone();
        let audio = self.synthesis_audio;
        let session_id = self.identity.session_id.clone();

        tokio::spawn(async move {
            match synthesize_audio(synthesizer.as_ref(), &text, &voice, &audio).await {
                Ok(bytes) => {
                    debug!(session_id = %session_id, bytes = bytes.len(), "Synthesized audio ready");
                    client.send(Outbound::Binary(bytes));
                }
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "Speech synthesis failed");
                    let message = ServerMessage::error(
                        "synthesis_failed",
                        "Failed to synthesize speech.",
                        Some(session_id),
                    );
                    if let Some(out) = message.to_outbound() {
                        client.send(out);
                    }
                }
            }
        })
    }

    /// Feed a recognizer event to the segmenter and forward any transcript.
    pub fn handle_window_event(&mut self, event: WindowEvent) {
        if self.closed {
            debug!(window = event.window, "Recognizer event after session close discarded");
            return;
        }

        if let Some(transcript) = self.segmenter.handle_backend_event(event) {
            self.counters.transcripts += 1;
            self.send(ServerMessage::Transcript {
                session_id: self.identity.session_id.clone(),
                window: transcript.window,
                text: transcript.text,
                confidence: transcript.confidence,
            });
        }
    }

    pub fn send_disconnect(&self, reason: &str, message: &str, details: Map<String, Value>) {
        let mut notice = DisconnectNotice::new(reason, message);
        notice.details = details;
        self.send(notice.into_message(Some(self.identity.session_id.clone())));
    }

    /// Release the segmenter and stop any outstanding synthesis.
    ///
    /// Only the first call does anything.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for task in self.pending_synthesis.drain(..) {
            task.abort();
        }

        info!(
            session_id = %self.identity.session_id,
            connection_id = %self.identity.connection_id,
            duration_seconds = self.duration_seconds(),
            transcripts = self.counters.transcripts,
            audio_bytes = self.counters.audio_bytes,
            "Session closed"
        );
        self.segmenter.close()?;
        Ok(())
    }

    pub fn duration_seconds(&self) -> f64 {
        let duration = Utc::now().signed_duration_since(self.created_at);
        duration.num_milliseconds() as f64 / 1000.0
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            connection_id: self.identity.connection_id,
            session_id: self.identity.session_id.clone(),
            channel_id: self.identity.routing.channel_id.clone(),
            transaction_id: self.identity.routing.transaction_id.clone(),
            url: self.identity.url.clone(),
            created_at: self.created_at,
            duration_seconds: self.duration_seconds(),
            window_state: self.segmenter.window_state(),
            current_window: self.segmenter.current_window(),
            buffered_bytes: self.segmenter.buffered_bytes(),
            threshold_bytes: self.segmenter.threshold_bytes(),
            recognition_status: self.segmenter.status(),
            silent: self.segmenter.is_silent(),
            counters: self.counters.clone(),
            segmenter: self.segmenter.stats().clone(),
        }
    }

    fn send(&self, message: ServerMessage) {
        match message.to_outbound() {
            Some(out) => self.client.send(out),
            None => warn!(session_id = %self.identity.session_id, "Failed to serialize outbound message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::recognition::RecognitionResult;
    use crate::speech::{SilenceSynthesizer, StreamEvent};
    use crate::testing::{RecordingBackend, RecordingSink};

    struct Harness {
        session: Session,
        events: WindowEventReceiver,
        backend: RecordingBackend,
        sink: RecordingSink,
    }

    fn harness() -> Harness {
        let mut config = AppConfig::default();
        config.audio.window_duration_ms = 1;
        let settings = SessionSettings::from_config(&config);
        let backend = RecordingBackend::new();
        let sink = RecordingSink::new();
        let backends = SessionBackends {
            speech: Arc::new(backend.clone()),
            synthesis: Arc::new(SilenceSynthesizer::new(8000, 10)),
        };
        let identity = SessionIdentity {
            connection_id: Uuid::new_v4(),
            session_id: "sess-1".to_string(),
            routing: RoutingIds {
                channel_id: "chan".to_string(),
                transaction_id: "txn".to_string(),
            },
            url: "/chan/txn".to_string(),
        };
        let (session, events) = Session::new(identity, &settings, &backends, Arc::new(sink.clone()));
        Harness {
            session,
            events,
            backend,
            sink,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_settings_threshold_from_config() {
        let settings = SessionSettings::from_config(&AppConfig::default());
        assert_eq!(settings.segmenter.threshold_bytes, 40_000);
        assert_eq!(settings.segmenter.recognition.sample_rate_hertz, 8000);
        assert_eq!(settings.max_concurrent_sessions, 100);
    }

    #[test]
    fn test_binary_frames_reach_segmenter() {
        let mut h = harness();
        h.session.process_binary_message(&[0x10; 4], "chan", "txn");

        assert_eq!(h.backend.writes(), vec![(1, vec![0x10; 4])]);
        let summary = h.session.summary();
        assert_eq!(summary.counters.binary_frames, 1);
        assert_eq!(summary.buffered_bytes, 4);
        assert_eq!(summary.current_window, Some(1));
    }

    #[test]
    fn test_transcript_is_sent_to_client() {
        let mut h = harness();
        h.session.process_binary_message(&[0x10; 4], "chan", "txn");
        h.backend.emit(1, StreamEvent::Data(vec![RecognitionResult::new("hi there")]));

        while let Ok(event) = h.events.try_recv() {
            h.session.handle_window_event(event);
        }

        assert_eq!(
            h.sink.messages(),
            vec![ServerMessage::Transcript {
                session_id: "sess-1".to_string(),
                window: 1,
                text: "hi there".to_string(),
                confidence: 1.0,
            }]
        );
    }

    #[test]
    fn test_default_backend_windows_follow_byte_threshold() {
        let config = AppConfig::default();
        let settings = SessionSettings::from_config(&config);
        let backends = SessionBackends {
            speech: crate::speech::build_speech_backend(&config).unwrap(),
            synthesis: Arc::new(SilenceSynthesizer::new(8000, 10)),
        };
        let identity = SessionIdentity {
            connection_id: Uuid::new_v4(),
            session_id: "sess-1".to_string(),
            routing: RoutingIds {
                channel_id: "chan".to_string(),
                transaction_id: "txn".to_string(),
            },
            url: "/chan/txn".to_string(),
        };
        let sink = RecordingSink::new();
        let (mut session, mut events) =
            Session::new(identity, &settings, &backends, Arc::new(sink.clone()));

        let chunk = vec![0x10u8; 1000];
        for _ in 0..settings.segmenter.threshold_bytes / chunk.len() {
            session.process_binary_message(&chunk, "chan", "txn");
            while let Ok(event) = events.try_recv() {
                session.handle_window_event(event);
            }
        }

        let summary = session.summary();
        assert_eq!(summary.segmenter.windows_opened, 2);
        assert_eq!(summary.segmenter.rotations, 1);
        assert_eq!(summary.segmenter.transcripts, 1);
        assert_eq!(summary.current_window, Some(2));
        assert_eq!(summary.buffered_bytes, 0);
        assert!(matches!(
            sink.messages().as_slice(),
            [ServerMessage::Transcript { window: 1, .. }]
        ));
    }

    #[test]
    fn test_rejected_write_sends_error() {
        let mut h = harness();
        h.backend.fail_open(true);
        h.session.process_binary_message(&[0x10; 4], "chan", "txn");

        match h.sink.messages().as_slice() {
            [ServerMessage::Error { code, .. }] => assert_eq!(code, "recognition_unavailable"),
            other => panic!("Expected one error message, got {:?}", other),
        }
        assert_eq!(h.session.summary().counters.errors, 1);
    }

    #[test]
    fn test_ping_and_invalid_messages() {
        let mut h = harness();
        h.session.process_text_message(r#"{"type":"ping","timestamp":42}"#);
        h.session.process_text_message("not json");

        let messages = h.sink.messages();
        assert_eq!(messages[0], ServerMessage::Pong { timestamp: 42 });
        assert!(matches!(&messages[1], ServerMessage::Error { code, .. } if code == "invalid_message"));
    }

    #[test]
    fn test_close_message_disconnects_and_closes_socket() {
        let mut h = harness();
        h.session.process_text_message(r#"{"type":"close"}"#);

        let sent = h.sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &h.sink.messages()[0],
            ServerMessage::Disconnect { reason, .. } if reason == "completed"
        ));
        assert_eq!(sent[1], Outbound::Close(None));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut h = harness();
        h.session.process_binary_message(&[0x10; 4], "chan", "txn");

        h.session.close().unwrap();
        let ops = h.backend.ops().len();
        h.session.close().unwrap();

        assert_eq!(h.backend.ops().len(), ops);
        assert_eq!(h.backend.ends(), 1);

        h.session.process_binary_message(&[0x10; 4], "chan", "txn");
        assert_eq!(h.backend.writes().len(), 1);
    }

    #[test]
    fn test_close_reports_teardown_failure() {
        let mut h = harness();
        h.session.process_binary_message(&[0x10; 4], "chan", "txn");
        h.backend.fail_end(true);

        assert!(matches!(h.session.close(), Err(SessionError::Teardown(_))));
        assert!(h.session.is_closed());
        assert!(h.session.close().is_ok());
    }

    #[tokio::test]
    async fn test_synthesize_sends_audio() {
        let mut h = harness();
        h.session.process_text_message(r#"{"type":"synthesize","text":"hello"}"#);
        settle().await;

        assert_eq!(h.sink.sent(), vec![Outbound::Binary(vec![0xFF; 80])]);
    }

    #[tokio::test]
    async fn test_synthesize_without_audio_reports_error() {
        let h = harness();
        h.session.synthesize("  ".to_string()).await.unwrap();

        assert!(matches!(
            &h.sink.messages()[0],
            ServerMessage::Error { code, message, .. }
                if code == "synthesis_failed" && message == "Failed to synthesize speech."
        ));
    }
}
