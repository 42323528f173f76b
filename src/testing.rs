//! Test doubles shared by the segmenter, session and registry tests.

use crate::protocol::{ClientSink, Outbound, ServerMessage};
use crate::speech::{
    BackendError, RecognitionConfig, RecognitionStream, SpeechBackend, StreamEvent, StreamEvents,
    WindowId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One operation a session performed against the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOp {
    Open(WindowId),
    Write(WindowId, Vec<u8>),
    End(WindowId),
}

#[derive(Default)]
struct RecordingState {
    ops: Vec<BackendOp>,
    emitters: HashMap<WindowId, StreamEvents>,
    fail_open: bool,
    fail_end: bool,
}

/// Recognizer that records every call and lets tests push events into
/// any stream it opened.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<BackendOp> {
        self.state.lock().ops.clone()
    }

    pub fn opens(&self) -> usize {
        self.count(|op| matches!(op, BackendOp::Open(_)))
    }

    pub fn ends(&self) -> usize {
        self.count(|op| matches!(op, BackendOp::End(_)))
    }

    pub fn writes(&self) -> Vec<(WindowId, Vec<u8>)> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                BackendOp::Write(window, bytes) => Some((*window, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    /// Emit `event` from the stream opened for `window`, as the backend would.
    pub fn emit(&self, window: WindowId, event: StreamEvent) -> bool {
        let emitter = self.state.lock().emitters.get(&window).cloned();
        emitter.map(|e| e.emit(event)).unwrap_or(false)
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn fail_end(&self, fail: bool) {
        self.state.lock().fail_end = fail;
    }

    fn count(&self, pred: impl Fn(&BackendOp) -> bool) -> usize {
        self.state.lock().ops.iter().filter(|op| pred(op)).count()
    }
}

impl SpeechBackend for RecordingBackend {
    fn open(
        &self,
        _config: &RecognitionConfig,
        events: StreamEvents,
    ) -> Result<Box<dyn RecognitionStream>, BackendError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(BackendError::Open {
                message: "backend unavailable".to_string(),
            });
        }

        let window = events.window();
        state.ops.push(BackendOp::Open(window));
        state.emitters.insert(window, events);
        Ok(Box::new(RecordingStream {
            window,
            state: self.state.clone(),
        }))
    }
}

struct RecordingStream {
    window: WindowId,
    state: Arc<Mutex<RecordingState>>,
}

impl RecognitionStream for RecordingStream {
    fn write(&mut self, chunk: &[u8]) -> Result<(), BackendError> {
        self.state
            .lock()
            .ops
            .push(BackendOp::Write(self.window, chunk.to_vec()));
        Ok(())
    }

    fn end(&mut self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.ops.push(BackendOp::End(self.window));
        if state.fail_end {
            return Err(BackendError::End {
                message: "backend refused to end stream".to_string(),
            });
        }
        Ok(())
    }
}

/// Client sink that keeps everything it was asked to send.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<Outbound>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().clone()
    }

    /// Text frames parsed back into server messages.
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|out| match out {
                Outbound::Text(json) => serde_json::from_str(json).ok(),
                _ => None,
            })
            .collect()
    }
}

impl ClientSink for RecordingSink {
    fn send(&self, message: Outbound) {
        self.sent.lock().push(message);
    }
}
