//! Recording handles for exercising the relay without sockets.

use std::sync::{Arc, Mutex};

use crate::net::connection::ConnectionId;
use crate::relay::event::Frame;
use crate::relay::handle::{ClientHandle, Connector, EventSink, OutboundHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetUrl(String),
    Start,
    Send(Frame),
    Close(u16, String),
}

/// Serves as either leg and records every call made on it.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ClientHandle for Recorder {
    fn send(&self, frame: Frame) {
        self.push(Call::Send(frame));
    }

    fn close(&self, code: u16, reason: &str) {
        self.push(Call::Close(code, reason.to_string()));
    }
}

impl OutboundHandle for Recorder {
    fn set_url(&mut self, url: String) {
        self.push(Call::SetUrl(url));
    }

    fn start(&mut self) {
        self.push(Call::Start);
    }

    fn send(&mut self, frame: Frame) {
        self.push(Call::Send(frame));
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.push(Call::Close(code, reason.to_string()));
    }
}

/// Hands out recorders and keeps each pairing's upstream event sink.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    legs: Arc<Mutex<Vec<(ConnectionId, Recorder, EventSink)>>>,
}

impl RecordingConnector {
    pub fn leg(&self, id: ConnectionId) -> Option<(Recorder, EventSink)> {
        self.legs
            .lock()
            .unwrap()
            .iter()
            .find(|(leg_id, _, _)| *leg_id == id)
            .map(|(_, recorder, sink)| (recorder.clone(), sink.clone()))
    }
}

impl Connector for RecordingConnector {
    type Handle = Recorder;

    fn outbound(&self, id: ConnectionId, events: EventSink) -> Recorder {
        let recorder = Recorder::default();
        self.legs.lock().unwrap().push((id, recorder.clone(), events));
        recorder
    }
}
