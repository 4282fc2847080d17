//! Per-connection relay state machine.
//!
//! # Responsibilities
//! - Start the upstream leg once the client leg has opened
//! - Forward frames unmodified in both directions, in delivery order
//! - Propagate closes both ways and upstream faults to the client
//! - Drop anything that arrives after the pairing turned terminal
//!
//! # State Machine
//! ```text
//!  Idle ──client open──▶ Active ──either leg closes──▶ Terminating ──both closed──▶ Closed
//!                          │
//!                          └── client frames queue until the upstream opens
//! ```
//!
//! # Design Decisions
//! - One mutex guards every mutable field; the client and upstream legs are
//!   driven from different tasks and may race
//! - Handle calls are non-blocking, so they are made while the lock is held,
//!   which keeps the pre-open queue flush ordered with new client frames
//! - A client-leg fault is only logged; an upstream-leg fault closes the client

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::OwnedSemaphorePermit;

use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::relay::event::{CloseInfo, FaultInfo, Frame, LegEvent, OpenInfo, CLOSE_INTERNAL_ERROR};
use crate::relay::handle::{ClientHandle, OutboundHandle};
use crate::relay::target::UpstreamTarget;

const CLIENT_TO_UPSTREAM: &str = "client_to_upstream";
const UPSTREAM_TO_CLIENT: &str = "upstream_to_client";

/// Externally visible lifecycle of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    /// Waiting for the client leg to open.
    Idle,
    /// Upstream connect initiated; frames flow.
    Active,
    /// One leg closed or asked to close; nothing is forwarded any more.
    Terminating,
    /// Both legs closed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamLeg {
    NotStarted,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientLeg {
    Open,
    Closing,
    Closed,
}

struct PairingState<O> {
    outbound: O,
    remote_url: Option<String>,
    upstream: UpstreamLeg,
    client: ClientLeg,
    /// Client frames received while the upstream was still connecting.
    pending: VecDeque<Frame>,
}

impl<O> PairingState<O> {
    fn phase(&self) -> PairingPhase {
        match (self.client, self.upstream) {
            (ClientLeg::Closed, UpstreamLeg::NotStarted | UpstreamLeg::Closed) => PairingPhase::Closed,
            (ClientLeg::Open, UpstreamLeg::NotStarted) => PairingPhase::Idle,
            (ClientLeg::Open, UpstreamLeg::Connecting | UpstreamLeg::Open) => PairingPhase::Active,
            _ => PairingPhase::Terminating,
        }
    }
}

/// One client connection bound to its own upstream connection.
pub struct ConnectionPairing<C, O> {
    id: ConnectionId,
    target: UpstreamTarget,
    client: C,
    pending_frame_limit: usize,
    state: Mutex<PairingState<O>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<C: ClientHandle, O: OutboundHandle> ConnectionPairing<C, O> {
    pub fn new(
        id: ConnectionId,
        target: UpstreamTarget,
        client: C,
        outbound: O,
        pending_frame_limit: usize,
    ) -> Self {
        metrics::record_pairing_opened();
        Self {
            id,
            target,
            client,
            pending_frame_limit,
            state: Mutex::new(PairingState {
                outbound,
                remote_url: None,
                upstream: UpstreamLeg::NotStarted,
                client: ClientLeg::Open,
                pending: VecDeque::new(),
            }),
            _permit: None,
        }
    }

    /// Hold a connection-limit slot for as long as the pairing lives.
    pub(crate) fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn phase(&self) -> PairingPhase {
        self.lock().phase()
    }

    /// Dispatch an event observed on the client leg.
    pub fn on_client_event(&self, event: LegEvent) {
        match event {
            LegEvent::Opened(open) => self.on_client_opened(open),
            LegEvent::Data(frame) => self.on_client_data(frame),
            LegEvent::Closed(close) => self.on_client_closed(close),
            LegEvent::Faulted(fault) => self.on_client_faulted(fault),
        }
    }

    /// Dispatch an event observed on the upstream leg.
    pub fn on_server_event(&self, event: LegEvent) {
        match event {
            LegEvent::Opened(open) => self.on_server_opened(open),
            LegEvent::Data(frame) => self.on_server_data(frame),
            LegEvent::Closed(close) => self.on_server_closed(close),
            LegEvent::Faulted(fault) => self.on_server_faulted(fault),
        }
    }

    pub fn on_client_opened(&self, open: OpenInfo) {
        let mut state = self.lock();

        if state.upstream != UpstreamLeg::NotStarted || state.client != ClientLeg::Open {
            tracing::warn!(
                connection_id = %self.id,
                uri = %open.uri,
                phase = ?state.phase(),
                "Ignoring client open on a pairing that is no longer idle"
            );
            return;
        }

        tracing::info!(
            connection_id = %self.id,
            uri = %open.uri,
            headers = ?open.headers,
            "New client connection"
        );

        let url = match self.target.resolve(&open.uri) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(connection_id = %self.id, error = %e, "Cannot build upstream URL");
                self.client.close(CLOSE_INTERNAL_ERROR, "invalid upstream url");
                state.client = ClientLeg::Closing;
                return;
            }
        };

        tracing::debug!(connection_id = %self.id, url = %url, "Connecting upstream");
        state.outbound.set_url(url.clone());
        state.outbound.start();
        state.remote_url = Some(url);
        state.upstream = UpstreamLeg::Connecting;
    }

    pub fn on_client_data(&self, frame: Frame) {
        let mut state = self.lock();
        let size = frame.size_in_bytes();

        tracing::trace!(connection_id = %self.id, bytes = size, "Received bytes from client");

        if state.client != ClientLeg::Open {
            self.drop_frame(CLIENT_TO_UPSTREAM, "terminated", size);
            return;
        }

        match state.upstream {
            UpstreamLeg::Open => {
                metrics::record_frame(CLIENT_TO_UPSTREAM, size);
                state.outbound.send(frame);
            }
            UpstreamLeg::Connecting => {
                if state.pending.len() >= self.pending_frame_limit {
                    tracing::warn!(
                        connection_id = %self.id,
                        limit = self.pending_frame_limit,
                        "Upstream not open yet and pending queue full, dropping client frame"
                    );
                    self.drop_frame(CLIENT_TO_UPSTREAM, "pending_full", size);
                } else {
                    state.pending.push_back(frame);
                }
            }
            UpstreamLeg::NotStarted => self.drop_frame(CLIENT_TO_UPSTREAM, "not_started", size),
            UpstreamLeg::Closing | UpstreamLeg::Closed => {
                self.drop_frame(CLIENT_TO_UPSTREAM, "terminated", size)
            }
        }
    }

    pub fn on_client_closed(&self, close: CloseInfo) {
        let mut state = self.lock();

        tracing::info!(
            connection_id = %self.id,
            code = close.code,
            reason = %close.reason,
            "Client connection closed"
        );

        state.client = ClientLeg::Closed;
        state.pending.clear();

        match state.upstream {
            UpstreamLeg::Connecting | UpstreamLeg::Open => {
                state.outbound.close(close.code, &close.reason);
                state.upstream = UpstreamLeg::Closing;
            }
            UpstreamLeg::NotStarted | UpstreamLeg::Closing | UpstreamLeg::Closed => {}
        }
    }

    pub fn on_client_faulted(&self, fault: FaultInfo) {
        metrics::record_fault("client");
        tracing::warn!(
            connection_id = %self.id,
            reason = %fault.reason,
            retries = fault.retry_count,
            wait_ms = fault.wait_millis,
            http_status = ?fault.http_status,
            "Client connection error"
        );
    }

    pub fn on_server_opened(&self, open: OpenInfo) {
        let mut state = self.lock();

        tracing::info!(
            connection_id = %self.id,
            url = state.remote_url.as_deref().unwrap_or_default(),
            uri = %open.uri,
            headers = ?open.headers,
            "Upstream connection open"
        );

        if state.upstream != UpstreamLeg::Connecting {
            tracing::debug!(connection_id = %self.id, "Upstream opened after pairing stopped relaying");
            return;
        }
        state.upstream = UpstreamLeg::Open;

        let queued = state.pending.len();
        while let Some(frame) = state.pending.pop_front() {
            metrics::record_frame(CLIENT_TO_UPSTREAM, frame.size_in_bytes());
            state.outbound.send(frame);
        }
        if queued > 0 {
            tracing::debug!(connection_id = %self.id, frames = queued, "Flushed queued client frames");
        }
    }

    pub fn on_server_data(&self, frame: Frame) {
        let state = self.lock();
        let size = frame.size_in_bytes();

        tracing::trace!(connection_id = %self.id, bytes = size, "Received bytes from server");

        if state.upstream == UpstreamLeg::Open && state.client == ClientLeg::Open {
            metrics::record_frame(UPSTREAM_TO_CLIENT, size);
            self.client.send(frame);
        } else {
            self.drop_frame(UPSTREAM_TO_CLIENT, "terminated", size);
        }
    }

    pub fn on_server_closed(&self, close: CloseInfo) {
        let mut state = self.lock();

        tracing::info!(
            connection_id = %self.id,
            code = close.code,
            reason = %close.reason,
            "Upstream connection closed"
        );

        state.upstream = UpstreamLeg::Closed;
        state.pending.clear();

        if state.client == ClientLeg::Open {
            self.client.close(close.code, &close.reason);
            state.client = ClientLeg::Closing;
        }
    }

    pub fn on_server_faulted(&self, fault: FaultInfo) {
        let mut state = self.lock();

        metrics::record_fault("upstream");
        tracing::warn!(
            connection_id = %self.id,
            reason = %fault.reason,
            retries = fault.retry_count,
            wait_ms = fault.wait_millis,
            http_status = ?fault.http_status,
            "Upstream connection error"
        );

        state.upstream = UpstreamLeg::Closed;
        state.pending.clear();

        if state.client == ClientLeg::Open {
            let close = fault
                .close
                .unwrap_or_else(|| CloseInfo::new(CLOSE_INTERNAL_ERROR, "upstream connection failed"));
            self.client.close(close.code, &close.reason);
            state.client = ClientLeg::Closing;
        }
    }

    /// Close whichever legs are still open. Used when the proxy stops.
    pub fn shutdown(&self, code: u16, reason: &str) {
        let mut state = self.lock();

        state.pending.clear();
        if state.client == ClientLeg::Open {
            self.client.close(code, reason);
            state.client = ClientLeg::Closing;
        }
        if matches!(state.upstream, UpstreamLeg::Connecting | UpstreamLeg::Open) {
            state.outbound.close(code, reason);
            state.upstream = UpstreamLeg::Closing;
        }
    }

    fn drop_frame(&self, direction: &'static str, reason: &'static str, size: usize) {
        metrics::record_dropped(direction, reason);
        tracing::debug!(
            connection_id = %self.id,
            direction,
            reason,
            bytes = size,
            "Dropping frame"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PairingState<O>> {
        self.state.lock().expect("pairing mutex poisoned")
    }
}

impl<C, O> Drop for ConnectionPairing<C, O> {
    fn drop(&mut self) {
        metrics::record_pairing_closed();
        tracing::trace!(connection_id = %self.id, "Pairing released");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::relay::testing::{Call, Recorder};

    fn pairing(limit: usize) -> (ConnectionPairing<Recorder, Recorder>, Recorder, Recorder) {
        let client = Recorder::default();
        let outbound = Recorder::default();
        let target = UpstreamTarget::new("ws://upstream:9000", None).unwrap();
        let pairing = ConnectionPairing::new(
            ConnectionId::new(),
            target,
            client.clone(),
            outbound.clone(),
            limit,
        );
        (pairing, client, outbound)
    }

    fn open(uri: &str) -> LegEvent {
        LegEvent::Opened(OpenInfo {
            uri: uri.to_string(),
            headers: vec![("host".into(), "proxy".into())],
        })
    }

    fn active_pairing() -> (ConnectionPairing<Recorder, Recorder>, Recorder, Recorder) {
        let (pairing, client, outbound) = pairing(8);
        pairing.on_client_event(open("/chat"));
        pairing.on_server_event(open("/chat"));
        outbound.clear();
        (pairing, client, outbound)
    }

    #[test]
    fn client_open_starts_upstream_with_joined_url() {
        let (pairing, client, outbound) = pairing(8);
        assert_eq!(pairing.phase(), PairingPhase::Idle);

        pairing.on_client_event(open("/chat"));

        assert_eq!(
            outbound.calls(),
            vec![Call::SetUrl("ws://upstream:9000/chat".into()), Call::Start]
        );
        assert_eq!(pairing.phase(), PairingPhase::Active);
        assert!(client.calls().is_empty());
    }

    #[test]
    fn repeated_open_is_ignored() {
        let (pairing, _client, outbound) = pairing(8);
        pairing.on_client_event(open("/a"));
        pairing.on_client_event(open("/b"));

        assert_eq!(outbound.calls(), vec![Call::SetUrl("ws://upstream:9000/a".into()), Call::Start]);
    }

    #[test]
    fn racing_opens_start_upstream_once() {
        let (pairing, _client, outbound) = pairing(8);
        let pairing = Arc::new(pairing);

        std::thread::scope(|s| {
            for _ in 0..8 {
                let pairing = Arc::clone(&pairing);
                s.spawn(move || pairing.on_client_event(open("/race")));
            }
        });

        let calls = outbound.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::Start).count(), 1);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SetUrl(_))).count(), 1);
    }

    #[test]
    fn client_frames_forwarded_in_order_with_flags() {
        let (pairing, _client, outbound) = active_pairing();
        let frames = vec![
            Frame::text("one"),
            Frame::binary(vec![0u8, 159, 146, 150]),
            Frame::text(""),
            Frame::binary(Vec::new()),
            Frame::text("four ✓"),
        ];

        for frame in &frames {
            pairing.on_client_event(LegEvent::Data(frame.clone()));
        }

        let sent: Vec<_> = frames.into_iter().map(Call::Send).collect();
        assert_eq!(outbound.calls(), sent);
    }

    #[test]
    fn upstream_frames_reach_client_unchanged() {
        let (pairing, client, outbound) = active_pairing();
        let payload = Frame::binary(vec![0xde, 0xad, 0xbe, 0xef]);

        pairing.on_server_event(LegEvent::Data(payload.clone()));
        pairing.on_server_event(LegEvent::Data(Frame::text("pong")));

        assert_eq!(client.calls(), vec![Call::Send(payload), Call::Send(Frame::text("pong"))]);
        assert!(outbound.calls().is_empty());
    }

    #[test]
    fn frames_before_upstream_open_are_queued_then_flushed() {
        let (pairing, _client, outbound) = pairing(8);
        pairing.on_client_event(open("/q"));
        outbound.clear();

        pairing.on_client_event(LegEvent::Data(Frame::text("early-1")));
        pairing.on_client_event(LegEvent::Data(Frame::text("early-2")));
        assert!(outbound.calls().is_empty());

        pairing.on_server_event(open("/q"));
        pairing.on_client_event(LegEvent::Data(Frame::text("late")));

        assert_eq!(
            outbound.calls(),
            vec![
                Call::Send(Frame::text("early-1")),
                Call::Send(Frame::text("early-2")),
                Call::Send(Frame::text("late")),
            ]
        );
    }

    #[test]
    fn pending_queue_is_bounded() {
        let (pairing, _client, outbound) = pairing(2);
        pairing.on_client_event(open("/q"));
        outbound.clear();

        for i in 0..5 {
            pairing.on_client_event(LegEvent::Data(Frame::text(format!("f{}", i))));
        }
        pairing.on_server_event(open("/q"));

        assert_eq!(
            outbound.calls(),
            vec![Call::Send(Frame::text("f0")), Call::Send(Frame::text("f1"))]
        );
    }

    #[test]
    fn data_before_client_open_is_dropped() {
        let (pairing, client, outbound) = pairing(8);
        pairing.on_client_event(LegEvent::Data(Frame::text("too soon")));
        pairing.on_server_event(LegEvent::Data(Frame::text("stray")));

        assert!(outbound.calls().is_empty());
        assert!(client.calls().is_empty());
        assert_eq!(pairing.phase(), PairingPhase::Idle);
    }

    #[test]
    fn client_close_propagates_once_and_stops_forwarding() {
        let (pairing, client, outbound) = active_pairing();

        pairing.on_client_event(LegEvent::Closed(CloseInfo::new(4001, "bye")));
        pairing.on_client_event(LegEvent::Data(Frame::text("after close")));
        pairing.on_client_event(LegEvent::Closed(CloseInfo::new(4001, "bye")));
        pairing.on_server_event(LegEvent::Data(Frame::text("late reply")));

        assert_eq!(outbound.calls(), vec![Call::Close(4001, "bye".into())]);
        assert!(client.calls().is_empty());
        assert_eq!(pairing.phase(), PairingPhase::Terminating);

        pairing.on_server_event(LegEvent::Closed(CloseInfo::new(4001, "bye")));
        assert!(client.calls().is_empty());
        assert_eq!(pairing.phase(), PairingPhase::Closed);
    }

    #[test]
    fn server_close_propagates_to_client() {
        let (pairing, client, outbound) = active_pairing();

        pairing.on_server_event(LegEvent::Closed(CloseInfo::new(1000, "done")));
        pairing.on_client_event(LegEvent::Data(Frame::text("ignored")));

        assert_eq!(client.calls(), vec![Call::Close(1000, "done".into())]);
        assert!(outbound.calls().is_empty());
        assert_eq!(pairing.phase(), PairingPhase::Terminating);

        pairing.on_client_event(LegEvent::Closed(CloseInfo::new(1000, "done")));
        assert!(outbound.calls().is_empty());
        assert_eq!(pairing.phase(), PairingPhase::Closed);
    }

    #[test]
    fn client_close_while_connecting_discards_queue() {
        let (pairing, _client, outbound) = pairing(8);
        pairing.on_client_event(open("/q"));
        pairing.on_client_event(LegEvent::Data(Frame::text("queued")));
        outbound.clear();

        pairing.on_client_event(LegEvent::Closed(CloseInfo::new(1000, "")));
        pairing.on_server_event(open("/q"));

        assert_eq!(outbound.calls(), vec![Call::Close(1000, String::new())]);
    }

    #[test]
    fn upstream_fault_closes_client_with_internal_error() {
        let (pairing, client, outbound) = active_pairing();

        pairing.on_server_event(LegEvent::Faulted(FaultInfo {
            reason: "connection reset".into(),
            http_status: None,
            ..FaultInfo::default()
        }));
        pairing.on_server_event(LegEvent::Data(Frame::text("dead")));

        assert_eq!(
            client.calls(),
            vec![Call::Close(CLOSE_INTERNAL_ERROR, "upstream connection failed".into())]
        );
        assert!(outbound.calls().is_empty());
    }

    #[test]
    fn upstream_fault_uses_surfaced_close_code() {
        let (pairing, client, _outbound) = active_pairing();

        pairing.on_server_event(LegEvent::Faulted(FaultInfo {
            reason: "policy".into(),
            close: Some(CloseInfo::new(1008, "policy violation")),
            ..FaultInfo::default()
        }));

        assert_eq!(client.calls(), vec![Call::Close(1008, "policy violation".into())]);
    }

    #[test]
    fn client_fault_touches_nothing_upstream() {
        let (pairing, client, outbound) = active_pairing();

        pairing.on_client_event(LegEvent::Faulted(FaultInfo {
            reason: "read error".into(),
            retry_count: 2,
            wait_millis: 150,
            http_status: Some(500),
            close: None,
        }));

        assert!(outbound.calls().is_empty());
        assert!(client.calls().is_empty());
        assert_eq!(pairing.phase(), PairingPhase::Active);
    }

    #[test]
    fn shutdown_closes_both_open_legs() {
        let (pairing, client, outbound) = active_pairing();

        pairing.shutdown(1001, "proxy shutting down");
        pairing.shutdown(1001, "proxy shutting down");

        assert_eq!(client.calls(), vec![Call::Close(1001, "proxy shutting down".into())]);
        assert_eq!(outbound.calls(), vec![Call::Close(1001, "proxy shutting down".into())]);
        assert_eq!(pairing.phase(), PairingPhase::Terminating);
    }
}
