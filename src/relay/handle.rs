//! The contract between the relay core and the WebSocket transport.
//!
//! Every method here is a non-blocking request: implementations queue the
//! work for a writer task and return immediately.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use crate::net::connection::ConnectionId;
use crate::relay::event::{CloseInfo, Frame, LegEvent};

/// Where a transport delivers the events of one leg.
pub type EventSink = mpsc::UnboundedSender<LegEvent>;

/// Work queued for the task that owns a socket's write half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegCommand {
    Send(Frame),
    Close { code: u16, reason: String },
}

/// Create the write queue of one leg.
///
/// Frames are bounded by `frame_limit`; closes use their own lane and are
/// never refused.
pub fn leg_channel(frame_limit: usize) -> (LegSender, LegReceiver) {
    let (frames_tx, frames_rx) = mpsc::channel(frame_limit.max(1));
    let (closes_tx, closes_rx) = mpsc::unbounded_channel();
    let close_requested = Arc::new(Notify::new());

    (
        LegSender {
            frames: frames_tx,
            closes: closes_tx,
            close_requested: Arc::clone(&close_requested),
        },
        LegReceiver {
            frames: frames_rx,
            closes: closes_rx,
            frames_open: true,
            closes_open: true,
        },
    )
}

/// Producer side of a leg's write queue, held by the leg's handle.
///
/// Dropping it counts as a close request.
#[derive(Debug)]
pub struct LegSender {
    frames: mpsc::Sender<Frame>,
    closes: mpsc::UnboundedSender<CloseInfo>,
    close_requested: Arc<Notify>,
}

impl LegSender {
    /// Queue a frame without waiting. A full queue hands the frame back.
    pub fn send(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.frames.try_send(frame)
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.closes.send(CloseInfo::new(code, reason));
        self.close_requested.notify_one();
    }

    /// Fires once a close was requested or the sender dropped.
    pub fn close_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.close_requested)
    }
}

impl Drop for LegSender {
    fn drop(&mut self) {
        self.close_requested.notify_one();
    }
}

/// Consumer side of a leg's write queue, owned by the socket's writer.
#[derive(Debug)]
pub struct LegReceiver {
    frames: mpsc::Receiver<Frame>,
    closes: mpsc::UnboundedReceiver<CloseInfo>,
    frames_open: bool,
    closes_open: bool,
}

impl LegReceiver {
    /// Next queued command, or `None` once the sender is gone.
    ///
    /// Frames queued before a close are delivered before it. Cancel safe.
    pub async fn recv(&mut self) -> Option<LegCommand> {
        while self.frames_open || self.closes_open {
            tokio::select! {
                biased;
                frame = self.frames.recv(), if self.frames_open => match frame {
                    Some(frame) => return Some(LegCommand::Send(frame)),
                    None => self.frames_open = false,
                },
                close = self.closes.recv(), if self.closes_open => match close {
                    Some(close) => {
                        return Some(LegCommand::Close {
                            code: close.code,
                            reason: close.reason,
                        })
                    }
                    None => self.closes_open = false,
                },
            }
        }
        None
    }
}

/// The inbound (client) side of a pairing.
///
/// Owned by the transport's listener. The pairing only sends and closes.
pub trait ClientHandle: Send + Sync + 'static {
    fn send(&self, frame: Frame);
    fn close(&self, code: u16, reason: &str);
}

/// The outbound (upstream) side of a pairing, exclusively owned by it.
pub trait OutboundHandle: Send + 'static {
    /// Target URL, exactly as resolved from the client's request URI.
    fn set_url(&mut self, url: String);

    /// Begin connecting to the URL given to [`set_url`](Self::set_url).
    fn start(&mut self);

    fn send(&mut self, frame: Frame);

    /// Close the connection. A no-op on a handle that was never started.
    fn close(&mut self, code: u16, reason: &str);
}

/// Builds outbound handles whose events flow into the given sink.
pub trait Connector: Send + Sync + 'static {
    type Handle: OutboundHandle;

    fn outbound(&self, id: ConnectionId, events: EventSink) -> Self::Handle;
}
