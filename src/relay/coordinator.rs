//! Binds accepted client connections to fresh pairings.
//!
//! # Responsibilities
//! - Enforce the concurrent pairing limit
//! - Build one pairing and one outbound handle per client
//! - Route upstream events into the pairing from a dedicated task
//! - Keep a registry of live pairings for shutdown
//!
//! Once a pairing is returned, every further action is driven by events on
//! its two legs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};

use crate::config::RelayConfig;
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::relay::event::{LegEvent, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR};
use crate::relay::handle::{ClientHandle, Connector, OutboundHandle};
use crate::relay::pairing::ConnectionPairing;
use crate::relay::target::UpstreamTarget;
use crate::relay::RelayError;

/// The pairing type a coordinator produces.
pub type PairingOf<C, K> = ConnectionPairing<C, <K as Connector>::Handle>;

pub struct RelayCoordinator<C, K: Connector> {
    connector: K,
    target: ArcSwap<UpstreamTarget>,
    capacity: Arc<Semaphore>,
    max_connections: usize,
    pending_frame_limit: usize,
    live: DashMap<ConnectionId, Arc<PairingOf<C, K>>>,
    /// Set once by `shutdown_all`; no pairing is created afterwards.
    closing: AtomicBool,
}

impl<C: ClientHandle, K: Connector> RelayCoordinator<C, K> {
    pub fn new(
        connector: K,
        target: UpstreamTarget,
        max_connections: usize,
        relay: &RelayConfig,
    ) -> Self {
        Self {
            connector,
            target: ArcSwap::from_pointee(target),
            capacity: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            pending_frame_limit: relay.pending_frame_limit,
            live: DashMap::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Pair a newly accepted client with its own upstream handle.
    ///
    /// Must be called once per accepted connection. Does not block. On
    /// failure the client is closed (1011 at capacity, 1001 during shutdown)
    /// and nothing is retained.
    pub fn on_new_connection(
        &self,
        id: ConnectionId,
        client: C,
    ) -> Result<Arc<PairingOf<C, K>>, RelayError> {
        if self.closing.load(Ordering::SeqCst) {
            tracing::debug!(connection_id = %id, "Shutting down, refusing client");
            client.close(CLOSE_GOING_AWAY, "proxy shutting down");
            return Err(RelayError::ShuttingDown);
        }

        let permit = match self.capacity.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::record_pairing_rejected();
                tracing::warn!(
                    connection_id = %id,
                    max_connections = self.max_connections,
                    "Connection limit reached, rejecting client"
                );
                client.close(CLOSE_INTERNAL_ERROR, "proxy at capacity");
                return Err(RelayError::AtCapacity {
                    limit: self.max_connections,
                });
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let outbound = self.connector.outbound(id, events_tx);
        let target = UpstreamTarget::clone(&self.target.load());

        let pairing = Arc::new(
            ConnectionPairing::new(id, target, client, outbound, self.pending_frame_limit)
                .with_permit(permit),
        );

        tokio::spawn(dispatch_upstream_events(Arc::downgrade(&pairing), events_rx));
        self.live.insert(id, Arc::clone(&pairing));

        // Raced with shutdown_all: it may have iterated before this insert.
        if self.closing.load(Ordering::SeqCst) {
            pairing.shutdown(CLOSE_GOING_AWAY, "proxy shutting down");
        }

        tracing::debug!(
            connection_id = %id,
            live = self.live.len(),
            "Pairing registered"
        );
        Ok(pairing)
    }

    /// Forget a pairing once its client leg has finished.
    pub fn release(&self, id: ConnectionId) -> Option<Arc<PairingOf<C, K>>> {
        self.live.remove(&id).map(|(_, pairing)| pairing)
    }

    /// Point pairings created from now on at a different upstream.
    pub fn retarget(&self, target: UpstreamTarget) {
        tracing::info!(target = %target, "Upstream target updated");
        self.target.store(Arc::new(target));
    }

    pub fn current_target(&self) -> Arc<UpstreamTarget> {
        self.target.load_full()
    }

    pub fn live_pairings(&self) -> usize {
        self.live.len()
    }

    /// Close both legs of every live pairing and refuse new ones. Returns
    /// how many were closed.
    pub fn shutdown_all(&self, code: u16, reason: &str) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let mut closed = 0;
        for entry in self.live.iter() {
            entry.value().shutdown(code, reason);
            closed += 1;
        }
        tracing::info!(pairings = closed, "Closed live pairings");
        closed
    }
}

/// Deliver upstream events in order until the leg or the pairing goes away.
async fn dispatch_upstream_events<C, O>(
    pairing: Weak<ConnectionPairing<C, O>>,
    mut events: mpsc::UnboundedReceiver<LegEvent>,
) where
    C: ClientHandle,
    O: OutboundHandle,
{
    while let Some(event) = events.recv().await {
        let Some(pairing) = pairing.upgrade() else {
            break;
        };
        pairing.on_server_event(event);
    }
}
