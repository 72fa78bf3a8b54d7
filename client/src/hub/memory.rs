//! In-process hub.
//!
//! Every session registered here gets the positions published by the other sessions of the
//! same hub, in publication order.  It also lets a test (or an embedder) inject faults:
//!
//! - refuse the next N connections,
//! - reject every send,
//! - drop every live session as if the network went away.
//!
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, trace};

use super::{HubConnector, HubEvent, HubSender, HubSession, LatLon};
use crate::{ConnectError, SendError};

#[derive(Debug)]
struct Peer {
    identity: String,
    tx: UnboundedSender<HubEvent>,
}

#[derive(Debug, Default)]
struct HubState {
    next_id: u64,
    peers: BTreeMap<u64, Peer>,
    refuse: u32,
    reject_sends: bool,
    connects: u32,
    closes: u32,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    #[tracing::instrument]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock leaves counters only, keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse the next `n` connection attempts with a network error.
    ///
    pub fn refuse_next(&self, n: u32) {
        self.lock().refuse = n;
    }

    /// Have every send rejected by the hub.
    ///
    pub fn reject_sends(&self, reject: bool) {
        self.lock().reject_sends = reject;
    }

    /// Drop every live session, each one gets a `Closed` event.
    ///
    #[tracing::instrument(skip(self))]
    pub fn drop_all(&self) {
        let mut st = self.lock();
        let peers = std::mem::take(&mut st.peers);
        debug!("dropping {} session(s)", peers.len());
        for (_, peer) in peers {
            let _ = peer.tx.send(HubEvent::Closed(Some("transport lost".into())));
        }
    }

    /// Number of live sessions.
    ///
    pub fn sessions(&self) -> usize {
        self.lock().peers.len()
    }

    /// Identities of the live sessions, in connection order.
    ///
    pub fn identities(&self) -> Vec<String> {
        self.lock()
            .peers
            .values()
            .map(|p| p.identity.clone())
            .collect()
    }

    /// Successful connections so far.
    ///
    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    /// Sessions released by their owner (closed or dropped) so far.
    ///
    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    fn release(&self, id: u64) {
        let mut st = self.lock();
        if st.peers.remove(&id).is_some() {
            trace!("memory session {id} released");
            st.closes += 1;
        }
    }
}

#[async_trait]
impl HubConnector for MemoryHub {
    #[tracing::instrument(skip(self))]
    async fn connect(&self, identity: &str) -> Result<HubSession, ConnectError> {
        let mut st = self.lock();
        if st.refuse > 0 {
            st.refuse -= 1;
            trace!("refusing connection for {identity}");
            return Err(ConnectError::Network("connection refused".into()));
        }

        let (tx, rx) = unbounded_channel();
        st.next_id += 1;
        let id = st.next_id;
        st.peers.insert(
            id,
            Peer {
                identity: identity.to_owned(),
                tx,
            },
        );
        st.connects += 1;
        trace!("memory session {id} for {identity}");

        let sender = MemorySender {
            hub: self.clone(),
            id,
        };
        Ok(HubSession {
            sender: Arc::new(sender),
            events: rx,
        })
    }
}

struct MemorySender {
    hub: MemoryHub,
    id: u64,
}

#[async_trait]
impl HubSender for MemorySender {
    async fn send_lat_lon(&self, msg: &LatLon) -> Result<(), SendError> {
        let st = self.hub.lock();
        if !st.peers.contains_key(&self.id) {
            return Err(SendError::NotConnected);
        }
        if st.reject_sends {
            return Err(SendError::TransportRejected("rejected by hub".into()));
        }

        st.peers
            .iter()
            .filter(|(id, _)| **id != self.id)
            .for_each(|(_, peer)| {
                let _ = peer.tx.send(HubEvent::LatLon(msg.clone()));
            });
        Ok(())
    }

    async fn close(&self) {
        self.hub.release(self.id);
    }
}

impl Drop for MemorySender {
    fn drop(&mut self) {
        self.hub.release(self.id);
    }
}
