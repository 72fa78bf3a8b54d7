//! Hub transport seam.
//!
//! A hub relays `SendLatLon` calls from one party as `ReceiveLatLon` events to the other
//! connected parties.  The connection state machine only needs two things from a transport:
//!
//! - `HubConnector` to open one transport for a given identity,
//! - `HubSession` to send through it and to read what comes back, in wire order.
//!
//! Two implementations are provided:
//! - `SignalRConnector`, the JSON hub protocol over a WebSocket,
//! - `MemoryHub`, an in-process hub.
//!
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{ConnectError, SendError};

mod memory;
mod signalr;

pub use memory::*;
pub use signalr::*;

/// Method invoked on the hub to publish a position
pub const SEND_TARGET: &str = "SendLatLon";
/// Event the hub invokes on the other parties
pub const RECEIVE_TARGET: &str = "ReceiveLatLon";

/// One position as exchanged with the hub.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub user_name: String,
}

/// Inbound events from one transport.
///
#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    /// Someone else published a position
    LatLon(LatLon),
    /// The transport is gone, with an optional reason
    Closed(Option<String>),
}

/// One established transport.
///
pub struct HubSession {
    /// Outbound half
    pub sender: Arc<dyn HubSender>,
    /// Inbound events, in arrival order
    pub events: UnboundedReceiver<HubEvent>,
}

impl Debug for HubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSession").finish_non_exhaustive()
    }
}

/// Opens transports to the hub.
///
#[async_trait]
pub trait HubConnector: Debug + Send + Sync {
    /// Establish a new transport for `identity`.
    async fn connect(&self, identity: &str) -> Result<HubSession, ConnectError>;
}

/// Outbound half of a transport.
///
#[async_trait]
pub trait HubSender: Send + Sync {
    /// Publish a position and wait for the hub to acknowledge it.
    async fn send_lat_lon(&self, msg: &LatLon) -> Result<(), SendError>;
    /// Release the transport.  Calling it more than once is harmless.
    async fn close(&self);
}
