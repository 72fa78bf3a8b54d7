//! Connection lifecycle states.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --drop--> Reconnecting
//!                           Connecting --ko--> Failed
//! Reconnecting --ok--> Connected       Reconnecting --exhausted--> Failed
//! Connected | Reconnecting | Failed --stop--> Disconnected
//! ```
//!
//! `Failed` can also be left through a new `connect()`.
//!
use serde::Serialize;
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Is `next` a legal move from `self`?
    ///
    pub fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Connected, Disconnected)
                | (Reconnecting, Disconnected)
                | (Failed, Disconnected)
        )
    }

    #[inline]
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}
