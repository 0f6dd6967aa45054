use crate::server::datachan::error::DataChanErrorKind;

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

/// A login or logout of a session. To identify the session see [`EventMeta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The user logged in successfully
    LoggedIn,
    /// The user logged out, or the session ended while logged in
    LoggedOut,
}

/// The end of a data transfer. To identify the session see [`EventMeta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Data was sent to the client, as for RETR or a listing.
    Sent {
        /// The client side of the data connection
        peer: SocketAddr,
        /// The amount of bytes sent
        bytes: u64,
    },
    /// Data was received from the client, as for STOR.
    Received {
        /// The client side of the data connection
        peer: SocketAddr,
        /// The amount of bytes received
        bytes: u64,
    },
    /// A transfer or the opening of its data connection failed.
    Failed {
        /// What went wrong
        kind: DataChanErrorKind,
        /// The bytes transferred before the failure
        bytes: u64,
    },
}

/// Metadata identifying the user and session an event belongs to. A sequence number is included
/// to allow ordering in systems where event ordering is not guaranteed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    /// The user this event pertains to, empty before login.
    pub username: String,
    /// Identifies a single session of a connected client.
    pub trace_id: String,
    /// The event sequence number as incremented per session.
    pub sequence_number: u64,
}

/// A listener for [`TransferEvent`]s.
#[async_trait]
pub trait TransferListener: Sync + Send + Debug {
    /// Called after the transfer ended.
    async fn receive_transfer_event(&self, e: TransferEvent, m: EventMeta);
}

/// A listener for [`PresenceEvent`]s.
#[async_trait]
pub trait PresenceListener: Sync + Send + Debug {
    /// Called after the login or logout happened.
    async fn receive_presence_event(&self, e: PresenceEvent, m: EventMeta);
}

#[async_trait]
impl TransferListener for Arc<dyn TransferListener> {
    async fn receive_transfer_event(&self, e: TransferEvent, m: EventMeta) {
        self.as_ref().receive_transfer_event(e, m).await
    }
}

#[async_trait]
impl PresenceListener for Arc<dyn PresenceListener> {
    async fn receive_presence_event(&self, e: PresenceEvent, m: EventMeta) {
        self.as_ref().receive_presence_event(e, m).await
    }
}
