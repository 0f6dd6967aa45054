//!
//! Lets users observe what happens on data connections and sessions.
//!
//! To hear about finished or failed transfers implement the [`TransferListener`] trait and pass
//! it to [`ListenerBuilder::notify_transfers`](crate::ListenerBuilder::notify_transfers).
//!
//! To hear about logins and logouts implement the [`PresenceListener`] trait and pass it to
//! [`ListenerBuilder::notify_presence`](crate::ListenerBuilder::notify_presence).
//!

pub(crate) mod event;
pub(crate) mod nop;

pub use event::{EventMeta, PresenceEvent, PresenceListener, TransferEvent, TransferListener};
pub use nop::NopListener;
