//! Contains the data connection engine and the session plumbing around it.

pub(crate) mod datachan;
pub(crate) mod error;
mod failed_logins;
pub(crate) mod gate;
pub(crate) mod ipfilter;
pub(crate) mod listener;
pub(crate) mod reply;
pub(crate) mod session;
mod shutdown;
pub(crate) mod statistics;
pub(crate) mod tls;

pub use datachan::address::{decode_extended_host_port, decode_host_port, encode_extended_port, encode_host_port};
pub use datachan::error::{DataChanError, DataChanErrorKind};
pub use datachan::negotiator::{DataConnectionDescriptor, DataConnectionNegotiator, NegotiatorState, PassiveAddress};
pub use datachan::opener::DataConnectionOpener;
pub use datachan::policy::{DataConnectionConfig, DataConnectionPolicy, DataConnectionPolicyBuilder};
pub use datachan::ports::{PassivePortPool, PortReservation, PortSet};
pub use datachan::stream::{DataConnection, DataStream};
pub use datachan::transfer::{DataTransferEngine, TransferError};
pub use error::ConfigError;
pub use gate::{ConnectionConfig, ConnectionGuard, Decision, FailedLoginOutcome, LoginGuard, SessionAuthorizationGate};
pub use ipfilter::{IpFilterType, RemoteIpFilter, Subnet};
pub use listener::{Listener, ListenerBuilder};
pub use reply::{Reply, ReplyCode};
pub use session::{ActivityTracker, ControlConnection, Session};
pub use statistics::FtpStatistics;
pub use tls::TlsCapability;
