use ftp_datalink_core::BoxError;
use derive_more::Display;
use thiserror::Error;

/// The error returned while negotiating, opening or using a data connection. The
/// [`DataChanErrorKind`] determines the reply the command layer sends to the client.
#[derive(Debug, Error)]
#[error("data connection error: {kind}")]
pub struct DataChanError {
    kind: DataChanErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl DataChanError {
    /// Creates a new error of the given kind, caused by `error`.
    pub fn new<E>(kind: DataChanErrorKind, error: E) -> DataChanError
    where
        E: Into<BoxError>,
    {
        DataChanError {
            kind,
            source: Some(error.into()),
        }
    }

    /// What went wrong.
    pub fn kind(&self) -> DataChanErrorKind {
        self.kind
    }

    /// Attempts to get a reference to the inner `std::io::Error` if there is one.
    pub fn get_io_error(&self) -> Option<&std::io::Error> {
        self.source.as_ref()?.downcast_ref::<std::io::Error>()
    }
}

impl From<DataChanErrorKind> for DataChanError {
    fn from(kind: DataChanErrorKind) -> DataChanError {
        DataChanError { kind, source: None }
    }
}

/// The kinds of [`DataChanError`]. The displayed text starts with the FTP reply code the command
/// layer is expected to answer with.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum DataChanErrorKind {
    /// Every passive port is in use and none came free within the configured wait.
    #[display("425 No passive port available")]
    PortsExhausted,
    /// A passive listener could not be bound.
    #[display("425 Cannot open passive connection, try again")]
    BindFailed,
    /// Connecting to the client's active-mode address failed.
    #[display("425 Cannot open data connection")]
    ConnectFailed,
    /// The client did not connect to the passive port within the idle timeout.
    #[display("425 Timed out waiting for the data connection")]
    AcceptTimeout,
    /// The TLS handshake on the data connection failed.
    #[display("425 TLS negotiation failed on the data connection")]
    TlsHandshake,
    /// A secure data connection was required but no TLS capability is configured.
    #[display("425 Secure data connection required but TLS is not configured")]
    TlsNotConfigured,
    /// A transfer command arrived without a preceding PORT or PASV, or the pending one expired.
    #[display("425 Use PORT or PASV first")]
    NoDataConnection,
    /// The session tried to set up a data connection before logging in.
    #[display("530 Please log in with USER and PASS first")]
    NotLoggedIn,
    /// Active mode is switched off for this listener.
    #[display("502 Active mode is not enabled")]
    ActiveModeDisabled,
    /// The data connection peer is not the control connection peer.
    #[display("534 Data connection address does not match the control connection")]
    AddressMismatch,
    /// The active-mode target is not usable, for example port 0 or an unsupported family.
    #[display("501 Invalid data connection address")]
    InvalidTarget,
    /// Reading or writing the data connection failed midway.
    #[display("426 Connection closed, transfer aborted")]
    TransferFailed,
    /// The transfer was cancelled by ABOR or by closing the session.
    #[display("426 Transfer aborted")]
    Aborted,
    /// The local side of a transfer (file, listing) failed.
    #[display("451 Local error in processing")]
    LocalError,
}

impl DataChanErrorKind {
    /// Tells whether retrying the same request later may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            DataChanErrorKind::PortsExhausted
                | DataChanErrorKind::BindFailed
                | DataChanErrorKind::ConnectFailed
                | DataChanErrorKind::AcceptTimeout
                | DataChanErrorKind::TlsHandshake
                | DataChanErrorKind::NoDataConnection
                | DataChanErrorKind::TransferFailed
                | DataChanErrorKind::Aborted
                | DataChanErrorKind::LocalError
        )
    }
}
