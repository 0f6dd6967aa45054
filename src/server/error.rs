//! Contains the error returned when a listener's data-connection settings are invalid.

use ftp_datalink_core::BoxError;
use thiserror::Error;

/// Error returned while building a [`DataConnectionPolicy`](crate::DataConnectionPolicy), a
/// [`TlsCapability`](crate::TlsCapability) or a [`RemoteIpFilter`](crate::RemoteIpFilter). These
/// are fatal: the listener must not start.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The passive port range string could not be parsed.
    #[error("invalid passive port range '{range}': {reason}")]
    InvalidPortRange {
        /// The range as it was configured.
        range: String,
        /// What is wrong with it.
        reason: String,
    },
    /// A configured host name or address did not resolve to an IP address.
    #[error("could not resolve {setting} '{host}'")]
    UnresolvableAddress {
        /// The name of the setting holding the address.
        setting: &'static str,
        /// The configured value.
        host: String,
        /// The resolver error, if any.
        #[source]
        source: Option<std::io::Error>,
    },
    /// A subnet in an IP filter is malformed.
    #[error("invalid subnet '{0}'")]
    InvalidSubnet(String),
    /// Certificates, keys or the TLS configuration built from them are unusable.
    #[error("TLS configuration error: {msg}")]
    Tls {
        /// What failed.
        msg: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}

impl ConfigError {
    pub(crate) fn port_range(range: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidPortRange {
            range: range.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn tls<E>(msg: impl Into<String>, source: E) -> ConfigError
    where
        E: Into<BoxError>,
    {
        ConfigError::Tls {
            msg: msg.into(),
            source: source.into(),
        }
    }
}
