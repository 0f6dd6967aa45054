//! Contains the option types and defaults that can be given to the data-connection policy and the
//! session admission gate.

use bitflags::bitflags;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

// Defaults follow what FTP servers in the wild ship with so that an unconfigured listener behaves
// unsurprisingly.
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub(crate) const DEFAULT_ACTIVE_ENABLED: bool = true;
pub(crate) const DEFAULT_PASSIVE_PORT_WAIT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_MAX_LOGINS: u32 = 10;
pub(crate) const DEFAULT_ANONYMOUS_LOGIN_ENABLED: bool = true;
pub(crate) const DEFAULT_MAX_ANONYMOUS_LOGINS: u32 = 10;
pub(crate) const DEFAULT_MAX_LOGIN_FAILURES: u32 = 3;
pub(crate) const DEFAULT_LOGIN_FAILURE_DELAY: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_FAILED_LOGINS_EXPIRY: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 4096;

/// Whether the server asks data and control channel TLS clients for a certificate.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum ClientAuth {
    /// No client certificate is requested.
    #[default]
    None,
    /// A client certificate is requested but the handshake continues without one.
    Want,
    /// The handshake fails unless the client presents a certificate signed by a trusted CA.
    Need,
}

impl Display for ClientAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientAuth::None => "none",
            ClientAuth::Want => "want",
            ClientAuth::Need => "need",
        })
    }
}

bitflags! {
    /// Used to configure TLS options employed for FTPS data channels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlsFlags: u32 {
        /// Enables TLS version 1.2
        const V1_2               = 0b00000001;
        /// Enables TLS version 1.3
        const V1_3               = 0b00000010;
        /// Enables TLS session resumption via means of sessions IDs.
        const RESUMPTION_SESS_ID = 0b00001000;

        /// Enables the latest safe TLS versions i.e. 1.2 and 1.3
        const LATEST_VERSIONS = Self::V1_2.bits() | Self::V1_3.bits();
    }
}

impl Default for TlsFlags {
    fn default() -> TlsFlags {
        TlsFlags::LATEST_VERSIONS | TlsFlags::RESUMPTION_SESS_ID
    }
}

/// What a failed-logins entry is keyed on and therefore what gets blocked once the maximum number
/// of consecutive failures is reached.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum FailedLoginsBlock {
    /// Block the client IP regardless of the user name tried.
    Ip,
    /// Block the user name regardless of the client IP.
    User,
    /// Block only the combination of user name and client IP.
    #[default]
    UserAndIp,
}

/// Governs how consecutive failed logins are counted and for how long they are remembered.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FailedLoginsPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) block_by: FailedLoginsBlock,
    pub(crate) expires_after: Duration,
}

impl FailedLoginsPolicy {
    /// Creates a policy blocking on `block_by` after `max_attempts` consecutive failures. Entries
    /// are forgotten once `expires_after` passed since the last failure.
    pub fn new(max_attempts: u32, expires_after: Duration, block_by: FailedLoginsBlock) -> FailedLoginsPolicy {
        FailedLoginsPolicy {
            max_attempts,
            block_by,
            expires_after,
        }
    }
}

impl Default for FailedLoginsPolicy {
    fn default() -> Self {
        FailedLoginsPolicy::new(DEFAULT_MAX_LOGIN_FAILURES, DEFAULT_FAILED_LOGINS_EXPIRY, FailedLoginsBlock::default())
    }
}

/// The representation type of a transfer, as set with the FTP `TYPE` command.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum DataType {
    /// Line endings are converted between the local `\n` and the network `\r\n`.
    Ascii,
    /// Bytes are transferred untouched.
    #[default]
    Binary,
}
