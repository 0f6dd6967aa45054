use super::datachan::error::{DataChanError, DataChanErrorKind};
use super::datachan::negotiator::PassiveAddress;
use super::gate::Decision;

use std::fmt;

/// A reply to the FTP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing is sent.
    None,
    /// A single line reply.
    CodeAndMsg {
        /// The reply code
        code: ReplyCode,
        /// The text after the code
        msg: String,
    },
    /// A multi line reply.
    MultiLine {
        /// The reply code
        code: ReplyCode,
        /// The lines of text
        lines: Vec<String>,
    },
}

/// The reply codes according to RFC 959 and its extensions that the data connection and login
/// handling produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyCode {
    /// 150, about to open the data connection
    FileStatusOkay = 150,
    /// 200
    CommandOkay = 200,
    /// 221
    ClosingControlConnection = 221,
    /// 225, data connection open, no transfer in progress
    DataConnectionOpen = 225,
    /// 226, transfer complete
    ClosingDataConnection = 226,
    /// 227, reply to PASV
    EnteringPassiveMode = 227,
    /// 229, reply to EPSV
    EnteringExtendedPassiveMode = 229,
    /// 230
    UserLoggedIn = 230,
    /// 331
    NeedPassword = 331,
    /// 421, the service is not available and the control connection will be closed
    ServiceNotAvailable = 421,
    /// 425
    CantOpenDataConnection = 425,
    /// 426
    ConnectionClosed = 426,
    /// 451
    LocalError = 451,
    /// 501
    ParameterSyntaxError = 501,
    /// 502
    CommandNotImplemented = 502,
    /// 503
    BadCommandSequence = 503,
    /// 530
    NotLoggedIn = 530,
    /// 534, request denied for policy reasons
    DeniedForPolicyReasons = 534,
    /// 550
    FileError = 550,
}

impl ReplyCode {
    /// The numeric code.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Reply {
    /// Creates a single line reply.
    pub fn new(code: ReplyCode, message: &str) -> Self {
        Reply::CodeAndMsg {
            code,
            msg: message.to_string(),
        }
    }

    /// Creates a single line reply from an owned message.
    pub fn new_with_string(code: ReplyCode, msg: String) -> Self {
        Reply::CodeAndMsg { code, msg }
    }

    /// Creates a multi line reply.
    pub fn new_multiline<I>(code: ReplyCode, lines: I) -> Self
    where
        I: IntoIterator,
        I::Item: std::fmt::Display,
    {
        Reply::MultiLine {
            code,
            lines: lines.into_iter().map(|item| format!("{}", item)).collect(),
        }
    }

    /// A no-reply
    pub fn none() -> Self {
        Reply::None
    }

    /// The 227 reply to PASV. Fails when the advertised address is IPv6.
    pub fn passive(address: &PassiveAddress) -> Result<Self, DataChanError> {
        Ok(Reply::new_with_string(
            ReplyCode::EnteringPassiveMode,
            format!("Entering Passive Mode ({})", address.to_pasv_string()?),
        ))
    }

    /// The 229 reply to EPSV.
    pub fn extended_passive(address: &PassiveAddress) -> Self {
        Reply::new_with_string(
            ReplyCode::EnteringExtendedPassiveMode,
            format!("Entering Extended Passive Mode ({})", address.to_epsv_string()),
        )
    }

    /// The reply code, if any.
    pub fn code(&self) -> Option<ReplyCode> {
        match self {
            Reply::None => None,
            Reply::CodeAndMsg { code, .. } | Reply::MultiLine { code, .. } => Some(*code),
        }
    }
}

/// Renders the reply the way it goes over the control connection, CRLF terminated.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::None => Ok(()),
            Reply::CodeAndMsg { code, msg } => write!(f, "{} {}\r\n", code, msg),
            Reply::MultiLine { code, lines } => match lines.split_last() {
                None => write!(f, "{} \r\n", code),
                Some((last, [])) => write!(f, "{} {}\r\n", code, last),
                Some((last, rest)) => {
                    write!(f, "{}-{}\r\n", code, rest[0])?;
                    for line in &rest[1..] {
                        write!(f, " {}\r\n", line)?;
                    }
                    write!(f, "{} {}\r\n", code, last)
                }
            },
        }
    }
}

impl From<DataChanErrorKind> for ReplyCode {
    fn from(kind: DataChanErrorKind) -> ReplyCode {
        match kind {
            DataChanErrorKind::PortsExhausted
            | DataChanErrorKind::BindFailed
            | DataChanErrorKind::ConnectFailed
            | DataChanErrorKind::AcceptTimeout
            | DataChanErrorKind::TlsHandshake
            | DataChanErrorKind::TlsNotConfigured
            | DataChanErrorKind::NoDataConnection => ReplyCode::CantOpenDataConnection,
            DataChanErrorKind::NotLoggedIn => ReplyCode::NotLoggedIn,
            DataChanErrorKind::ActiveModeDisabled => ReplyCode::CommandNotImplemented,
            DataChanErrorKind::AddressMismatch => ReplyCode::DeniedForPolicyReasons,
            DataChanErrorKind::InvalidTarget => ReplyCode::ParameterSyntaxError,
            DataChanErrorKind::TransferFailed | DataChanErrorKind::Aborted => ReplyCode::ConnectionClosed,
            DataChanErrorKind::LocalError => ReplyCode::LocalError,
        }
    }
}

impl From<DataChanErrorKind> for Reply {
    fn from(kind: DataChanErrorKind) -> Reply {
        // The kind's text starts with the code; keep only the message.
        let text = kind.to_string();
        let msg = text.split_once(' ').map(|(_, m)| m).unwrap_or(&text);
        Reply::new(ReplyCode::from(kind), msg)
    }
}

impl From<&DataChanError> for Reply {
    fn from(err: &DataChanError) -> Reply {
        Reply::from(err.kind())
    }
}

impl From<Decision> for Reply {
    fn from(decision: Decision) -> Reply {
        decision.reply()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn error_kinds_map_to_codes() {
        let cases = [
            (DataChanErrorKind::PortsExhausted, 425),
            (DataChanErrorKind::AcceptTimeout, 425),
            (DataChanErrorKind::TlsNotConfigured, 425),
            (DataChanErrorKind::NotLoggedIn, 530),
            (DataChanErrorKind::ActiveModeDisabled, 502),
            (DataChanErrorKind::AddressMismatch, 534),
            (DataChanErrorKind::InvalidTarget, 501),
            (DataChanErrorKind::TransferFailed, 426),
            (DataChanErrorKind::Aborted, 426),
            (DataChanErrorKind::LocalError, 451),
        ];
        for (kind, code) in cases {
            assert_eq!(ReplyCode::from(kind).code(), code, "{:?}", kind);
            // The displayed kind leads with the same code.
            assert!(kind.to_string().starts_with(&code.to_string()));
        }
    }

    #[test]
    fn replies_render_for_the_wire() {
        let reply = Reply::from(DataChanErrorKind::NoDataConnection);
        assert_eq!(reply.to_string(), "425 Use PORT or PASV first\r\n");

        let multi = Reply::new_multiline(ReplyCode::CommandOkay, ["first", "second", "last"]);
        assert_eq!(multi.to_string(), "200-first\r\n second\r\n200 last\r\n");
        assert_eq!(Reply::none().to_string(), "");
    }
}
