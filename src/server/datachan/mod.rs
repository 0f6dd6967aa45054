//! Contains the data channel: negotiating, opening and using the connections files and listings
//! travel over.

pub(crate) mod address;
pub(crate) mod error;
pub(crate) mod negotiator;
pub(crate) mod opener;
pub(crate) mod policy;
pub(crate) mod ports;
pub(crate) mod stream;
pub(crate) mod transfer;

use std::net::IpAddr;

// Compares peers regardless of whether one of them arrived as an IPv4-mapped IPv6 address.
pub(crate) fn same_host(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::policy::{DataConnectionPolicy, DataConnectionPolicyBuilder};
    use crate::server::session::ControlConnection;
    use slog::Logger;

    pub(crate) fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    pub(crate) fn policy_builder() -> DataConnectionPolicyBuilder {
        DataConnectionPolicy::builder().logger(logger())
    }

    /// A control connection from a loopback client to a loopback server.
    pub(crate) fn control() -> ControlConnection {
        ControlConnection::new("127.0.0.1:40000".parse().unwrap(), "127.0.0.1:21".parse().unwrap())
    }

    /// A port nobody listens on right now.
    pub(crate) fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_addresses_are_the_same_host() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert!(same_host(v4, mapped));
        assert!(!same_host(v4, "192.0.2.2".parse().unwrap()));
    }
}
