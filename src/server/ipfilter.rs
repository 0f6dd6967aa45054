use crate::server::error::ConfigError;

use ftp_datalink_core::filter::SessionFilter;
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;

/// Whether the subnets of a [`RemoteIpFilter`] are the only ones let in or the ones kept out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFilterType {
    /// Only clients inside one of the subnets are accepted.
    Allow,
    /// Clients inside one of the subnets are rejected.
    Deny,
}

/// An IP subnet such as `192.168.0.0/16`, `10.0.0.1`, `2001:db8::/32` or the wildcard form
/// `192.168.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Tells whether `ip` is part of this subnet. IPv4-mapped IPv6 addresses match their IPv4
    /// form.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => masked(u128::from(u32::from(net)), 32, self.prefix) == masked(u128::from(u32::from(ip)), 32, self.prefix),
            (IpAddr::V6(net), IpAddr::V6(ip)) => masked(u128::from(net), 128, self.prefix) == masked(u128::from(ip), 128, self.prefix),
            _ => false,
        }
    }
}

fn masked(bits: u128, width: u8, prefix: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    let host_bits = u32::from(width - prefix);
    (bits >> host_bits) << host_bits
}

impl FromStr for Subnet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidSubnet(s.to_string());

        if let Some(prefix_part) = s.strip_suffix(".*") {
            // Wildcard form: every given octet is fixed, the rest is free.
            let octets: Vec<u8> = prefix_part.split('.').map(|o| o.parse::<u8>()).collect::<Result<_, _>>().map_err(|_| invalid())?;
            if octets.is_empty() || octets.len() > 3 {
                return Err(invalid());
            }
            let mut full = [0u8; 4];
            full[..octets.len()].copy_from_slice(&octets);
            return Ok(Subnet {
                network: IpAddr::from(full),
                prefix: (octets.len() * 8) as u8,
            });
        }

        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().map_err(|_| invalid())?)),
            None => (s, None),
        };
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let width = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(width);
        if prefix > width {
            return Err(invalid());
        }
        Ok(Subnet { network, prefix })
    }
}

impl Display for Subnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// A [`SessionFilter`] accepting or rejecting clients by subnet.
///
/// A deny filter without subnets lets everybody in, an allow filter without subnets nobody.
///
/// ```
/// use ftp_datalink::{IpFilterType, RemoteIpFilter};
/// use ftp_datalink_core::filter::SessionFilter;
///
/// let filter = RemoteIpFilter::parse(IpFilterType::Deny, "10.0.0.0/8, 192.168.*").unwrap();
/// assert!(!filter.accept("10.1.2.3".parse().unwrap()));
/// assert!(!filter.accept("192.168.7.7".parse().unwrap()));
/// assert!(filter.accept("172.16.0.1".parse().unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIpFilter {
    kind: IpFilterType,
    subnets: Vec<Subnet>,
}

impl RemoteIpFilter {
    /// Creates a filter from parsed subnets.
    pub fn new(kind: IpFilterType, subnets: Vec<Subnet>) -> RemoteIpFilter {
        RemoteIpFilter { kind, subnets }
    }

    /// Creates a filter from a comma or whitespace separated list of subnets.
    pub fn parse(kind: IpFilterType, subnets: &str) -> Result<RemoteIpFilter, ConfigError> {
        let subnets = subnets
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Subnet>, _>>()?;
        Ok(RemoteIpFilter::new(kind, subnets))
    }

    /// Whether this is an allow or a deny filter.
    pub fn kind(&self) -> IpFilterType {
        self.kind
    }
}

impl SessionFilter for RemoteIpFilter {
    fn accept(&self, remote: IpAddr) -> bool {
        let listed = self.subnets.iter().any(|s| s.contains(remote));
        match self.kind {
            IpFilterType::Allow => listed,
            IpFilterType::Deny => !listed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn subnet_forms() {
        let net: Subnet = "192.168.0.0/16".parse().unwrap();
        assert!(net.contains(ip("192.168.200.1")));
        assert!(!net.contains(ip("192.169.0.1")));
        assert!(net.contains(ip("::ffff:192.168.1.1")));

        let single: Subnet = "10.0.0.1".parse().unwrap();
        assert!(single.contains(ip("10.0.0.1")));
        assert!(!single.contains(ip("10.0.0.2")));

        let wildcard: Subnet = "172.16.*".parse().unwrap();
        assert_eq!(wildcard.to_string(), "172.16.0.0/16");
        assert!(wildcard.contains(ip("172.16.99.1")));

        let v6: Subnet = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains(ip("2001:db8:1::1")));
        assert!(!v6.contains(ip("10.0.0.1")));

        let everything: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(ip("203.0.113.9")));
    }

    #[test]
    fn malformed_subnets() {
        for bad in ["", "10.0.0.0/33", "300.0.0.1", "10.*.*", "a.b.*", "10.0.0.0/x"] {
            assert!(bad.parse::<Subnet>().is_err(), "'{}' should not parse", bad);
        }
    }

    #[test]
    fn allow_and_deny() {
        let allow = RemoteIpFilter::parse(IpFilterType::Allow, "127.0.0.1 10.0.0.0/8").unwrap();
        assert!(allow.accept(ip("10.20.30.40")));
        assert!(!allow.accept(ip("192.0.2.1")));

        let empty_deny = RemoteIpFilter::parse(IpFilterType::Deny, "").unwrap();
        assert!(empty_deny.accept(ip("192.0.2.1")));
        let empty_allow = RemoteIpFilter::parse(IpFilterType::Allow, "").unwrap();
        assert!(!empty_allow.accept(ip("192.0.2.1")));
    }
}
