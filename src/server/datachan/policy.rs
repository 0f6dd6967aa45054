//! The per-listener data-connection settings.

use super::ports::{PassivePortPool, PortSet};
use crate::options::{DEFAULT_ACTIVE_ENABLED, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PASSIVE_PORT_WAIT};
use crate::server::error::ConfigError;
use crate::server::tls::TlsCapability;

use serde::Deserialize;
use slog::{Drain, Logger};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// How data connections are set up for the sessions of one listener.
///
/// A policy is immutable once built and shared by all sessions of the listener. It owns the
/// listener's [`PassivePortPool`]. Build one with [`DataConnectionPolicy::builder`]:
///
/// ```no_run
/// use ftp_datalink::DataConnectionPolicy;
/// use std::time::Duration;
///
/// let policy = DataConnectionPolicy::builder()
///     .passive_ports("50000-50100")
///     .passive_external_address("203.0.113.7")
///     .idle_timeout(Duration::from_secs(60))
///     .active_ip_check(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct DataConnectionPolicy {
    idle_timeout: Duration,
    active_enabled: bool,
    active_ip_check: bool,
    active_local_address: Option<IpAddr>,
    active_local_port: u16,
    passive_address: Option<IpAddr>,
    passive_external_address: Option<IpAddr>,
    passive_ports: Arc<PassivePortPool>,
    passive_port_wait: Duration,
    passive_ip_check: bool,
    implicit_ssl: bool,
    tls: Option<TlsCapability>,
}

impl DataConnectionPolicy {
    /// Starts building a policy with the default settings.
    pub fn builder() -> DataConnectionPolicyBuilder {
        DataConnectionPolicyBuilder::default()
    }

    /// How long a pending PORT/PASV stays usable and how long accept and connect may take. Zero
    /// means no limit.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether PORT/EPRT are allowed.
    pub fn active_enabled(&self) -> bool {
        self.active_enabled
    }

    /// Whether an active-mode target must have the IP of the control connection peer.
    pub fn active_ip_check(&self) -> bool {
        self.active_ip_check
    }

    /// The local address active-mode sockets bind to. `None` means the control connection's local
    /// address.
    pub fn active_local_address(&self) -> Option<IpAddr> {
        self.active_local_address
    }

    /// The local port active-mode sockets bind to. 0 lets the operating system choose.
    pub fn active_local_port(&self) -> u16 {
        self.active_local_port
    }

    /// The address passive listeners bind to. `None` means the control connection's local
    /// address.
    pub fn passive_address(&self) -> Option<IpAddr> {
        self.passive_address
    }

    /// The address advertised in PASV replies, for servers behind NAT.
    pub fn passive_external_address(&self) -> Option<IpAddr> {
        self.passive_external_address
    }

    /// The pool passive ports are taken from.
    pub fn passive_ports(&self) -> &Arc<PassivePortPool> {
        &self.passive_ports
    }

    /// How long PASV waits for a port when all are in use.
    pub fn passive_port_wait(&self) -> Duration {
        self.passive_port_wait
    }

    /// Whether the client connecting to a passive port must have the IP of the control connection
    /// peer.
    pub fn passive_ip_check(&self) -> bool {
        self.passive_ip_check
    }

    /// Whether every data connection is secured, regardless of `PROT`.
    pub fn implicit_ssl(&self) -> bool {
        self.implicit_ssl
    }

    /// The TLS capability configured on this policy.
    pub fn tls(&self) -> Option<&TlsCapability> {
        self.tls.as_ref()
    }

    /// Picks the TLS capability for data connections: the policy's own when set, otherwise the
    /// one of the listener.
    pub fn resolve_effective_tls(&self, listener_tls: Option<&TlsCapability>) -> Option<TlsCapability> {
        self.tls.as_ref().or(listener_tls).cloned()
    }
}

/// Builds a [`DataConnectionPolicy`]. Addresses and the port range are validated in
/// [`build`](DataConnectionPolicyBuilder::build).
#[derive(Debug)]
pub struct DataConnectionPolicyBuilder {
    idle_timeout: Duration,
    active_enabled: bool,
    active_ip_check: bool,
    active_local_address: Option<String>,
    active_local_port: u16,
    passive_address: Option<String>,
    passive_external_address: Option<String>,
    passive_ports: Option<String>,
    randomize_passive_ports: bool,
    passive_port_wait: Duration,
    passive_ip_check: bool,
    implicit_ssl: bool,
    tls: Option<TlsCapability>,
    logger: Logger,
}

impl Default for DataConnectionPolicyBuilder {
    fn default() -> Self {
        DataConnectionPolicyBuilder {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            active_enabled: DEFAULT_ACTIVE_ENABLED,
            active_ip_check: false,
            active_local_address: None,
            active_local_port: 0,
            passive_address: None,
            passive_external_address: None,
            passive_ports: None,
            randomize_passive_ports: false,
            passive_port_wait: DEFAULT_PASSIVE_PORT_WAIT,
            passive_ip_check: false,
            implicit_ssl: false,
            tls: None,
            logger: Logger::root(slog_stdlog::StdLog {}.fuse(), slog::o!()),
        }
    }
}

impl DataConnectionPolicyBuilder {
    /// Sets the idle timeout. See [`DataConnectionPolicy::idle_timeout`].
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enables or disables active mode.
    pub fn active_enabled(mut self, enabled: bool) -> Self {
        self.active_enabled = enabled;
        self
    }

    /// Enables or disables the active-mode peer IP check.
    pub fn active_ip_check(mut self, check: bool) -> Self {
        self.active_ip_check = check;
        self
    }

    /// Sets the IP address or host name active-mode sockets bind to.
    pub fn active_local_address<S: Into<String>>(mut self, host: S) -> Self {
        self.active_local_address = Some(host.into());
        self
    }

    /// Sets the local port active-mode sockets bind to.
    pub fn active_local_port(mut self, port: u16) -> Self {
        self.active_local_port = port;
        self
    }

    /// Sets the IP address or host name passive listeners bind to.
    pub fn passive_address<S: Into<String>>(mut self, host: S) -> Self {
        self.passive_address = Some(host.into());
        self
    }

    /// Sets the IP address or host name advertised in PASV replies.
    pub fn passive_external_address<S: Into<String>>(mut self, host: S) -> Self {
        self.passive_external_address = Some(host.into());
        self
    }

    /// Sets the passive port range, for example `"50000-50100"`. Without a range the operating
    /// system picks a port for every passive listener.
    pub fn passive_ports<S: Into<String>>(mut self, range: S) -> Self {
        self.passive_ports = Some(range.into());
        self
    }

    /// Hands out passive ports in random order instead of lowest first.
    pub fn randomize_passive_ports(mut self, randomize: bool) -> Self {
        self.randomize_passive_ports = randomize;
        self
    }

    /// Sets how long PASV waits for a port when all are in use.
    pub fn passive_port_wait(mut self, wait: Duration) -> Self {
        self.passive_port_wait = wait;
        self
    }

    /// Enables or disables the passive-mode peer IP check.
    pub fn passive_ip_check(mut self, check: bool) -> Self {
        self.passive_ip_check = check;
        self
    }

    /// Secures every data connection regardless of `PROT`.
    pub fn implicit_ssl(mut self, implicit: bool) -> Self {
        self.implicit_ssl = implicit;
        self
    }

    /// Sets a TLS capability specific to data connections.
    pub fn tls(mut self, tls: TlsCapability) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the logger of the passive port pool. Data connections log to the listener's logger.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Validates the settings and builds the policy. Host names are resolved here, once.
    pub fn build(self) -> Result<DataConnectionPolicy, ConfigError> {
        let active_local_address = self.active_local_address.as_deref().map(|h| resolve("active local address", h)).transpose()?;
        let passive_address = self.passive_address.as_deref().map(|h| resolve("passive address", h)).transpose()?;
        let passive_external_address = self
            .passive_external_address
            .as_deref()
            .map(|h| resolve("passive external address", h))
            .transpose()?;

        let pool_logger = self.logger.new(slog::o!("component" => "passive-ports"));
        let passive_ports = match self.passive_ports.as_deref() {
            Some(range) => PassivePortPool::new(PortSet::parse(range)?, self.randomize_passive_ports, pool_logger),
            None => PassivePortPool::any_port(pool_logger),
        };

        Ok(DataConnectionPolicy {
            idle_timeout: self.idle_timeout,
            active_enabled: self.active_enabled,
            active_ip_check: self.active_ip_check,
            active_local_address,
            active_local_port: self.active_local_port,
            passive_address,
            passive_external_address,
            passive_ports,
            passive_port_wait: self.passive_port_wait,
            passive_ip_check: self.passive_ip_check,
            implicit_ssl: self.implicit_ssl,
            tls: self.tls,
        })
    }
}

fn resolve(setting: &'static str, host: &str) -> Result<IpAddr, ConfigError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let unresolvable = |source| ConfigError::UnresolvableAddress {
        setting,
        host: host.to_string(),
        source,
    };
    let addrs: Vec<SocketAddr> = (host, 0).to_socket_addrs().map_err(|e| unresolvable(Some(e)))?.collect();
    // PASV can only carry IPv4 so prefer it.
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
        .ok_or_else(|| unresolvable(None))
}

/// The raw data-connection settings as a configuration loader produces them. Every field is
/// optional; unset fields keep the builder's defaults.
///
/// ```
/// use ftp_datalink::DataConnectionConfig;
///
/// let config: DataConnectionConfig = serde_json::from_str(r#"{
///     "idle-time": 120,
///     "passive-ports": "50000-50100",
///     "passive-ip-check": true
/// }"#).unwrap();
/// let policy = config.into_builder().build().unwrap();
/// assert!(policy.passive_ip_check());
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DataConnectionConfig {
    /// Idle timeout in seconds.
    pub idle_time: Option<u64>,
    /// Whether active mode is allowed.
    pub active_enabled: Option<bool>,
    /// Whether the active-mode peer IP is checked.
    pub active_ip_check: Option<bool>,
    /// Local address for active-mode sockets.
    pub active_local_address: Option<String>,
    /// Local port for active-mode sockets.
    pub active_local_port: Option<u16>,
    /// Address passive listeners bind to.
    pub passive_address: Option<String>,
    /// Address advertised in PASV replies.
    pub passive_external_address: Option<String>,
    /// The passive port range.
    pub passive_ports: Option<String>,
    /// Whether passive ports are handed out randomly.
    pub randomize_passive_ports: Option<bool>,
    /// Milliseconds PASV waits for a free port.
    pub passive_port_wait_ms: Option<u64>,
    /// Whether the passive-mode peer IP is checked.
    pub passive_ip_check: Option<bool>,
    /// Whether data connections are always secured.
    pub implicit_ssl: Option<bool>,
}

impl DataConnectionConfig {
    /// Turns the settings into a builder so a TLS capability and logger can still be added.
    pub fn into_builder(self) -> DataConnectionPolicyBuilder {
        let mut b = DataConnectionPolicy::builder();
        if let Some(secs) = self.idle_time {
            b = b.idle_timeout(Duration::from_secs(secs));
        }
        if let Some(v) = self.active_enabled {
            b = b.active_enabled(v);
        }
        if let Some(v) = self.active_ip_check {
            b = b.active_ip_check(v);
        }
        if let Some(v) = self.active_local_address {
            b = b.active_local_address(v);
        }
        if let Some(v) = self.active_local_port {
            b = b.active_local_port(v);
        }
        if let Some(v) = self.passive_address {
            b = b.passive_address(v);
        }
        if let Some(v) = self.passive_external_address {
            b = b.passive_external_address(v);
        }
        if let Some(v) = self.passive_ports {
            b = b.passive_ports(v);
        }
        if let Some(v) = self.randomize_passive_ports {
            b = b.randomize_passive_ports(v);
        }
        if let Some(ms) = self.passive_port_wait_ms {
            b = b.passive_port_wait(Duration::from_millis(ms));
        }
        if let Some(v) = self.passive_ip_check {
            b = b.passive_ip_check(v);
        }
        if let Some(v) = self.implicit_ssl {
            b = b.implicit_ssl(v);
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientAuth;
    use crate::server::tls::tests::dummy_capability;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    #[test]
    fn defaults() {
        let policy = DataConnectionPolicy::builder().build().unwrap();
        assert_eq!(policy.idle_timeout(), Duration::from_secs(300));
        assert!(policy.active_enabled());
        assert!(!policy.active_ip_check());
        assert!(!policy.passive_ip_check());
        assert!(!policy.implicit_ssl());
        assert_eq!(policy.active_local_port(), 0);
        assert_eq!(policy.passive_address(), None);
        assert!(policy.passive_ports().allowed().is_none());
        assert!(policy.tls().is_none());
    }

    #[test]
    fn addresses_are_resolved_when_built() {
        let policy = DataConnectionPolicy::builder()
            .passive_address("127.0.0.1")
            .passive_external_address("203.0.113.7")
            .passive_ports("50000-50010")
            .build()
            .unwrap();
        assert_eq!(policy.passive_address(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(policy.passive_external_address(), Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))));
        assert_eq!(policy.passive_ports().available(), Some(11));
    }

    #[test]
    fn bad_settings_fail_the_build() {
        let err = DataConnectionPolicy::builder().passive_ports("9000-8000").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPortRange { .. }));

        let err = DataConnectionPolicy::builder().passive_address("no-such-host.invalid").build().unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvableAddress { setting: "passive address", .. }));
    }

    #[test]
    fn policy_tls_wins_over_listener_tls() {
        let listener_tls = dummy_capability(ClientAuth::None);
        let without = DataConnectionPolicy::builder().build().unwrap();
        assert_eq!(without.resolve_effective_tls(Some(&listener_tls)).map(|t| t.client_auth()), Some(ClientAuth::None));
        assert!(without.resolve_effective_tls(None).is_none());

        let with = DataConnectionPolicy::builder().tls(dummy_capability(ClientAuth::Need)).build().unwrap();
        assert_eq!(with.resolve_effective_tls(Some(&listener_tls)).map(|t| t.client_auth()), Some(ClientAuth::Need));
    }

    #[test]
    fn config_from_json() {
        let config: DataConnectionConfig = serde_json::from_str(
            r#"{ "idle-time": 10, "active-enabled": false, "passive-ports": "2300,2305", "passive-port-wait-ms": 50 }"#,
        )
        .unwrap();
        let policy = config.into_builder().build().unwrap();
        assert_eq!(policy.idle_timeout(), Duration::from_secs(10));
        assert!(!policy.active_enabled());
        assert_eq!(policy.passive_ports().available(), Some(2));
        assert_eq!(policy.passive_port_wait(), Duration::from_millis(50));

        assert!(serde_json::from_str::<DataConnectionConfig>(r#"{ "passive-portz": "1" }"#).is_err());
    }
}
