//! Turns PORT and PASV requests into a pending data connection.
//!
//! Each session owns one [`DataConnectionNegotiator`]. At most one request is pending at a time:
//! a new PORT or PASV tears down the previous one, which for passive mode closes the listener and
//! returns its port to the pool.
//!
//! ```text
//!            PORT              PASV
//!   Idle ──────────► PendingActive / PendingPassive ──take_descriptor──► Consumed
//!                           │
//!                           └──── close / idle timeout ────► Aborted
//! ```
//!
//! The idle timeout is only checked when something touches the negotiator. An expired request
//! keeps its listener and port until then, which can be up to one more idle period.

use super::address::{encode_extended_port, encode_host_port};
use super::error::{DataChanError, DataChanErrorKind};
use super::policy::DataConnectionPolicy;
use super::ports::PortReservation;
use super::same_host;
use crate::server::session::ControlConnection;

use slog::Logger;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpSocket};

// How many pool ports a PASV tries when binding fails because another process holds the port.
const BIND_RETRIES: u8 = 10;

/// Where a session is in setting up its data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    /// No request made yet.
    Idle,
    /// A PORT request is waiting for a transfer command.
    PendingActive,
    /// A PASV request is waiting for a transfer command; a listener is bound.
    PendingPassive,
    /// The pending request was handed to a transfer.
    Consumed,
    /// The pending request was closed or timed out.
    Aborted,
}

/// A data connection that was asked for but not opened yet.
#[derive(Debug)]
pub enum DataConnectionDescriptor {
    /// The server connects to the client.
    Active {
        /// The address the client gave with PORT or EPRT.
        target: SocketAddr,
        /// When the request was made.
        requested_at: Instant,
    },
    /// The client connects to the server.
    Passive {
        /// The bound listener the client will connect to.
        listener: TcpListener,
        /// The pool port the listener is bound to.
        reservation: PortReservation,
        /// The address sent to the client.
        advertised: SocketAddr,
        /// When the request was made.
        requested_at: Instant,
    },
}

impl DataConnectionDescriptor {
    /// Describes an active-mode connection to `target`, requested now.
    pub fn active(target: SocketAddr) -> DataConnectionDescriptor {
        DataConnectionDescriptor::Active {
            target,
            requested_at: Instant::now(),
        }
    }

    /// When the request was made.
    pub fn requested_at(&self) -> Instant {
        match self {
            DataConnectionDescriptor::Active { requested_at, .. } | DataConnectionDescriptor::Passive { requested_at, .. } => *requested_at,
        }
    }

    /// Tells whether this is a passive-mode request.
    pub fn is_passive(&self) -> bool {
        matches!(self, DataConnectionDescriptor::Passive { .. })
    }
}

/// The outcome of a successful PASV: where the listener is bound and what to tell the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassiveAddress {
    bound: SocketAddr,
    advertised: SocketAddr,
}

impl PassiveAddress {
    /// The local address of the passive listener.
    pub fn bound(&self) -> SocketAddr {
        self.bound
    }

    /// The address to send to the client.
    pub fn advertised(&self) -> SocketAddr {
        self.advertised
    }

    /// The `h1,h2,h3,h4,p1,p2` text of a 227 reply. Fails for IPv6 addresses, which only EPSV can
    /// carry.
    pub fn to_pasv_string(&self) -> Result<String, DataChanError> {
        match self.advertised {
            SocketAddr::V4(addr) => Ok(encode_host_port(addr)),
            SocketAddr::V6(addr) => match addr.ip().to_ipv4_mapped() {
                Some(ip) => Ok(encode_host_port(std::net::SocketAddrV4::new(ip, addr.port()))),
                None => Err(DataChanError::new(DataChanErrorKind::InvalidTarget, "PASV cannot advertise an IPv6 address, use EPSV")),
            },
        }
    }

    /// The `|||port|` text of a 229 reply.
    pub fn to_epsv_string(&self) -> String {
        encode_extended_port(self.advertised.port())
    }
}

/// The per-session data connection state machine.
#[derive(Debug)]
pub struct DataConnectionNegotiator {
    policy: Arc<DataConnectionPolicy>,
    pending: Option<DataConnectionDescriptor>,
    state: NegotiatorState,
    logger: Logger,
}

impl DataConnectionNegotiator {
    /// Creates an idle negotiator for a session of a listener with the given policy.
    pub fn new(policy: Arc<DataConnectionPolicy>, logger: Logger) -> DataConnectionNegotiator {
        DataConnectionNegotiator {
            policy,
            pending: None,
            state: NegotiatorState::Idle,
            logger,
        }
    }

    /// The current state.
    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Tells whether a request is pending.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The policy this negotiator works with.
    pub fn policy(&self) -> &Arc<DataConnectionPolicy> {
        &self.policy
    }

    /// Handles PORT or EPRT: records `target` as the address to connect to. Any pending request is
    /// torn down first, also when this one is rejected.
    #[tracing_attributes::instrument]
    pub fn initiate_active(&mut self, target: SocketAddr, control: &ControlConnection) -> Result<(), DataChanError> {
        self.discard_pending("superseded by active request");
        self.state = NegotiatorState::Idle;
        if !self.policy.active_enabled() {
            return Err(DataChanErrorKind::ActiveModeDisabled.into());
        }
        if target.port() == 0 {
            return Err(DataChanError::new(DataChanErrorKind::InvalidTarget, "port 0 is not a valid data port"));
        }
        if self.policy.active_ip_check() && !same_host(target.ip(), control.remote_addr().ip()) {
            slog::warn!(self.logger, "Active data connection target does not match the client"; "target" => %target, "client" => %control.remote_addr());
            return Err(DataChanErrorKind::AddressMismatch.into());
        }
        self.pending = Some(DataConnectionDescriptor::active(target));
        self.state = NegotiatorState::PendingActive;
        Ok(())
    }

    /// Handles PASV or EPSV: reserves a pool port, waiting a bounded time when none is free, and
    /// binds a listener on it. Any pending request is torn down first.
    #[tracing_attributes::instrument]
    pub async fn initiate_passive(&mut self, control: &ControlConnection) -> Result<PassiveAddress, DataChanError> {
        self.discard_pending("superseded by passive request");
        self.state = NegotiatorState::Idle;

        let pool = Arc::clone(self.policy.passive_ports());
        let bind_ip = self.policy.passive_address().unwrap_or_else(|| control.local_addr().ip());
        // Ports held by other processes stay reserved here until we are done, so the pool does
        // not hand them out again during this attempt.
        let mut withheld: Vec<PortReservation> = Vec::new();
        for _ in 0..BIND_RETRIES {
            let reservation = pool
                .reserve_with_wait(self.policy.passive_port_wait())
                .await
                .ok_or(DataChanErrorKind::PortsExhausted)?;
            let listener = match bind_listener(SocketAddr::new(bind_ip, reservation.port())) {
                Ok(listener) => listener,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && reservation.port() != 0 => {
                    slog::info!(self.logger, "Passive port in use by another process, trying another"; "port" => reservation.port());
                    withheld.push(reservation);
                    continue;
                }
                Err(e) => {
                    slog::warn!(self.logger, "Could not bind passive listener"; "address" => %bind_ip, "port" => reservation.port(), "error" => %e);
                    return Err(DataChanError::new(DataChanErrorKind::BindFailed, e));
                }
            };
            let bound = listener.local_addr().map_err(|e| DataChanError::new(DataChanErrorKind::BindFailed, e))?;
            let advertised_ip = match self.policy.passive_external_address() {
                Some(ip) => ip,
                None if bound.ip().is_unspecified() => control.local_addr().ip(),
                None => bound.ip(),
            };
            let address = PassiveAddress {
                bound,
                advertised: SocketAddr::new(advertised_ip, bound.port()),
            };
            slog::debug!(self.logger, "Passive listener ready"; "bound" => %bound, "advertised" => %address.advertised);
            self.pending = Some(DataConnectionDescriptor::Passive {
                listener,
                reservation,
                advertised: address.advertised,
                requested_at: Instant::now(),
            });
            self.state = NegotiatorState::PendingPassive;
            return Ok(address);
        }
        Err(DataChanError::new(
            DataChanErrorKind::BindFailed,
            format!("no bindable passive port after {BIND_RETRIES} attempts"),
        ))
    }

    /// Aborts the pending request if it is older than the idle timeout at `now`. Returns whether
    /// it did.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let idle = self.policy.idle_timeout();
        if idle.is_zero() {
            return false;
        }
        let expired = match &self.pending {
            Some(pending) => now.saturating_duration_since(pending.requested_at()) >= idle,
            None => false,
        };
        if expired {
            slog::info!(self.logger, "Pending data connection timed out"; "idle_secs" => idle.as_secs());
            self.pending = None;
            self.state = NegotiatorState::Aborted;
        }
        expired
    }

    /// Hands the pending request to a transfer command.
    pub fn take_descriptor(&mut self) -> Result<DataConnectionDescriptor, DataChanError> {
        self.check_timeout(Instant::now());
        let descriptor = self.pending.take().ok_or(DataChanErrorKind::NoDataConnection)?;
        self.state = NegotiatorState::Consumed;
        Ok(descriptor)
    }

    /// Tears down the pending request, if any. Used for ABOR and when the session ends.
    pub fn close(&mut self) {
        if self.discard_pending("closed") {
            self.state = NegotiatorState::Aborted;
        }
    }

    fn discard_pending(&mut self, reason: &'static str) -> bool {
        match self.pending.take() {
            Some(pending) => {
                slog::debug!(self.logger, "Discarding pending data connection"; "reason" => reason, "passive" => pending.is_passive());
                true
            }
            None => false,
        }
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr.ip() {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::datachan::test_util::{control, free_port, policy_builder};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn negotiator(policy: DataConnectionPolicy) -> DataConnectionNegotiator {
        DataConnectionNegotiator::new(Arc::new(policy), Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn active_mode_can_be_switched_off() {
        let mut n = negotiator(policy_builder().active_enabled(false).build().unwrap());
        let err = n.initiate_active("127.0.0.1:2000".parse().unwrap(), &control()).unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::ActiveModeDisabled);
        assert_eq!(n.state(), NegotiatorState::Idle);
    }

    #[test]
    fn active_target_must_match_client_when_checked() {
        let mut n = negotiator(policy_builder().active_ip_check(true).build().unwrap());
        let err = n.initiate_active("10.1.2.3:2000".parse().unwrap(), &control()).unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::AddressMismatch);
        assert!(!n.has_pending());

        n.initiate_active("127.0.0.1:2000".parse().unwrap(), &control()).unwrap();
        assert_eq!(n.state(), NegotiatorState::PendingActive);
    }

    #[test]
    fn active_target_port_zero_is_rejected() {
        let mut n = negotiator(policy_builder().build().unwrap());
        let err = n.initiate_active("127.0.0.1:0".parse().unwrap(), &control()).unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::InvalidTarget);
    }

    #[tokio::test]
    async fn passive_reserves_and_close_releases() {
        let port = free_port();
        let mut n = negotiator(policy_builder().passive_ports(port.to_string()).build().unwrap());
        let address = n.initiate_passive(&control()).await.unwrap();
        assert_eq!(address.bound().port(), port);
        assert_eq!(address.to_pasv_string().unwrap(), format!("127,0,0,1,{},{}", port >> 8, port & 0xff));
        assert_eq!(n.state(), NegotiatorState::PendingPassive);
        assert!(n.policy().passive_ports().is_reserved(port));

        n.close();
        assert_eq!(n.state(), NegotiatorState::Aborted);
        assert!(!n.policy().passive_ports().is_reserved(port));
    }

    #[tokio::test]
    async fn new_request_supersedes_pending_passive() {
        let port = free_port();
        let mut n = negotiator(policy_builder().passive_ports(port.to_string()).build().unwrap());
        n.initiate_passive(&control()).await.unwrap();
        // The single port must come back for the second PASV to succeed.
        n.initiate_passive(&control()).await.unwrap();
        assert_eq!(n.policy().passive_ports().reserved_count(), 1);

        n.initiate_active("127.0.0.1:2000".parse().unwrap(), &control()).unwrap();
        assert_eq!(n.policy().passive_ports().reserved_count(), 0);
        assert_eq!(n.state(), NegotiatorState::PendingActive);
    }

    #[tokio::test]
    async fn external_address_is_advertised() {
        let mut n = negotiator(policy_builder().passive_external_address("198.51.100.4").build().unwrap());
        let address = n.initiate_passive(&control()).await.unwrap();
        assert_eq!(address.advertised().ip(), "198.51.100.4".parse::<IpAddr>().unwrap());
        assert_eq!(address.advertised().port(), address.bound().port());
        assert_eq!(address.to_epsv_string(), format!("|||{}|", address.bound().port()));
    }

    #[tokio::test]
    async fn idle_pending_request_is_torn_down() {
        let port = free_port();
        let mut n = negotiator(
            policy_builder()
                .passive_ports(port.to_string())
                .idle_timeout(Duration::from_secs(1))
                .build()
                .unwrap(),
        );
        n.initiate_passive(&control()).await.unwrap();
        assert!(!n.check_timeout(Instant::now()));
        assert!(n.check_timeout(Instant::now() + Duration::from_secs(2)));
        assert_eq!(n.state(), NegotiatorState::Aborted);
        assert!(!n.policy().passive_ports().is_reserved(port));
        assert_eq!(n.take_descriptor().unwrap_err().kind(), DataChanErrorKind::NoDataConnection);
    }

    #[tokio::test]
    async fn zero_idle_timeout_never_expires() {
        let mut n = negotiator(policy_builder().idle_timeout(Duration::ZERO).build().unwrap());
        n.initiate_active("127.0.0.1:2000".parse().unwrap(), &control()).unwrap();
        assert!(!n.check_timeout(Instant::now() + Duration::from_secs(3600)));
        assert!(n.take_descriptor().is_ok());
        assert_eq!(n.state(), NegotiatorState::Consumed);
    }

    #[tokio::test]
    async fn exhausted_pool_fails_after_bounded_wait() {
        let port = free_port();
        let policy = Arc::new(
            policy_builder()
                .passive_ports(port.to_string())
                .passive_port_wait(Duration::from_millis(100))
                .build()
                .unwrap(),
        );
        let logger = Logger::root(slog::Discard, slog::o!());
        let mut first = DataConnectionNegotiator::new(Arc::clone(&policy), logger.clone());
        let mut second = DataConnectionNegotiator::new(Arc::clone(&policy), logger);

        first.initiate_passive(&control()).await.unwrap();
        let err = second.initiate_passive(&control()).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::PortsExhausted);

        drop(first);
        assert_eq!(second.initiate_passive(&control()).await.unwrap().bound().port(), port);
    }
}
