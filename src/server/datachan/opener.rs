//! Establishes negotiated data connections at transfer time.

use super::error::{DataChanError, DataChanErrorKind};
use super::negotiator::DataConnectionDescriptor;
use super::policy::DataConnectionPolicy;
use super::same_host;
use super::stream::{DataConnection, DataStream};
use crate::server::session::ControlConnection;
use crate::server::tls::TlsCapability;

use slog::Logger;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::error::Elapsed;
use tokio_rustls::server::TlsStream;

/// Opens the socket described by a [`DataConnectionDescriptor`] when a transfer command arrives:
/// connects out for active mode, accepts the client for passive mode and secures the result with
/// TLS when asked to.
#[derive(Debug)]
pub struct DataConnectionOpener {
    policy: Arc<DataConnectionPolicy>,
    tls: Option<TlsCapability>,
    logger: Logger,
}

impl DataConnectionOpener {
    /// Creates an opener for the listener's policy. `listener_tls` is used when the policy has no
    /// TLS capability of its own.
    pub fn new(policy: Arc<DataConnectionPolicy>, listener_tls: Option<&TlsCapability>, logger: Logger) -> DataConnectionOpener {
        let tls = policy.resolve_effective_tls(listener_tls);
        DataConnectionOpener { policy, tls, logger }
    }

    /// Opens the data connection. `secure` tells whether the session asked for a protected data
    /// channel (`PROT P`); implicit SSL listeners always secure it.
    ///
    /// On failure every socket is closed and a passive port goes back to the pool.
    #[tracing_attributes::instrument]
    pub async fn open(&self, descriptor: DataConnectionDescriptor, control: &ControlConnection, secure: bool) -> Result<DataConnection, DataChanError> {
        let tls = match (secure || self.policy.implicit_ssl(), &self.tls) {
            (false, _) => None,
            (true, Some(tls)) => Some(tls),
            (true, None) => {
                slog::warn!(self.logger, "Secure data connection requested but TLS is not configured");
                return Err(DataChanErrorKind::TlsNotConfigured.into());
            }
        };

        let (tcp, reservation) = match descriptor {
            DataConnectionDescriptor::Active { target, .. } => (self.connect_active(target, control).await?, None),
            DataConnectionDescriptor::Passive { listener, reservation, .. } => (self.accept_passive(listener, control).await?, Some(reservation)),
        };

        let stream = match tls {
            Some(tls) => DataStream::Tls(Box::new(self.handshake(tls, tcp).await?)),
            None => DataStream::Plain(tcp),
        };
        let connection = DataConnection::new(stream, reservation).map_err(|e| DataChanError::new(DataChanErrorKind::ConnectFailed, e))?;
        slog::debug!(self.logger, "Data connection open"; "peer" => %connection.peer_addr(), "secure" => connection.is_secure());
        Ok(connection)
    }

    async fn connect_active(&self, target: SocketAddr, control: &ControlConnection) -> Result<TcpStream, DataChanError> {
        if self.policy.active_ip_check() && !same_host(target.ip(), control.remote_addr().ip()) {
            slog::warn!(self.logger, "Refusing active data connection to foreign host"; "target" => %target, "client" => %control.remote_addr());
            return Err(DataChanErrorKind::AddressMismatch.into());
        }

        let local_ip = self.policy.active_local_address().unwrap_or_else(|| control.local_addr().ip());
        let local_ip = match (local_ip, target.ip()) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => local_ip,
            (_, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (_, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let local = SocketAddr::new(local_ip, self.policy.active_local_port());
        let socket = bind_socket(local).map_err(|e| {
            slog::warn!(self.logger, "Could not bind active data socket"; "local" => %local, "error" => %e);
            DataChanError::new(DataChanErrorKind::BindFailed, e)
        })?;

        match self.within_idle_timeout(socket.connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                slog::info!(self.logger, "Could not connect to client"; "target" => %target, "error" => %e);
                Err(DataChanError::new(DataChanErrorKind::ConnectFailed, e))
            }
            Err(elapsed) => {
                slog::info!(self.logger, "Timed out connecting to client"; "target" => %target);
                Err(DataChanError::new(DataChanErrorKind::ConnectFailed, elapsed))
            }
        }
    }

    // Takes the listener by value: a passive port accepts exactly one connection.
    async fn accept_passive(&self, listener: TcpListener, control: &ControlConnection) -> Result<TcpStream, DataChanError> {
        let (stream, peer) = match self.within_idle_timeout(listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => return Err(DataChanError::new(DataChanErrorKind::ConnectFailed, e)),
            Err(elapsed) => {
                slog::info!(self.logger, "Client did not connect to passive port in time"; "port" => listener.local_addr().map(|a| a.port()).unwrap_or(0));
                return Err(DataChanError::new(DataChanErrorKind::AcceptTimeout, elapsed));
            }
        };
        if self.policy.passive_ip_check() && !same_host(peer.ip(), control.remote_addr().ip()) {
            slog::warn!(self.logger, "Passive data connection from foreign host closed"; "peer" => %peer, "client" => %control.remote_addr());
            return Err(DataChanErrorKind::AddressMismatch.into());
        }
        Ok(stream)
    }

    async fn handshake(&self, tls: &TlsCapability, tcp: TcpStream) -> Result<TlsStream<TcpStream>, DataChanError> {
        match self.within_idle_timeout(tls.acceptor().accept(tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                slog::info!(self.logger, "TLS handshake on data connection failed"; "error" => %e);
                Err(DataChanError::new(DataChanErrorKind::TlsHandshake, e))
            }
            Err(elapsed) => Err(DataChanError::new(DataChanErrorKind::TlsHandshake, elapsed)),
        }
    }

    async fn within_idle_timeout<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        let idle = self.policy.idle_timeout();
        if idle.is_zero() {
            Ok(fut.await)
        } else {
            tokio::time::timeout(idle, fut).await
        }
    }
}

fn bind_socket(local: SocketAddr) -> std::io::Result<TcpSocket> {
    let socket = match local.ip() {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::datachan::negotiator::DataConnectionNegotiator;
    use crate::server::datachan::test_util::{control, free_port, logger, policy_builder};
    use crate::options::ClientAuth;
    use crate::server::tls::tests::self_signed;
    use pretty_assertions::assert_eq;
    use rustls::pki_types::ServerName;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    fn parts(policy: DataConnectionPolicy) -> (DataConnectionNegotiator, DataConnectionOpener) {
        let policy = Arc::new(policy);
        (
            DataConnectionNegotiator::new(Arc::clone(&policy), logger()),
            DataConnectionOpener::new(policy, None, logger()),
        )
    }

    #[tokio::test]
    async fn passive_connection_keeps_port_until_dropped() {
        let port = free_port();
        let (mut negotiator, opener) = parts(policy_builder().passive_ports(port.to_string()).build().unwrap());
        let address = negotiator.initiate_passive(&control()).await.unwrap();

        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(address.advertised()).await.unwrap();
            s.write_all(b"hello").await.unwrap();
        });
        let descriptor = negotiator.take_descriptor().unwrap();
        let mut conn = opener.open(descriptor, &control(), false).await.unwrap();
        client.await.unwrap();

        let mut buf = Vec::new();
        conn.stream().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        assert!(!conn.is_secure());
        assert!(negotiator.policy().passive_ports().is_reserved(port));
        drop(conn);
        assert!(!negotiator.policy().passive_ports().is_reserved(port));
    }

    #[tokio::test]
    async fn passive_peer_must_match_client_when_checked() {
        let port = free_port();
        let (mut negotiator, opener) = parts(policy_builder().passive_ports(port.to_string()).passive_ip_check(true).build().unwrap());
        let foreign_control = ControlConnection::new("10.9.9.9:40000".parse().unwrap(), "127.0.0.1:21".parse().unwrap());
        let address = negotiator.initiate_passive(&foreign_control).await.unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(address.bound()).await });
        let err = opener.open(negotiator.take_descriptor().unwrap(), &foreign_control, false).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::AddressMismatch);
        assert!(client.await.unwrap().is_ok());
        assert!(!negotiator.policy().passive_ports().is_reserved(port));
    }

    #[tokio::test]
    async fn passive_accept_times_out() {
        let port = free_port();
        let (mut negotiator, opener) = parts(
            policy_builder()
                .passive_ports(port.to_string())
                .idle_timeout(Duration::from_millis(100))
                .build()
                .unwrap(),
        );
        negotiator.initiate_passive(&control()).await.unwrap();
        let err = opener.open(negotiator.take_descriptor().unwrap(), &control(), false).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::AcceptTimeout);
        assert!(!negotiator.policy().passive_ports().is_reserved(port));
    }

    #[tokio::test]
    async fn active_connection_reaches_client() {
        let client = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = client.local_addr().unwrap();
        let (mut negotiator, opener) = parts(policy_builder().active_ip_check(true).build().unwrap());
        negotiator.initiate_active(target, &control()).unwrap();

        let mut conn = opener.open(negotiator.take_descriptor().unwrap(), &control(), false).await.unwrap();
        let (mut accepted, from) = client.accept().await.unwrap();
        assert_eq!(from, conn.local_addr());

        conn.stream().write_all(b"listing").await.unwrap();
        conn.stream().shutdown().await.unwrap();
        let mut buf = String::new();
        accepted.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "listing");
    }

    #[tokio::test]
    async fn active_target_is_checked_again_on_open() {
        let (_, opener) = parts(policy_builder().active_ip_check(true).build().unwrap());
        let descriptor = DataConnectionDescriptor::active("10.1.1.1:2000".parse().unwrap());
        let err = opener.open(descriptor, &control(), false).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::AddressMismatch);
    }

    #[tokio::test]
    async fn active_connect_failure_is_reported() {
        let (_, opener) = parts(policy_builder().build().unwrap());
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), free_port());
        let err = opener.open(DataConnectionDescriptor::active(target), &control(), false).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::ConnectFailed);
    }

    fn localhost() -> ServerName<'static> {
        ServerName::try_from("localhost").unwrap()
    }

    #[tokio::test]
    async fn implicit_ssl_secures_passive_connection() {
        let port = free_port();
        let (tls, client_config) = self_signed(ClientAuth::None);
        let policy = Arc::new(policy_builder().passive_ports(port.to_string()).implicit_ssl(true).build().unwrap());
        let mut negotiator = DataConnectionNegotiator::new(Arc::clone(&policy), logger());
        let opener = DataConnectionOpener::new(policy, Some(&tls), logger());
        let address = negotiator.initiate_passive(&control()).await.unwrap();

        let client = tokio::spawn(async move {
            let tcp = TcpStream::connect(address.advertised()).await.unwrap();
            let mut stream = TlsConnector::from(client_config).connect(localhost(), tcp).await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });
        let mut conn = opener.open(negotiator.take_descriptor().unwrap(), &control(), false).await.unwrap();
        assert!(conn.is_secure());
        conn.stream().write_all(b"secret listing").await.unwrap();
        conn.stream().shutdown().await.unwrap();
        assert_eq!(client.await.unwrap(), b"secret listing");
        drop(conn);
        assert!(!negotiator.policy().passive_ports().is_reserved(port));
    }

    #[tokio::test]
    async fn protected_active_connection_uses_listener_tls() {
        let (tls, client_config) = self_signed(ClientAuth::None);
        let client = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = client.local_addr().unwrap();
        let policy = Arc::new(policy_builder().build().unwrap());
        let mut negotiator = DataConnectionNegotiator::new(Arc::clone(&policy), logger());
        let opener = DataConnectionOpener::new(policy, Some(&tls), logger());
        negotiator.initiate_active(target, &control()).unwrap();

        // In active mode the FTP client still plays the TLS client.
        let uploader = tokio::spawn(async move {
            let (tcp, _) = client.accept().await.unwrap();
            let mut stream = TlsConnector::from(client_config).connect(localhost(), tcp).await.unwrap();
            stream.write_all(b"uploaded over tls").await.unwrap();
            stream.shutdown().await.unwrap();
        });
        let mut conn = opener.open(negotiator.take_descriptor().unwrap(), &control(), true).await.unwrap();
        assert!(conn.is_secure());
        let mut received = Vec::new();
        conn.stream().read_to_end(&mut received).await.unwrap();
        uploader.await.unwrap();
        assert_eq!(received, b"uploaded over tls");
    }

    #[tokio::test]
    async fn required_client_certificate_is_enforced_in_both_modes() {
        let (tls, client_config) = self_signed(ClientAuth::Need);

        let port = free_port();
        let policy = Arc::new(policy_builder().passive_ports(port.to_string()).build().unwrap());
        let mut negotiator = DataConnectionNegotiator::new(Arc::clone(&policy), logger());
        let opener = DataConnectionOpener::new(policy, Some(&tls), logger());
        let address = negotiator.initiate_passive(&control()).await.unwrap();
        let config = Arc::clone(&client_config);
        let passive_client = tokio::spawn(async move {
            let tcp = TcpStream::connect(address.advertised()).await.unwrap();
            let _ = TlsConnector::from(config).connect(localhost(), tcp).await;
        });
        let err = opener.open(negotiator.take_descriptor().unwrap(), &control(), true).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::TlsHandshake);
        assert!(!negotiator.policy().passive_ports().is_reserved(port));
        passive_client.await.unwrap();

        let client = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = client.local_addr().unwrap();
        negotiator.initiate_active(target, &control()).unwrap();
        let active_client = tokio::spawn(async move {
            let (tcp, _) = client.accept().await.unwrap();
            let _ = TlsConnector::from(client_config).connect(localhost(), tcp).await;
        });
        let err = opener.open(negotiator.take_descriptor().unwrap(), &control(), true).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::TlsHandshake);
        active_client.await.unwrap();
    }

    #[tokio::test]
    async fn secure_channel_without_tls_fails_and_releases_port() {
        let port = free_port();
        let (mut negotiator, opener) = parts(policy_builder().passive_ports(port.to_string()).implicit_ssl(true).build().unwrap());
        negotiator.initiate_passive(&control()).await.unwrap();
        let err = opener.open(negotiator.take_descriptor().unwrap(), &control(), false).await.unwrap_err();
        assert_eq!(err.kind(), DataChanErrorKind::TlsNotConfigured);
        assert!(!negotiator.policy().passive_ports().is_reserved(port));
    }
}
