//! The per-control-connection state that data connections are negotiated and used from.

use super::datachan::address::{decode_extended_host_port, decode_host_port};
use super::datachan::error::{DataChanError, DataChanErrorKind};
use super::datachan::negotiator::{DataConnectionNegotiator, NegotiatorState};
use super::datachan::opener::DataConnectionOpener;
use super::datachan::stream::DataConnection;
use super::datachan::transfer::{DataTransferEngine, TransferError};
use super::gate::{ConnectionGuard, FailedLoginOutcome, LoginGuard, SessionAuthorizationGate};
use super::reply::{Reply, ReplyCode};
use super::statistics::FtpStatistics;
use crate::notification::{EventMeta, PresenceEvent, PresenceListener, TransferEvent, TransferListener};
use crate::options::DataType;

use ftp_datalink_core::auth::UserDetail;
use slog::Logger;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The two ends of a control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlConnection {
    remote: SocketAddr,
    local: SocketAddr,
}

impl ControlConnection {
    /// Describes a control connection from `remote` (the client) to `local` (this server).
    pub fn new(remote: SocketAddr, local: SocketAddr) -> ControlConnection {
        ControlConnection { remote, local }
    }

    /// The client's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// The server's address the client connected to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// When the session last did something. Clones share the timestamp, so a transfer can keep the
/// control loop's idle check at bay.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    base: Instant,
    elapsed_ms: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        ActivityTracker::new()
    }
}

impl ActivityTracker {
    /// Creates a tracker that saw activity just now.
    pub fn new() -> ActivityTracker {
        ActivityTracker {
            base: Instant::now(),
            elapsed_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records activity now.
    pub fn touch(&self) {
        let ms = self.base.elapsed().as_millis() as u64;
        self.elapsed_ms.fetch_max(ms, Ordering::AcqRel);
    }

    /// When activity was last recorded, with millisecond precision.
    pub fn last_activity(&self) -> Instant {
        self.base + Duration::from_millis(self.elapsed_ms.load(Ordering::Acquire))
    }

    /// How long the session has been idle.
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }
}

/// Everything one control connection needs to negotiate, open and use data connections, and the
/// guards that keep it counted by the [`SessionAuthorizationGate`].
///
/// PORT, PASV and transfers are refused with 530 until a user is [logged in](Session::login).
///
/// Sessions are created by [`Listener::new_session`](crate::Listener::new_session). Dropping a
/// session closes any pending data connection, returns its passive port and counts the session
/// out.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    control: ControlConnection,
    negotiator: DataConnectionNegotiator,
    opener: Arc<DataConnectionOpener>,
    engine: DataTransferEngine,
    gate: Arc<SessionAuthorizationGate>,
    listener_stats: Arc<FtpStatistics>,
    transfer_listener: Arc<dyn TransferListener>,
    presence_listener: Arc<dyn PresenceListener>,
    login: Option<LoginGuard>,
    login_failures: u32,
    data_protected: bool,
    data_type: DataType,
    activity: ActivityTracker,
    cancel: CancellationToken,
    sequence: u64,
    logger: Logger,
    // Dropped last so the connection is counted until everything else is gone.
    _connection: ConnectionGuard,
}

/// The listener-wide parts a session is built from.
pub(crate) struct SessionParts {
    pub(crate) control: ControlConnection,
    pub(crate) negotiator: DataConnectionNegotiator,
    pub(crate) opener: Arc<DataConnectionOpener>,
    pub(crate) engine: DataTransferEngine,
    pub(crate) gate: Arc<SessionAuthorizationGate>,
    pub(crate) listener_stats: Arc<FtpStatistics>,
    pub(crate) transfer_listener: Arc<dyn TransferListener>,
    pub(crate) presence_listener: Arc<dyn PresenceListener>,
    pub(crate) connection: ConnectionGuard,
    pub(crate) id: Uuid,
    pub(crate) logger: Logger,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Session {
        Session {
            id: parts.id,
            control: parts.control,
            negotiator: parts.negotiator,
            opener: parts.opener,
            engine: parts.engine,
            gate: parts.gate,
            listener_stats: parts.listener_stats,
            transfer_listener: parts.transfer_listener,
            presence_listener: parts.presence_listener,
            login: None,
            login_failures: 0,
            data_protected: false,
            data_type: DataType::default(),
            activity: ActivityTracker::new(),
            cancel: CancellationToken::new(),
            sequence: 0,
            logger: parts.logger,
            _connection: parts.connection,
        }
    }

    /// Identifies the session in logs and events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The control connection this session belongs to.
    pub fn control(&self) -> &ControlConnection {
        &self.control
    }

    /// The session's activity timestamp.
    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// Where the data connection negotiation stands.
    pub fn data_state(&self) -> NegotiatorState {
        self.negotiator.state()
    }

    /// The logged in user's name.
    pub fn username(&self) -> Option<&str> {
        self.login.as_ref().map(|l| l.username())
    }

    /// Tells whether a user is logged in.
    pub fn is_logged_in(&self) -> bool {
        self.login.is_some()
    }

    /// Sets whether data connections are protected with TLS, as `PROT P` and `PROT C` do.
    pub fn set_data_protection(&mut self, protected: bool) {
        self.data_protected = protected;
    }

    /// Sets the representation type, as `TYPE A` and `TYPE I` do.
    pub fn set_data_type(&mut self, data_type: DataType) {
        self.data_type = data_type;
    }

    /// A token that aborts the running transfer when cancelled. The control loop keeps a clone to
    /// act on ABOR while a transfer holds the session.
    pub fn abort_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handles PASV.
    pub async fn pasv(&mut self) -> Reply {
        self.activity.touch();
        if let Err(e) = self.ensure_logged_in() {
            return self.error_reply(&e);
        }
        match self.negotiator.initiate_passive(&self.control).await {
            Ok(address) => match Reply::passive(&address) {
                Ok(reply) => reply,
                Err(e) => {
                    self.negotiator.close();
                    self.error_reply(&e)
                }
            },
            Err(e) => self.error_reply(&e),
        }
    }

    /// Handles EPSV.
    pub async fn epsv(&mut self) -> Reply {
        self.activity.touch();
        if let Err(e) = self.ensure_logged_in() {
            return self.error_reply(&e);
        }
        match self.negotiator.initiate_passive(&self.control).await {
            Ok(address) => Reply::extended_passive(&address),
            Err(e) => self.error_reply(&e),
        }
    }

    /// Handles PORT with its `h1,h2,h3,h4,p1,p2` argument.
    pub fn port(&mut self, arg: &str) -> Reply {
        self.activity.touch();
        if let Err(e) = self.ensure_logged_in() {
            return self.error_reply(&e);
        }
        match decode_host_port(arg) {
            Ok(target) => self.initiate_active(target, "PORT"),
            Err(e) => self.error_reply(&e),
        }
    }

    /// Handles EPRT with its `|proto|address|port|` argument.
    pub fn eprt(&mut self, arg: &str) -> Reply {
        self.activity.touch();
        if let Err(e) = self.ensure_logged_in() {
            return self.error_reply(&e);
        }
        match decode_extended_host_port(arg) {
            Ok(target) => self.initiate_active(target, "EPRT"),
            Err(e) => self.error_reply(&e),
        }
    }

    fn initiate_active(&mut self, target: SocketAddr, command: &str) -> Reply {
        match self.negotiator.initiate_active(target, &self.control) {
            Ok(()) => Reply::new_with_string(ReplyCode::CommandOkay, format!("{} command successful", command)),
            Err(e) => self.error_reply(&e),
        }
    }

    /// Opens the data connection negotiated with the last PORT or PASV. The caller sends the 150
    /// reply before calling this.
    pub async fn open_data_connection(&mut self) -> Result<DataConnection, DataChanError> {
        self.ensure_logged_in()?;
        let descriptor = self.negotiator.take_descriptor()?;
        let conn = self.opener.open(descriptor, &self.control, self.data_protected).await?;
        self.activity.touch();
        Ok(conn)
    }

    /// Runs a download, as RETR does: opens the data connection, sends everything `source` yields
    /// and returns the final reply.
    pub async fn retrieve<R: AsyncRead + Unpin>(&mut self, source: R) -> Reply {
        let conn = match self.open_data_connection().await {
            Ok(conn) => conn,
            Err(e) => return self.transfer_failed(e, 0).await,
        };
        let peer = conn.peer_addr();
        let cancel = self.fresh_token();
        let result = self.engine.transfer_to_client(conn, source, self.data_type, &self.activity, &cancel).await;
        self.finish_transfer(result, |bytes| TransferEvent::Sent { peer, bytes }).await
    }

    /// Runs an upload, as STOR does: opens the data connection, writes everything the client
    /// sends into `sink` and returns the final reply.
    pub async fn store<W: AsyncWrite + Unpin>(&mut self, sink: W) -> Reply {
        let conn = match self.open_data_connection().await {
            Ok(conn) => conn,
            Err(e) => return self.transfer_failed(e, 0).await,
        };
        let peer = conn.peer_addr();
        let cancel = self.fresh_token();
        let result = self.engine.transfer_from_client(conn, sink, self.data_type, &self.activity, &cancel).await;
        self.finish_transfer(result, |bytes| TransferEvent::Received { peer, bytes }).await
    }

    /// Sends a listing or other text over the data connection, as LIST and NLST do.
    pub async fn send_text(&mut self, text: &str) -> Reply {
        let conn = match self.open_data_connection().await {
            Ok(conn) => conn,
            Err(e) => return self.transfer_failed(e, 0).await,
        };
        let peer = conn.peer_addr();
        let cancel = self.fresh_token();
        let result = self.engine.send_text(conn, text, &self.activity, &cancel).await;
        self.finish_transfer(result, |bytes| TransferEvent::Sent { peer, bytes }).await
    }

    /// Handles ABOR once no transfer holds the session: tears down the pending data connection.
    /// A transfer in flight is aborted through [`abort_handle`](Session::abort_handle).
    pub fn abort(&mut self) -> Reply {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.negotiator.close();
        Reply::new(ReplyCode::ClosingDataConnection, "Closing data connection")
    }

    /// Closes the pending data connection when it has been waiting longer than the idle timeout.
    /// Returns whether it did.
    pub fn check_idle(&mut self) -> bool {
        self.negotiator.check_timeout(Instant::now())
    }

    /// Logs `user` in after the credentials checked out, if the gate admits it.
    pub async fn login(&mut self, user: &dyn UserDetail) -> Reply {
        self.logout().await;
        let ip = self.control.remote_addr().ip();
        match self.gate.admit(user, ip, &self.listener_stats).await {
            Ok(guard) => {
                self.login = Some(guard);
                self.login_failures = 0;
                self.logger = self.logger.new(slog::o!("username" => user.username().to_string()));
                self.notify_presence(PresenceEvent::LoggedIn).await;
                Reply::new(ReplyCode::UserLoggedIn, "User logged in, proceed")
            }
            Err(decision) => decision.reply(),
        }
    }

    /// Records a failed login of `username`. The session should be closed when this returns
    /// [`FailedLoginOutcome::Disconnect`].
    pub async fn login_failed(&mut self, username: &str) -> FailedLoginOutcome {
        self.login_failures = self.login_failures.saturating_add(1);
        let ip = self.control.remote_addr().ip();
        self.gate.login_failed(username, ip, self.login_failures, &self.listener_stats).await
    }

    /// Logs the current user out, if any, and closes the pending data connection.
    pub async fn logout(&mut self) {
        if self.login.is_some() {
            self.negotiator.close();
            self.notify_presence(PresenceEvent::LoggedOut).await;
            self.login = None;
        }
    }

    /// Ends the session: aborts everything in flight, returns the passive port and counts the
    /// session out.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.negotiator.close();
        self.logout().await;
        slog::info!(self.logger, "Session closed");
    }

    // Only sessions the gate admitted may touch the port pool or open data connections.
    fn ensure_logged_in(&self) -> Result<(), DataChanError> {
        match self.login {
            Some(_) => Ok(()),
            None => Err(DataChanErrorKind::NotLoggedIn.into()),
        }
    }

    fn fresh_token(&mut self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.cancel.clone()
    }

    async fn finish_transfer<F>(&mut self, result: Result<u64, TransferError>, event: F) -> Reply
    where
        F: FnOnce(u64) -> TransferEvent,
    {
        match result {
            Ok(bytes) => {
                let event = event(bytes);
                let direction = match event {
                    TransferEvent::Received { .. } => {
                        self.gate.statistics().upload(bytes);
                        self.listener_stats.upload(bytes);
                        "upload"
                    }
                    _ => {
                        self.gate.statistics().download(bytes);
                        self.listener_stats.download(bytes);
                        "download"
                    }
                };
                #[cfg(feature = "prometheus")]
                crate::metrics::add_transfer_metric(direction, bytes);
                slog::info!(self.logger, "Transfer complete"; "direction" => direction, "bytes" => bytes);
                self.notify_transfer(event).await;
                Reply::new(ReplyCode::ClosingDataConnection, "Transfer complete, closing data connection")
            }
            Err(e) => {
                let bytes = e.bytes();
                self.transfer_failed(e.into_inner(), bytes).await
            }
        }
    }

    async fn transfer_failed(&mut self, e: DataChanError, bytes: u64) -> Reply {
        let reply = self.error_reply(&e);
        if e.kind() == DataChanErrorKind::Aborted {
            self.negotiator.close();
        }
        self.notify_transfer(TransferEvent::Failed { kind: e.kind(), bytes }).await;
        reply
    }

    fn error_reply(&self, e: &DataChanError) -> Reply {
        slog::warn!(self.logger, "Data connection error"; "kind" => ?e.kind(), "error" => %e);
        #[cfg(feature = "prometheus")]
        crate::metrics::add_error_metric(e.kind());
        Reply::from(e)
    }

    fn next_meta(&mut self) -> EventMeta {
        self.sequence += 1;
        EventMeta {
            username: self.username().unwrap_or_default().to_string(),
            trace_id: self.id.to_string(),
            sequence_number: self.sequence,
        }
    }

    async fn notify_transfer(&mut self, event: TransferEvent) {
        let meta = self.next_meta();
        self.transfer_listener.receive_transfer_event(event, meta).await;
    }

    async fn notify_presence(&mut self, event: PresenceEvent) {
        let meta = self.next_meta();
        self.presence_listener.receive_presence_event(event, meta).await;
    }
}
