//! The per-listener context sessions are created from.

use super::datachan::negotiator::DataConnectionNegotiator;
use super::datachan::opener::DataConnectionOpener;
use super::datachan::policy::DataConnectionPolicy;
use super::datachan::transfer::DataTransferEngine;
use super::gate::{ConnectionConfig, Decision, SessionAuthorizationGate};
use super::session::{ControlConnection, Session, SessionParts};
use super::statistics::FtpStatistics;
use super::tls::TlsCapability;
use crate::notification::{NopListener, PresenceListener, TransferListener};
use crate::options::DEFAULT_TRANSFER_BUFFER_SIZE;

use slog::{Drain, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// One FTP listener: its data connection policy, the TLS capability of its control connections,
/// the server-wide gate and its own statistics.
///
/// ```no_run
/// use ftp_datalink::{DataConnectionPolicy, Listener};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = DataConnectionPolicy::builder().passive_ports("50000-50100").build()?;
/// let listener = Listener::builder(policy).build();
/// let _session = listener.new_session("192.0.2.1:40000".parse()?, "198.51.100.1:21".parse()?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Listener {
    policy: Arc<DataConnectionPolicy>,
    opener: Arc<DataConnectionOpener>,
    engine: DataTransferEngine,
    gate: Arc<SessionAuthorizationGate>,
    statistics: Arc<FtpStatistics>,
    transfer_listener: Arc<dyn TransferListener>,
    presence_listener: Arc<dyn PresenceListener>,
    stopped: AtomicBool,
    logger: Logger,
}

/// Builds a [`Listener`].
#[derive(Debug)]
pub struct ListenerBuilder {
    policy: DataConnectionPolicy,
    tls: Option<TlsCapability>,
    gate: Option<Arc<SessionAuthorizationGate>>,
    buffer_size: usize,
    max_rate: Option<u64>,
    transfer_listener: Arc<dyn TransferListener>,
    presence_listener: Arc<dyn PresenceListener>,
    logger: Option<Logger>,
}

impl Listener {
    /// Starts building a listener with the given data connection policy.
    pub fn builder(policy: DataConnectionPolicy) -> ListenerBuilder {
        ListenerBuilder {
            policy,
            tls: None,
            gate: None,
            buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
            max_rate: None,
            transfer_listener: Arc::new(NopListener {}),
            presence_listener: Arc::new(NopListener {}),
            logger: None,
        }
    }

    /// The data connection policy of this listener.
    pub fn policy(&self) -> &Arc<DataConnectionPolicy> {
        &self.policy
    }

    /// The gate deciding on connections and logins.
    pub fn gate(&self) -> &Arc<SessionAuthorizationGate> {
        &self.gate
    }

    /// This listener's counters.
    pub fn statistics(&self) -> &Arc<FtpStatistics> {
        &self.statistics
    }

    /// Creates the session for a new control connection from `remote` to `local`. Fails when the
    /// gate's session filter refuses the client.
    pub fn new_session(&self, remote: SocketAddr, local: SocketAddr) -> Result<Session, Decision> {
        let connection = self.gate.accept_connection(remote.ip(), &self.statistics)?;
        let id = Uuid::new_v4();
        let logger = self.logger.new(slog::o!("trace-id" => id.to_string(), "source" => remote.to_string()));
        slog::info!(logger, "Session started"; "local" => %local);
        #[cfg(feature = "prometheus")]
        crate::metrics::inc_session();
        Ok(Session::new(SessionParts {
            control: ControlConnection::new(remote, local),
            negotiator: DataConnectionNegotiator::new(Arc::clone(&self.policy), logger.clone()),
            opener: Arc::clone(&self.opener),
            engine: self.engine.clone(),
            gate: Arc::clone(&self.gate),
            listener_stats: Arc::clone(&self.statistics),
            transfer_listener: Arc::clone(&self.transfer_listener),
            presence_listener: Arc::clone(&self.presence_listener),
            connection,
            id,
            logger,
        }))
    }

    /// Shuts this listener down. When it is the last listener of its gate, the gate's background
    /// tasks are stopped and waited for.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        slog::info!(self.logger, "Listener shutting down");
        self.gate.detach().await;
    }
}

impl ListenerBuilder {
    /// Sets the TLS capability of the control connections. Data connections use it unless the
    /// policy carries its own.
    pub fn tls(mut self, tls: TlsCapability) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Shares a gate with other listeners. Without one the listener gets its own gate with the
    /// default [`ConnectionConfig`].
    pub fn gate(mut self, gate: Arc<SessionAuthorizationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sets the size of the chunks transfers copy data in.
    pub fn transfer_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Limits every transfer to `bytes_per_sec`.
    pub fn max_transfer_rate(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.max_rate = bytes_per_sec;
        self
    }

    /// Registers a listener for finished and failed transfers.
    pub fn notify_transfers<L: TransferListener + 'static>(mut self, listener: L) -> Self {
        self.transfer_listener = Arc::new(listener);
        self
    }

    /// Registers a listener for logins and logouts.
    pub fn notify_presence<L: PresenceListener + 'static>(mut self, listener: L) -> Self {
        self.presence_listener = Arc::new(listener);
        self
    }

    /// Sets the logger. Without one, logs go to the `log` crate.
    pub fn logger<L: Into<Option<Logger>>>(mut self, logger: L) -> Self {
        self.logger = logger.into();
        self
    }

    /// Creates the listener. When the gate keeps failed logins across sessions and a runtime is
    /// available, expired entries are swept in the background until the last listener of the gate
    /// is [shut down](Listener::shutdown).
    pub fn build(self) -> Listener {
        let logger = self.logger.unwrap_or_else(|| Logger::root(slog_stdlog::StdLog {}.fuse(), slog::o!()));
        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(SessionAuthorizationGate::new(ConnectionConfig::default(), logger.clone())));
        let policy = Arc::new(self.policy);
        let opener = Arc::new(DataConnectionOpener::new(Arc::clone(&policy), self.tls.as_ref(), logger.clone()));
        let engine = DataTransferEngine::new(logger.clone())
            .buffer_size(self.buffer_size)
            .max_rate(self.max_rate)
            .idle_timeout(policy.idle_timeout());
        gate.attach();
        Listener {
            policy,
            opener,
            engine,
            gate,
            statistics: Arc::new(FtpStatistics::new()),
            transfer_listener: self.transfer_listener,
            presence_listener: self.presence_listener,
            stopped: AtomicBool::new(false),
            logger,
        }
    }
}
