//! Decides whether connections and logins are let in, and keeps count of those that were.

use crate::options::{
    DEFAULT_ANONYMOUS_LOGIN_ENABLED, DEFAULT_LOGIN_FAILURE_DELAY, DEFAULT_MAX_ANONYMOUS_LOGINS, DEFAULT_MAX_LOGIN_FAILURES, DEFAULT_MAX_LOGINS,
    FailedLoginsPolicy,
};
use crate::server::failed_logins::FailedLoginsCache;
use crate::server::reply::{Reply, ReplyCode};
use crate::server::shutdown;
use crate::server::statistics::FtpStatistics;

use ftp_datalink_core::auth::UserDetail;
use ftp_datalink_core::filter::{AcceptAll, SessionFilter};
use serde::Deserialize;
use slog::Logger;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Login limits. A limit of 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Maximum number of sessions logged in at the same time.
    pub max_logins: u32,
    /// Whether anonymous users may log in.
    pub anonymous_login_enabled: bool,
    /// Maximum number of anonymous sessions logged in at the same time.
    pub max_anonymous_logins: u32,
    /// Maximum number of sessions one user may have logged in at the same time.
    pub max_logins_per_user: u32,
    /// Maximum number of sessions logged in from one client address at the same time.
    pub max_logins_per_ip: u32,
    /// Failed logins after which a session is disconnected.
    pub max_login_failures: u32,
    /// Milliseconds to wait before answering a failed login.
    pub login_failure_delay_ms: u64,
    /// Locks clients out across sessions after repeated failures. Off unless set.
    #[serde(skip)]
    pub failed_logins_policy: Option<FailedLoginsPolicy>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_logins: DEFAULT_MAX_LOGINS,
            anonymous_login_enabled: DEFAULT_ANONYMOUS_LOGIN_ENABLED,
            max_anonymous_logins: DEFAULT_MAX_ANONYMOUS_LOGINS,
            max_logins_per_user: 0,
            max_logins_per_ip: 0,
            max_login_failures: DEFAULT_MAX_LOGIN_FAILURES,
            login_failure_delay_ms: DEFAULT_LOGIN_FAILURE_DELAY.as_millis() as u64,
            failed_logins_policy: None,
        }
    }
}

impl ConnectionConfig {
    /// The delay applied to failed logins.
    pub fn login_failure_delay(&self) -> Duration {
        Duration::from_millis(self.login_failure_delay_ms)
    }
}

/// The verdict of the [`SessionAuthorizationGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The session may proceed.
    Admit,
    /// Too many sessions are logged in.
    RejectMaxLogins,
    /// Too many anonymous sessions are logged in.
    RejectMaxAnonymous,
    /// The user has too many sessions logged in.
    RejectMaxPerUser,
    /// Too many sessions are logged in from the client's address.
    RejectMaxPerIp,
    /// Anonymous logins are disabled or the account is disabled.
    RejectDisabled,
    /// The client failed to log in too often.
    RejectMaxLoginFailures,
    /// The session filter does not accept the client's address.
    RejectFiltered,
}

impl Decision {
    /// Tells whether the session may proceed.
    pub fn is_admitted(self) -> bool {
        self == Decision::Admit
    }

    /// Tells whether the control connection should be closed after replying.
    pub fn closes_session(self) -> bool {
        matches!(self, Decision::RejectMaxLoginFailures | Decision::RejectFiltered)
    }

    /// The reply to send to the client.
    pub fn reply(self) -> Reply {
        match self {
            Decision::Admit => Reply::new(ReplyCode::UserLoggedIn, "User logged in, proceed"),
            Decision::RejectMaxLogins => Reply::new(ReplyCode::ServiceNotAvailable, "Too many users logged in, try again later"),
            Decision::RejectMaxAnonymous => Reply::new(ReplyCode::ServiceNotAvailable, "Too many anonymous users logged in, try again later"),
            Decision::RejectMaxPerUser => Reply::new(ReplyCode::ServiceNotAvailable, "Too many sessions for this user"),
            Decision::RejectMaxPerIp => Reply::new(ReplyCode::ServiceNotAvailable, "Too many sessions from your address"),
            Decision::RejectDisabled => Reply::new(ReplyCode::NotLoggedIn, "Login not permitted"),
            Decision::RejectMaxLoginFailures => Reply::new(ReplyCode::NotLoggedIn, "Too many failed logins"),
            Decision::RejectFiltered => Reply::new(ReplyCode::ServiceNotAvailable, "Connection refused"),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a session should do after a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedLoginOutcome {
    /// The client may try again.
    Retry,
    /// The failure limit is reached; close the session.
    Disconnect,
}

/// Approves connections and logins against the [`ConnectionConfig`] limits and the session
/// filter, and keeps the login counters.
///
/// One gate is shared by all listeners of a server; the counters it checks against are the
/// server-wide ones. Each listener passes its own statistics along so they are kept per listener
/// too. Background work of the gate runs until the last listener using it shuts down.
#[derive(Debug)]
pub struct SessionAuthorizationGate {
    config: ConnectionConfig,
    filter: Arc<dyn SessionFilter>,
    global: Arc<FtpStatistics>,
    failed_logins: Option<Arc<FailedLoginsCache>>,
    // Serializes check-and-count so concurrent logins cannot both take the last slot.
    admission: tokio::sync::Mutex<()>,
    sweeper_started: AtomicBool,
    listeners: AtomicUsize,
    shutdown: Arc<shutdown::Notifier>,
    logger: Logger,
}

impl SessionAuthorizationGate {
    /// Creates a gate enforcing `config` that accepts every client address.
    pub fn new(config: ConnectionConfig, logger: Logger) -> SessionAuthorizationGate {
        let failed_logins = config.failed_logins_policy.map(FailedLoginsCache::new);
        SessionAuthorizationGate {
            config,
            filter: Arc::new(AcceptAll),
            global: Arc::new(FtpStatistics::new()),
            failed_logins,
            admission: tokio::sync::Mutex::new(()),
            sweeper_started: AtomicBool::new(false),
            listeners: AtomicUsize::new(0),
            shutdown: Arc::new(shutdown::Notifier::new()),
            logger,
        }
    }

    /// Sets the filter deciding which client addresses may connect.
    pub fn with_filter<F: SessionFilter + 'static>(mut self, filter: F) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// The limits enforced.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The server-wide counters.
    pub fn statistics(&self) -> &Arc<FtpStatistics> {
        &self.global
    }

    /// Runs the session filter for a new control connection and counts it when accepted. The
    /// count drops when the returned guard is dropped.
    pub fn accept_connection(&self, remote: IpAddr, listener: &Arc<FtpStatistics>) -> Result<ConnectionGuard, Decision> {
        if !self.filter.accept(remote) {
            slog::info!(self.logger, "Connection refused by session filter"; "client" => %remote);
            return Err(Decision::RejectFiltered);
        }
        let counters = vec![Arc::clone(&self.global), Arc::clone(listener)];
        for c in &counters {
            c.connection_opened();
        }
        Ok(ConnectionGuard { counters })
    }

    /// Tells whether `user` may log in from `ip` right now, without counting anything.
    pub async fn try_admit(&self, user: &dyn UserDetail, ip: IpAddr) -> Decision {
        let c = &self.config;
        if !user.account_enabled() {
            return Decision::RejectDisabled;
        }
        if user.is_anonymous() {
            if !c.anonymous_login_enabled {
                return Decision::RejectDisabled;
            }
            if exceeds(c.max_anonymous_logins, self.global.current_anonymous_logins()) {
                return Decision::RejectMaxAnonymous;
            }
        }
        if exceeds(c.max_logins, self.global.current_logins()) {
            return Decision::RejectMaxLogins;
        }
        if exceeds(c.max_logins_per_user, self.global.current_user_logins(user.username())) {
            return Decision::RejectMaxPerUser;
        }
        if exceeds(c.max_logins_per_ip, self.global.current_ip_logins(ip)) {
            return Decision::RejectMaxPerIp;
        }
        if let Some(cache) = &self.failed_logins {
            if cache.is_locked(ip, user.username()).await {
                return Decision::RejectMaxLoginFailures;
            }
        }
        Decision::Admit
    }

    /// Decides on a successfully authenticated user and, when admitted, counts the login on the
    /// server and on `listener`. The login is counted down exactly once, when the guard drops.
    pub async fn admit(&self, user: &dyn UserDetail, ip: IpAddr, listener: &Arc<FtpStatistics>) -> Result<LoginGuard, Decision> {
        let _admission = self.admission.lock().await;
        let decision = self.try_admit(user, ip).await;
        if decision != Decision::Admit {
            slog::info!(self.logger, "Login rejected"; "username" => user.username(), "client" => %ip, "decision" => %decision);
            return Err(decision);
        }
        if let Some(cache) = &self.failed_logins {
            cache.success(ip, user.username()).await;
        }
        let anonymous = user.is_anonymous();
        let counters = vec![Arc::clone(&self.global), Arc::clone(listener)];
        for c in &counters {
            c.login(user.username(), ip, anonymous);
        }
        slog::info!(self.logger, "User logged in"; "username" => user.username(), "client" => %ip, "anonymous" => anonymous);
        Ok(LoginGuard {
            username: user.username().to_string(),
            ip,
            anonymous,
            counters,
        })
    }

    /// Handles a failed login: waits the configured delay, counts the failure and tells whether
    /// the session should be closed. `session_failures` is the number of failures of this session
    /// including this one.
    pub async fn login_failed(&self, username: &str, ip: IpAddr, session_failures: u32, listener: &Arc<FtpStatistics>) -> FailedLoginOutcome {
        tokio::time::sleep(self.config.login_failure_delay()).await;
        self.global.login_failed();
        listener.login_failed();
        #[cfg(feature = "prometheus")]
        crate::metrics::inc_login_failures();

        let locked = match &self.failed_logins {
            Some(cache) => cache.failed(ip, username).await.is_some(),
            None => false,
        };
        let exhausted = self.config.max_login_failures != 0 && session_failures >= self.config.max_login_failures;
        if locked || exhausted {
            slog::warn!(self.logger, "Too many failed logins"; "username" => username, "client" => %ip, "session_failures" => session_failures, "locked" => locked);
            FailedLoginOutcome::Disconnect
        } else {
            FailedLoginOutcome::Retry
        }
    }

    /// Registers a listener using this gate and makes sure the failed-login sweeper runs.
    pub(crate) fn attach(&self) {
        self.listeners.fetch_add(1, Ordering::AcqRel);
        self.spawn_sweeper();
    }

    /// Unregisters a listener. When it was the last one the sweeper is stopped and waited for.
    pub(crate) async fn detach(&self) {
        let previous = self
            .listeners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            slog::debug!(self.logger, "Last listener detached, stopping background tasks");
            self.shutdown.notify().await;
            self.shutdown.linger().await;
        }
    }

    // Only the first call per gate starts a sweeper.
    fn spawn_sweeper(&self) {
        let Some(cache) = &self.failed_logins else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            slog::warn!(self.logger, "No runtime to sweep failed logins on; entries expire on lookup only");
            return;
        };
        if self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = Arc::clone(cache);
        let logger = self.logger.new(slog::o!("task" => "failed-logins-sweeper"));
        let shutdown = Arc::clone(&self.shutdown);
        runtime.spawn(async move { cache.sweeper(logger, shutdown).await });
    }
}

fn exceeds(limit: u32, current: u64) -> bool {
    limit != 0 && current >= u64::from(limit)
}

/// Counts an accepted control connection until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    counters: Vec<Arc<FtpStatistics>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        for c in &self.counters {
            c.connection_closed();
        }
    }
}

/// Counts a logged in session until dropped.
#[derive(Debug)]
pub struct LoginGuard {
    username: String,
    ip: IpAddr,
    anonymous: bool,
    counters: Vec<Arc<FtpStatistics>>,
}

impl LoginGuard {
    /// The user that logged in.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Tells whether the login is anonymous.
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }
}

impl Drop for LoginGuard {
    fn drop(&mut self) {
        for c in &self.counters {
            c.logout(&self.username, self.ip, self.anonymous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::FailedLoginsBlock;
    use crate::server::ipfilter::{IpFilterType, RemoteIpFilter};
    use ftp_datalink_core::auth::DefaultUser;
    use pretty_assertions::assert_eq;

    fn gate(config: ConnectionConfig) -> SessionAuthorizationGate {
        SessionAuthorizationGate::new(config, Logger::root(slog::Discard, slog::o!()))
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    fn no_delay() -> ConnectionConfig {
        ConnectionConfig {
            login_failure_delay_ms: 0,
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn sweeper_outlives_all_but_the_last_listener() {
        let gate = gate(ConnectionConfig {
            failed_logins_policy: Some(FailedLoginsPolicy::new(2, Duration::from_secs(60), FailedLoginsBlock::Ip)),
            ..no_delay()
        });
        gate.attach();
        gate.attach();
        assert!(gate.sweeper_started.load(Ordering::Acquire));

        tokio::time::timeout(Duration::from_secs(1), gate.detach()).await.unwrap();
        let mut signal = gate.shutdown.subscribe().await;
        assert!(tokio::time::timeout(Duration::from_millis(50), signal.listen()).await.is_err());
        drop(signal);

        // Returns only once the sweeper has stopped.
        tokio::time::timeout(Duration::from_secs(1), gate.detach()).await.unwrap();
        // Extra detaches are harmless.
        tokio::time::timeout(Duration::from_secs(1), gate.detach()).await.unwrap();
    }

    #[tokio::test]
    async fn max_logins_rejects_the_extra_session() {
        let gate = gate(ConnectionConfig { max_logins: 2, ..no_delay() });
        let listener = Arc::new(FtpStatistics::new());
        let a = gate.admit(&DefaultUser::new("a"), ip(1), &listener).await.unwrap();
        let _b = gate.admit(&DefaultUser::new("b"), ip(2), &listener).await.unwrap();
        assert_eq!(gate.admit(&DefaultUser::new("c"), ip(3), &listener).await.unwrap_err(), Decision::RejectMaxLogins);

        drop(a);
        assert_eq!(gate.statistics().current_logins(), 1);
        assert_eq!(listener.current_logins(), 1);
        assert!(gate.admit(&DefaultUser::new("c"), ip(3), &listener).await.is_ok());
    }

    #[tokio::test]
    async fn anonymous_limits() {
        let listener = Arc::new(FtpStatistics::new());
        let disabled = gate(ConnectionConfig {
            anonymous_login_enabled: false,
            ..no_delay()
        });
        assert_eq!(disabled.try_admit(&DefaultUser::anonymous(), ip(1)).await, Decision::RejectDisabled);

        let limited = gate(ConnectionConfig {
            max_anonymous_logins: 1,
            ..no_delay()
        });
        let _first = limited.admit(&DefaultUser::anonymous(), ip(1), &listener).await.unwrap();
        assert_eq!(limited.try_admit(&DefaultUser::anonymous(), ip(2)).await, Decision::RejectMaxAnonymous);
        assert_eq!(limited.try_admit(&DefaultUser::new("alice"), ip(2)).await, Decision::Admit);
    }

    #[tokio::test]
    async fn per_user_and_per_ip_limits() {
        let gate = gate(ConnectionConfig {
            max_logins_per_user: 1,
            max_logins_per_ip: 2,
            ..no_delay()
        });
        let listener = Arc::new(FtpStatistics::new());
        let _a = gate.admit(&DefaultUser::new("alice"), ip(1), &listener).await.unwrap();
        assert_eq!(gate.try_admit(&DefaultUser::new("alice"), ip(9)).await, Decision::RejectMaxPerUser);
        let _b = gate.admit(&DefaultUser::new("bob"), ip(1), &listener).await.unwrap();
        assert_eq!(gate.try_admit(&DefaultUser::new("carol"), ip(1)).await, Decision::RejectMaxPerIp);
    }

    #[tokio::test]
    async fn guard_counts_down_exactly_once() {
        let gate = gate(no_delay());
        let listener = Arc::new(FtpStatistics::new());
        let guard = gate.admit(&DefaultUser::new("alice"), ip(1), &listener).await.unwrap();
        let _other = gate.admit(&DefaultUser::new("bob"), ip(1), &listener).await.unwrap();
        drop(guard);
        assert_eq!(gate.statistics().current_logins(), 1);
        assert_eq!(gate.statistics().current_user_logins("alice"), 0);
        assert_eq!(gate.statistics().current_ip_logins(ip(1)), 1);
    }

    #[tokio::test]
    async fn session_is_closed_after_max_failures() {
        let gate = gate(ConnectionConfig {
            max_login_failures: 3,
            login_failure_delay_ms: 20,
            ..ConnectionConfig::default()
        });
        let listener = Arc::new(FtpStatistics::new());
        let started = std::time::Instant::now();
        assert_eq!(gate.login_failed("bob", ip(1), 1, &listener).await, FailedLoginOutcome::Retry);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(gate.login_failed("bob", ip(1), 2, &listener).await, FailedLoginOutcome::Retry);
        assert_eq!(gate.login_failed("bob", ip(1), 3, &listener).await, FailedLoginOutcome::Disconnect);
        assert_eq!(gate.statistics().total_failed_logins(), 3);
        assert_eq!(listener.total_failed_logins(), 3);
    }

    #[tokio::test]
    async fn lockout_spans_sessions_when_configured() {
        let gate = gate(ConnectionConfig {
            max_login_failures: 0,
            failed_logins_policy: Some(FailedLoginsPolicy::new(2, Duration::from_secs(60), FailedLoginsBlock::Ip)),
            ..no_delay()
        });
        let listener = Arc::new(FtpStatistics::new());
        assert_eq!(gate.login_failed("bob", ip(1), 1, &listener).await, FailedLoginOutcome::Retry);
        assert_eq!(gate.login_failed("bob", ip(1), 1, &listener).await, FailedLoginOutcome::Disconnect);
        assert_eq!(gate.try_admit(&DefaultUser::new("alice"), ip(1)).await, Decision::RejectMaxLoginFailures);
        assert_eq!(gate.try_admit(&DefaultUser::new("alice"), ip(2)).await, Decision::Admit);
    }

    #[tokio::test]
    async fn filter_and_connection_counting() {
        let gate = gate(no_delay()).with_filter(RemoteIpFilter::parse(IpFilterType::Deny, "192.0.2.66").unwrap());
        let listener = Arc::new(FtpStatistics::new());
        assert_eq!(gate.accept_connection(ip(66), &listener).unwrap_err(), Decision::RejectFiltered);
        let guard = gate.accept_connection(ip(1), &listener).unwrap();
        assert_eq!((gate.statistics().current_connections(), listener.current_connections()), (1, 1));
        drop(guard);
        assert_eq!(listener.current_connections(), 0);
        assert_eq!(listener.total_connections(), 1);
    }

    #[test]
    fn config_from_json() {
        let config: ConnectionConfig = serde_json::from_str(r#"{ "max-logins": 5, "anonymous-login-enabled": false }"#).unwrap();
        assert_eq!(config.max_logins, 5);
        assert!(!config.anonymous_login_enabled);
        assert_eq!(config.max_login_failures, 3);
        assert_eq!(config.login_failure_delay(), Duration::from_millis(500));
    }

    #[test]
    fn decisions_map_to_replies() {
        assert!(Decision::RejectMaxLoginFailures.closes_session());
        assert!(!Decision::RejectMaxLogins.closes_session());
        match Decision::RejectMaxLogins.reply() {
            Reply::CodeAndMsg { code, .. } => assert_eq!(code, ReplyCode::ServiceNotAvailable),
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
