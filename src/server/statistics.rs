//! Connection, login and transfer counters.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing what happened on a listener, or on the whole server when shared by all
/// listeners. All operations are lock free except the per-user and per-address tables, which are
/// sharded maps.
#[derive(Debug)]
pub struct FtpStatistics {
    start_time: DateTime<Utc>,
    current_connections: AtomicU64,
    total_connections: AtomicU64,
    current_logins: AtomicU64,
    total_logins: AtomicU64,
    current_anonymous_logins: AtomicU64,
    total_anonymous_logins: AtomicU64,
    total_failed_logins: AtomicU64,
    last_failed_login: Mutex<Option<DateTime<Utc>>>,
    logins_per_user: DashMap<String, u64>,
    logins_per_user_ip: DashMap<(String, IpAddr), u64>,
    logins_per_ip: DashMap<IpAddr, u64>,
    uploads: AtomicU64,
    downloads: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl Default for FtpStatistics {
    fn default() -> Self {
        FtpStatistics {
            start_time: Utc::now(),
            current_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            current_logins: AtomicU64::new(0),
            total_logins: AtomicU64::new(0),
            current_anonymous_logins: AtomicU64::new(0),
            total_anonymous_logins: AtomicU64::new(0),
            total_failed_logins: AtomicU64::new(0),
            last_failed_login: Mutex::new(None),
            logins_per_user: DashMap::new(),
            logins_per_user_ip: DashMap::new(),
            logins_per_ip: DashMap::new(),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }
}

impl FtpStatistics {
    /// Creates zeroed counters, starting now.
    pub fn new() -> FtpStatistics {
        FtpStatistics::default()
    }

    /// When counting started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Connections open right now.
    pub fn current_connections(&self) -> u64 {
        self.current_connections.load(Ordering::Acquire)
    }

    /// Connections opened since start.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Acquire)
    }

    /// Sessions logged in right now, anonymous ones included.
    pub fn current_logins(&self) -> u64 {
        self.current_logins.load(Ordering::Acquire)
    }

    /// Successful logins since start.
    pub fn total_logins(&self) -> u64 {
        self.total_logins.load(Ordering::Acquire)
    }

    /// Anonymous sessions logged in right now.
    pub fn current_anonymous_logins(&self) -> u64 {
        self.current_anonymous_logins.load(Ordering::Acquire)
    }

    /// Successful anonymous logins since start.
    pub fn total_anonymous_logins(&self) -> u64 {
        self.total_anonymous_logins.load(Ordering::Acquire)
    }

    /// Failed logins since start.
    pub fn total_failed_logins(&self) -> u64 {
        self.total_failed_logins.load(Ordering::Acquire)
    }

    /// When the last login failed.
    pub fn last_failed_login(&self) -> Option<DateTime<Utc>> {
        *self.last_failed_login.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sessions of `user` logged in right now.
    pub fn current_user_logins(&self, user: &str) -> u64 {
        self.logins_per_user.get(user).map(|c| *c).unwrap_or(0)
    }

    /// Sessions of `user` from `ip` logged in right now.
    pub fn current_user_ip_logins(&self, user: &str, ip: IpAddr) -> u64 {
        self.logins_per_user_ip.get(&(user.to_string(), ip)).map(|c| *c).unwrap_or(0)
    }

    /// Sessions from `ip` logged in right now, whatever the user.
    pub fn current_ip_logins(&self, ip: IpAddr) -> u64 {
        self.logins_per_ip.get(&ip).map(|c| *c).unwrap_or(0)
    }

    /// Completed uploads.
    pub fn total_uploads(&self) -> u64 {
        self.uploads.load(Ordering::Acquire)
    }

    /// Completed downloads.
    pub fn total_downloads(&self) -> u64 {
        self.downloads.load(Ordering::Acquire)
    }

    /// Bytes received from clients.
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Acquire)
    }

    /// Bytes sent to clients.
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Acquire)
    }

    pub(crate) fn connection_opened(&self) {
        self.current_connections.fetch_add(1, Ordering::AcqRel);
        self.total_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_closed(&self) {
        decrement(&self.current_connections);
    }

    pub(crate) fn login(&self, user: &str, ip: IpAddr, anonymous: bool) {
        self.current_logins.fetch_add(1, Ordering::AcqRel);
        self.total_logins.fetch_add(1, Ordering::AcqRel);
        if anonymous {
            self.current_anonymous_logins.fetch_add(1, Ordering::AcqRel);
            self.total_anonymous_logins.fetch_add(1, Ordering::AcqRel);
        }
        *self.logins_per_user.entry(user.to_string()).or_insert(0) += 1;
        *self.logins_per_user_ip.entry((user.to_string(), ip)).or_insert(0) += 1;
        *self.logins_per_ip.entry(ip).or_insert(0) += 1;
    }

    pub(crate) fn logout(&self, user: &str, ip: IpAddr, anonymous: bool) {
        decrement(&self.current_logins);
        if anonymous {
            decrement(&self.current_anonymous_logins);
        }
        decrement_entry(&self.logins_per_user, user.to_string());
        decrement_entry(&self.logins_per_user_ip, (user.to_string(), ip));
        decrement_entry(&self.logins_per_ip, ip);
    }

    pub(crate) fn login_failed(&self) {
        self.total_failed_logins.fetch_add(1, Ordering::AcqRel);
        *self.last_failed_login.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    pub(crate) fn upload(&self, bytes: u64) {
        self.uploads.fetch_add(1, Ordering::AcqRel);
        self.bytes_uploaded.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn download(&self, bytes: u64) {
        self.downloads.fetch_add(1, Ordering::AcqRel);
        self.bytes_downloaded.fetch_add(bytes, Ordering::AcqRel);
    }
}

// Never wraps below zero.
fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
}

fn decrement_entry<K: std::hash::Hash + Eq>(map: &DashMap<K, u64>, key: K) {
    map.remove_if_mut(&key, |_, count| {
        *count = count.saturating_sub(1);
        *count == 0
    });
}
