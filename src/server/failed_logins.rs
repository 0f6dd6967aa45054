use crate::options::{FailedLoginsBlock, FailedLoginsPolicy};

use super::shutdown;
use slog::Logger;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

#[derive(Hash, Eq, PartialEq, Debug, Clone)]
struct FailedLoginsKey {
    ip: Option<IpAddr>,
    username: Option<String>,
}

#[derive(Debug, Clone)]
struct FailedLoginsEntry {
    attempts: u32,
    last_attempt_at: Instant,
}

impl FailedLoginsEntry {
    fn new() -> Mutex<FailedLoginsEntry> {
        Mutex::new(FailedLoginsEntry {
            attempts: 1,
            last_attempt_at: Instant::now(),
        })
    }

    fn time_elapsed(&self) -> Duration {
        self.last_attempt_at.elapsed()
    }

    fn touch(&mut self) {
        self.last_attempt_at = Instant::now();
    }
}

/// Remembers consecutive failed logins across sessions so that a client can be locked out.
#[derive(Debug)]
pub(crate) struct FailedLoginsCache {
    policy: FailedLoginsPolicy,
    failed_logins: RwLock<HashMap<FailedLoginsKey, Mutex<FailedLoginsEntry>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    // With this failed login attempt the lockout threshold has been reached
    MaxFailuresReached,
    // The account is already locked out from previous failed attempts
    AlreadyLocked,
}

impl FailedLoginsCache {
    pub(crate) fn new(policy: FailedLoginsPolicy) -> Arc<FailedLoginsCache> {
        Arc::new(FailedLoginsCache {
            policy,
            failed_logins: RwLock::new(HashMap::new()),
        })
    }

    fn is_expired(&self, time_elapsed: Duration) -> bool {
        time_elapsed > self.policy.expires_after
    }

    fn is_locked_out(&self, attempts: u32) -> bool {
        attempts >= self.policy.max_attempts
    }

    fn key(&self, ip: IpAddr, user: &str) -> FailedLoginsKey {
        match self.policy.block_by {
            FailedLoginsBlock::UserAndIp => FailedLoginsKey {
                ip: Some(ip),
                username: Some(user.to_string()),
            },
            FailedLoginsBlock::Ip => FailedLoginsKey { ip: Some(ip), username: None },
            FailedLoginsBlock::User => FailedLoginsKey {
                ip: None,
                username: Some(user.to_string()),
            },
        }
    }

    /// Upon failed login: increments the failed attempts counter, returns the lock status if the
    /// client is locked out.
    pub(crate) async fn failed(&self, ip: IpAddr, user: &str) -> Option<LockState> {
        let key = self.key(ip, user);
        let map = self.failed_logins.read().await;
        let attempts = match map.get(&key) {
            Some(entry) => {
                let mut entry = entry.lock().await;
                // Expired entries start counting from scratch
                if self.is_expired(entry.time_elapsed()) {
                    entry.attempts = 1;
                } else {
                    entry.attempts += 1;
                }
                entry.touch();
                entry.attempts
            }
            None => {
                drop(map);
                let mut map = self.failed_logins.write().await;
                map.entry(key).or_insert_with(FailedLoginsEntry::new);
                1
            }
        };

        match attempts {
            a if a == self.policy.max_attempts => Some(LockState::MaxFailuresReached),
            a if a > self.policy.max_attempts => Some(LockState::AlreadyLocked),
            _ => None,
        }
    }

    /// Tells whether the client is currently locked out, without changing anything.
    pub(crate) async fn is_locked(&self, ip: IpAddr, user: &str) -> bool {
        let map = self.failed_logins.read().await;
        match map.get(&self.key(ip, user)) {
            Some(entry) => {
                let entry = entry.lock().await;
                !self.is_expired(entry.time_elapsed()) && self.is_locked_out(entry.attempts)
            }
            None => false,
        }
    }

    /// Upon successful login: returns the lock state if the client is still locked out, otherwise
    /// forgets its failed attempts.
    pub(crate) async fn success(&self, ip: IpAddr, user: &str) -> Option<LockState> {
        if self.is_locked(ip, user).await {
            return Some(LockState::AlreadyLocked);
        }
        self.failed_logins.write().await.remove(&self.key(ip, user));
        None
    }

    /// Periodically sweeps expired entries until shutdown is signalled.
    pub(crate) async fn sweeper(&self, logger: Logger, shutdown_topic: Arc<shutdown::Notifier>) {
        let mut shutdown_listener = shutdown_topic.subscribe().await;
        let interval = Duration::from_secs(10);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let map = self.failed_logins.read().await;
                    let mut expired_entries: Vec<FailedLoginsKey> = Vec::new();
                    for (key, entry) in map.iter() {
                        let entry = entry.lock().await;
                        if self.is_expired(entry.time_elapsed()) {
                            expired_entries.push(key.clone());
                        }
                    }
                    drop(map);
                    if !expired_entries.is_empty() {
                        let mut map = self.failed_logins.write().await;
                        for key in expired_entries {
                            slog::debug!(logger, "Failed logins entry expired: {:?}", key);
                            map.remove(&key);
                        }
                    }
                }
                _ = shutdown_listener.listen() => {
                    slog::info!(logger, "Failed logins sweeper received shutdown signal.");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.failed_logins.read().await.len()
    }
}
