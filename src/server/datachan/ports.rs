//! The passive port pool.
//!
//! A listener owns one [`PassivePortPool`] which hands out ports from a configured [`PortSet`] to
//! the sessions doing `PASV`. A port is handed out as a [`PortReservation`] guard and returns to
//! the pool when the guard is dropped, which happens when the pending passive listener or the
//! data connection that owns it goes away.

use crate::server::error::ConfigError;

use slog::Logger;
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A set of TCP ports given as comma separated ports and ranges, for example `2300`,
/// `2300-2399`, `2300-` (up to 65535) or `2300, 2305, 2400-`. Semicolons are accepted as
/// separators too.
///
/// Ranges are kept as ranges, so an open range does not cost memory per port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSet {
    // sorted, non-overlapping and non-adjacent
    ranges: Vec<RangeInclusive<u16>>,
    open_ended: bool,
}

impl PortSet {
    /// Parses a port range string.
    pub fn parse(spec: &str) -> Result<PortSet, ConfigError> {
        if spec.trim().is_empty() {
            return Err(ConfigError::port_range(spec, "no ports given"));
        }
        let mut ranges = Vec::new();
        let mut open_ended = false;
        for token in spec.split([',', ';']).map(str::trim) {
            if token.is_empty() {
                return Err(ConfigError::port_range(spec, "empty element"));
            }
            let range = match token.split_once('-') {
                None => {
                    let port = parse_port(spec, token)?;
                    port..=port
                }
                Some((start, end)) => {
                    let start = parse_port(spec, start.trim())?;
                    let end = match end.trim() {
                        "" => {
                            open_ended = true;
                            u16::MAX
                        }
                        end => parse_port(spec, end)?,
                    };
                    if start > end {
                        return Err(ConfigError::port_range(spec, format!("range {token} runs backwards")));
                    }
                    start..=end
                }
            };
            ranges.push(range);
        }
        Ok(PortSet {
            ranges: normalize(ranges),
            open_ended,
        })
    }

    /// Tells whether `port` is part of this set.
    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&port))
    }

    /// The number of ports in the set.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| usize::from(*r.end() - *r.start()) + 1).sum()
    }

    /// A port set is never empty once parsed; this exists for completeness.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Tells whether the set was given with an open range such as `2300-`.
    pub fn is_open_ended(&self) -> bool {
        self.open_ended
    }

    /// The lowest port in the set that is greater than or equal to `port`.
    pub fn first_at_or_after(&self, port: u16) -> Option<u16> {
        self.ranges.iter().find(|r| *r.end() >= port).map(|r| port.max(*r.start()))
    }

    /// The `n`th lowest port of the set, counting from zero.
    pub fn nth(&self, mut n: usize) -> Option<u16> {
        for r in &self.ranges {
            let len = usize::from(*r.end() - *r.start()) + 1;
            if n < len {
                return u16::try_from(n).ok().map(|offset| *r.start() + offset);
            }
            n -= len;
        }
        None
    }

    /// Iterates over all ports in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.ranges.iter().flat_map(|r| r.clone())
    }

    /// Iterates in ascending order over the ports that are greater than or equal to `from`.
    pub fn iter_from(&self, from: u16) -> impl Iterator<Item = u16> + '_ {
        self.ranges.iter().filter(move |r| *r.end() >= from).flat_map(move |r| from.max(*r.start())..=*r.end())
    }
}

impl FromStr for PortSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortSet::parse(s)
    }
}

impl Display for PortSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let last = self.ranges.len().saturating_sub(1);
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if i == last && self.open_ended && *r.end() == u16::MAX {
                write!(f, "{}-", r.start())?;
            } else if r.start() == r.end() {
                write!(f, "{}", r.start())?;
            } else {
                write!(f, "{}-{}", r.start(), r.end())?;
            }
        }
        Ok(())
    }
}

fn parse_port(spec: &str, token: &str) -> Result<u16, ConfigError> {
    let port: u32 = token
        .parse()
        .map_err(|_| ConfigError::port_range(spec, format!("'{token}' is not a port number")))?;
    match u16::try_from(port) {
        Ok(0) => Err(ConfigError::port_range(spec, "port 0 cannot be reserved")),
        Ok(port) => Ok(port),
        Err(_) => Err(ConfigError::port_range(spec, format!("{port} is larger than 65535"))),
    }
}

fn normalize(mut ranges: Vec<RangeInclusive<u16>>) -> Vec<RangeInclusive<u16>> {
    ranges.sort_by_key(|r| *r.start());
    let mut merged: Vec<RangeInclusive<u16>> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if u32::from(*r.start()) <= u32::from(*last.end()) + 1 => {
                if r.end() > last.end() {
                    *last = *last.start()..=*r.end();
                }
            }
            _ => merged.push(r),
        }
    }
    merged
}

/// Hands out passive ports to sessions, at most once at a time per port.
///
/// All bookkeeping happens under a single mutex that is never held across an await point.
/// Sessions that find the pool exhausted may wait, bounded, for a release through
/// [`reserve_with_wait`](PassivePortPool::reserve_with_wait).
///
/// A pool built with [`any_port`](PassivePortPool::any_port) tracks nothing: its reservations
/// carry port 0 and the operating system picks the port when binding.
#[derive(Debug)]
pub struct PassivePortPool {
    allowed: Option<PortSet>,
    randomize: bool,
    reserved: Mutex<BTreeSet<u16>>,
    released: Notify,
    logger: Logger,
}

impl PassivePortPool {
    /// Creates a pool handing out the ports in `allowed`. With `randomize` the search for a free
    /// port starts at a random position, otherwise the lowest free port is handed out.
    pub fn new(allowed: PortSet, randomize: bool, logger: Logger) -> Arc<PassivePortPool> {
        Arc::new(PassivePortPool {
            allowed: Some(allowed),
            randomize,
            reserved: Mutex::new(BTreeSet::new()),
            released: Notify::new(),
            logger,
        })
    }

    /// Creates a pool that lets the operating system choose an ephemeral port for every passive
    /// listener.
    pub fn any_port(logger: Logger) -> Arc<PassivePortPool> {
        Arc::new(PassivePortPool {
            allowed: None,
            randomize: false,
            reserved: Mutex::new(BTreeSet::new()),
            released: Notify::new(),
            logger,
        })
    }

    /// The configured port set, `None` for an any-port pool.
    pub fn allowed(&self) -> Option<&PortSet> {
        self.allowed.as_ref()
    }

    /// Reserves a free port, or returns `None` when every port of the pool is reserved.
    pub fn reserve_next_port(self: &Arc<Self>) -> Option<PortReservation> {
        let Some(allowed) = &self.allowed else {
            return Some(PortReservation { port: 0, pool: None });
        };
        let mut reserved = self.lock();
        if reserved.len() >= allowed.len() {
            return None;
        }
        let start = if self.randomize {
            allowed.nth(random_index(allowed.len())).unwrap_or(0)
        } else {
            0
        };
        let port = allowed.iter_from(start).chain(allowed.iter()).find(|p| !reserved.contains(p))?;
        reserved.insert(port);
        slog::debug!(self.logger, "Reserved passive port"; "port" => port, "in_use" => reserved.len());
        Some(PortReservation {
            port,
            pool: Some(Arc::clone(self)),
        })
    }

    /// Like [`reserve_next_port`](PassivePortPool::reserve_next_port) but when the pool is
    /// exhausted, waits for releases until `wait` has passed.
    pub async fn reserve_with_wait(self: &Arc<Self>, wait: Duration) -> Option<PortReservation> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking so that a release in between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reservation) = self.reserve_next_port() {
                return Some(reservation);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                slog::warn!(self.logger, "No passive port became available"; "waited_ms" => wait.as_millis() as u64);
                return None;
            }
        }
    }

    /// Returns a port to the pool and wakes up one waiting session. Releasing a port that is not
    /// reserved only logs a warning.
    pub fn release_port(&self, port: u16) {
        if self.allowed.is_none() {
            return;
        }
        let removed = self.lock().remove(&port);
        if removed {
            slog::debug!(self.logger, "Released passive port"; "port" => port);
            self.released.notify_one();
        } else {
            slog::warn!(self.logger, "Releasing passive port that was not reserved"; "port" => port);
        }
    }

    /// The number of ports currently reserved.
    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }

    /// The number of ports that can still be reserved. `None` for an any-port pool.
    pub fn available(&self) -> Option<usize> {
        let allowed = self.allowed.as_ref()?;
        Some(allowed.len() - self.lock().len())
    }

    /// Tells whether `port` is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        // The set stays consistent even if a holder panicked: every mutation is a single call.
        self.reserved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn random_index(len: usize) -> usize {
    let mut data = [0; 8];
    match getrandom::fill(&mut data) {
        Ok(()) => (u64::from_ne_bytes(data) % len as u64) as usize,
        Err(_) => 0,
    }
}

/// A port taken from a [`PassivePortPool`]. The port goes back to the pool when this is dropped.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    pool: Option<Arc<PassivePortPool>>,
}

impl PortReservation {
    /// The reserved port. 0 when taken from an any-port pool.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_port(self.port);
        }
    }
}
