//! Connection pool shared by every driver of a runtime.
//!
//! Allocation order for `acquire(driver)`:
//!
//! 1. reuse an idle connection of that driver,
//! 2. create one if both the global and the per-driver ceilings allow it,
//! 3. otherwise wait in the queue until a release makes room, or time out.
//!
//! All accounting happens under one lock that is never held across an
//! `.await`. Creating a connection is split in two: capacity is reserved
//! under the lock, the connector runs unlocked, and the reservation is
//! committed (or given back) under the lock again. Two interleaved acquires
//! can therefore never both pass the limit check for the same slot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::connection::{Connection, Connector, NoopConnector};
use super::stats::{DriverStats, PoolLimits, PoolStats};
use crate::error::{Error, Result};

/// How long a queued acquire waits before failing with `PoolLimitReached`.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

struct Shared {
    state: Mutex<PoolState>,
    connector: Arc<dyn Connector>,
    acquire_timeout: Duration,
}

#[derive(Default)]
struct DriverAccount {
    /// Open connections plus reserved slots.
    allocated: usize,
    idle: VecDeque<u64>,
}

struct Waiter {
    id: u64,
    driver: String,
    tx: oneshot::Sender<Result<Grant>>,
}

/// What a waiter or a fast-path acquire is handed.
enum Grant {
    Reused(PooledConnection),
    Reserved(Reservation),
}

enum Step {
    Ready(Grant),
    Wait {
        id: u64,
        rx: oneshot::Receiver<Result<Grant>>,
    },
    Reject,
}

struct PoolState {
    limits: PoolLimits,
    next_id: u64,
    total: usize,
    connections: HashMap<u64, Connection>,
    drivers: HashMap<String, DriverAccount>,
    /// Reserved slots whose connection is being opened, by reservation id.
    opening: HashMap<u64, String>,
    waiters: VecDeque<Waiter>,
}

impl PoolState {
    fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            next_id: 1,
            total: 0,
            connections: HashMap::new(),
            drivers: HashMap::new(),
            opening: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocated(&self, driver: &str) -> usize {
        self.drivers.get(driver).map_or(0, |a| a.allocated)
    }

    fn has_idle(&self, driver: &str) -> bool {
        self.drivers.get(driver).is_some_and(|a| !a.idle.is_empty())
    }

    fn can_create(&self, driver: &str) -> bool {
        self.total < self.limits.total && self.allocated(driver) < self.limits.per_driver
    }

    fn can_serve(&self, driver: &str) -> bool {
        self.has_idle(driver) || self.can_create(driver)
    }

    fn allocate(&mut self, shared: &Arc<Shared>, driver: &str) -> Step {
        if let Some(grant) = self.try_grant(shared, driver) {
            return Step::Ready(grant);
        }
        if self.limits.is_hard_zero() {
            return Step::Reject;
        }
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter {
            id,
            driver: driver.to_string(),
            tx,
        });
        debug!(driver, waiting = self.waiters.len(), "acquire queued");
        Step::Wait { id, rx }
    }

    fn try_grant(&mut self, shared: &Arc<Shared>, driver: &str) -> Option<Grant> {
        if let Some(id) = self.drivers.get_mut(driver).and_then(|a| a.idle.pop_front()) {
            let conn = self.connections.get_mut(&id)?;
            conn.mark_in_use();
            debug!(driver, connection = id, "reusing idle connection");
            return Some(Grant::Reused(PooledConnection::new(shared, conn.clone())));
        }
        if self.can_create(driver) {
            let token = self.next_id();
            self.total += 1;
            self.drivers.entry(driver.to_string()).or_default().allocated += 1;
            self.opening.insert(token, driver.to_string());
            debug!(driver, total = self.total, "reserved slot for new connection");
            return Some(Grant::Reserved(Reservation::new(shared, token, driver)));
        }
        None
    }

    /// Hand capacity to the first waiter that can use it. Serves at most one.
    fn service_one(&mut self, shared: &Arc<Shared>) -> bool {
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].tx.is_closed() {
                self.waiters.remove(i);
                continue;
            }
            if !self.can_serve(&self.waiters[i].driver) {
                i += 1;
                continue;
            }
            let Some(waiter) = self.waiters.remove(i) else {
                break;
            };
            let Some(grant) = self.try_grant(shared, &waiter.driver) else {
                self.waiters.insert(i, waiter);
                i += 1;
                continue;
            };
            match waiter.tx.send(Ok(grant)) {
                Ok(()) => {
                    debug!(driver = %waiter.driver, waiter = waiter.id, "served queued acquire");
                    return true;
                }
                // The waiter gave up between the check and the send.
                Err(returned) => self.undo(returned),
            }
        }
        false
    }

    fn drain_waiters(&mut self, shared: &Arc<Shared>) {
        while self.service_one(shared) {}
    }

    fn undo(&mut self, returned: Result<Grant>) {
        match returned {
            Ok(Grant::Reused(lease)) => {
                let id = lease.disarm();
                self.return_idle(id);
            }
            Ok(Grant::Reserved(reservation)) => {
                let (token, _) = reservation.disarm();
                self.cancel_reservation(token);
            }
            Err(_) => {}
        }
    }

    fn return_idle(&mut self, id: u64) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if conn.in_use {
            conn.mark_idle();
            self.drivers
                .entry(conn.driver.clone())
                .or_default()
                .idle
                .push_back(id);
        }
        true
    }

    fn release(&mut self, shared: &Arc<Shared>, id: u64) {
        if self.return_idle(id) {
            debug!(connection = id, "connection released");
            self.service_one(shared);
        } else {
            debug!(connection = id, "released connection was already closed");
        }
    }

    fn cancel_reservation(&mut self, token: u64) -> bool {
        let Some(driver) = self.opening.remove(&token) else {
            return false;
        };
        self.total = self.total.saturating_sub(1);
        if let Some(account) = self.drivers.get_mut(&driver) {
            account.allocated = account.allocated.saturating_sub(1);
        }
        true
    }

    fn commit(&mut self, shared: &Arc<Shared>, reservation: Reservation) -> Result<PooledConnection> {
        let (token, driver) = reservation.disarm();
        if self.opening.remove(&token).is_none() {
            return Err(Error::DriverClosed { driver });
        }
        let conn = Connection::new(token, &driver);
        self.connections.insert(token, conn.clone());
        debug!(driver = %driver, connection = token, total = self.total, "opened connection");
        Ok(PooledConnection::new(shared, conn))
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    fn close_driver(&mut self, shared: &Arc<Shared>, driver: &str) -> usize {
        let account = self.drivers.remove(driver);
        let before = self.connections.len();
        self.connections.retain(|_, c| c.driver != driver);
        let closed = before - self.connections.len();
        self.opening.retain(|_, d| d.as_str() != driver);
        if let Some(account) = account {
            self.total = self.total.saturating_sub(account.allocated);
        }

        // Waiters for the closed driver fail now rather than at their deadline.
        for waiter in std::mem::take(&mut self.waiters) {
            if waiter.driver == driver {
                let _ = waiter.tx.send(Err(Error::DriverClosed {
                    driver: driver.to_string(),
                }));
            } else {
                self.waiters.push_back(waiter);
            }
        }

        debug!(driver, closed, total = self.total, "closed driver connections");
        self.drain_waiters(shared);
        closed
    }

    fn close_all(&mut self, shared: &Arc<Shared>) -> usize {
        for waiter in std::mem::take(&mut self.waiters) {
            let driver = waiter.driver;
            let _ = waiter.tx.send(Err(Error::DriverClosed { driver }));
        }
        let drivers: Vec<String> = self.drivers.keys().cloned().collect();
        drivers
            .iter()
            .map(|driver| self.close_driver(shared, driver))
            .sum()
    }

    fn stats(&self) -> PoolStats {
        let mut drivers: BTreeMap<String, DriverStats> = BTreeMap::new();
        for (name, account) in &self.drivers {
            drivers.entry(name.clone()).or_default().idle = account.idle.len();
        }
        for conn in self.connections.values().filter(|c| c.in_use) {
            drivers.entry(conn.driver.clone()).or_default().active += 1;
        }
        for driver in self.opening.values() {
            drivers.entry(driver.clone()).or_default().opening += 1;
        }
        PoolStats {
            total: self.total,
            limits: self.limits,
            drivers,
            waiting: self.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
        }
    }
}

/// A connection leased from the pool. Dropping it returns the connection.
pub struct PooledConnection {
    pool: Option<Arc<Shared>>,
    conn: Connection,
}

impl PooledConnection {
    fn new(shared: &Arc<Shared>, conn: Connection) -> Self {
        Self {
            pool: Some(Arc::clone(shared)),
            conn,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Detach from the pool without releasing. Only used under the pool lock.
    fn disarm(mut self) -> u64 {
        self.pool = None;
        self.conn.id
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.id)
            .field("driver", &self.conn.driver)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(shared) = self.pool.take() {
            shared.state.lock().release(&shared, self.conn.id);
        }
    }
}

/// Capacity reserved for a connection that is being opened. Dropping it
/// before commit gives the capacity back.
struct Reservation {
    pool: Option<Arc<Shared>>,
    token: u64,
    driver: String,
}

impl Reservation {
    fn new(shared: &Arc<Shared>, token: u64, driver: &str) -> Self {
        Self {
            pool: Some(Arc::clone(shared)),
            token,
            driver: driver.to_string(),
        }
    }

    fn disarm(mut self) -> (u64, String) {
        self.pool = None;
        (self.token, std::mem::take(&mut self.driver))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(shared) = self.pool.take() {
            let mut state = shared.state.lock();
            if state.cancel_reservation(self.token) {
                state.service_one(&shared);
            }
        }
    }
}

/// Bounded pool of logical connections keyed by driver name.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self::with_connector(limits, Arc::new(NoopConnector), DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn with_connector(
        limits: PoolLimits,
        connector: Arc<dyn Connector>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::new(limits)),
                connector,
                acquire_timeout,
            }),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.shared.acquire_timeout
    }

    /// Lease a connection for `driver`, waiting for capacity if needed.
    ///
    /// Fails with `PoolLimitReached` right away when a limit is zero, or once
    /// the acquire timeout elapses in the queue.
    pub async fn acquire(&self, driver: &str) -> Result<PooledConnection> {
        let step = self.shared.state.lock().allocate(&self.shared, driver);
        let grant = match step {
            Step::Ready(grant) => grant,
            Step::Wait { id, rx } => self.wait(driver, id, rx).await?,
            Step::Reject => {
                warn!(driver, "pool limit is zero, rejecting acquire");
                return Err(Error::PoolLimitReached {
                    driver: driver.to_string(),
                });
            }
        };
        match grant {
            Grant::Reused(lease) => Ok(lease),
            Grant::Reserved(reservation) => self.open(reservation).await,
        }
    }

    async fn wait(
        &self,
        driver: &str,
        id: u64,
        mut rx: oneshot::Receiver<Result<Grant>>,
    ) -> Result<Grant> {
        let closed = || Error::DriverClosed {
            driver: driver.to_string(),
        };
        tokio::select! {
            biased;
            received = &mut rx => return received.unwrap_or_else(|_| Err(closed())),
            _ = tokio::time::sleep(self.shared.acquire_timeout) => {}
        }

        let timed_out = self.shared.state.lock().remove_waiter(id);
        if timed_out {
            warn!(
                driver,
                timeout_ms = self.shared.acquire_timeout.as_millis() as u64,
                "timed out waiting for a connection"
            );
            return Err(Error::PoolLimitReached {
                driver: driver.to_string(),
            });
        }
        // Served between the deadline and taking the lock; the grant is in
        // the channel already.
        rx.await.unwrap_or_else(|_| Err(closed()))
    }

    async fn open(&self, reservation: Reservation) -> Result<PooledConnection> {
        let driver = reservation.driver.clone();
        if let Err(cause) = self.shared.connector.open(&driver).await {
            drop(reservation);
            warn!(driver = %driver, error = %cause, "failed to open connection");
            return Err(Error::ConnectFailed { driver, cause });
        }
        self.shared.state.lock().commit(&self.shared, reservation)
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: PooledConnection) {
        drop(lease);
    }

    /// Discard every connection of `driver`, idle or leased, and reset its
    /// accounting. Queued acquires for `driver` fail with `DriverClosed`;
    /// queued acquires for other drivers are retried.
    pub fn close_driver(&self, driver: &str) -> usize {
        self.shared.state.lock().close_driver(&self.shared, driver)
    }

    /// Close every driver and fail every queued acquire.
    pub fn close_all(&self) -> usize {
        self.shared.state.lock().close_all(&self.shared)
    }

    pub fn limits(&self) -> PoolLimits {
        self.shared.state.lock().limits
    }

    /// Replace the limits. Existing connections are kept even when they now
    /// exceed a ceiling; raised ceilings are offered to queued acquires.
    pub fn set_limits(&self, limits: PoolLimits) {
        let mut state = self.shared.state.lock();
        state.limits = limits;
        debug!(total = limits.total, per_driver = limits.per_driver, "pool limits updated");
        state.drain_waiters(&self.shared);
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.state.lock().stats()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}
