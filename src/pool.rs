//! Connection pooling for a single server.
//!
//! Every pool is bounded by `max_size` live connections, counting both idle
//! connections and those checked out. Callers that find the pool full queue
//! up in FIFO order on the pool's condition variable until a connection is
//! returned, a slot frees up, or their wait-queue deadline passes.
//!
//! The pool carries a generation counter. `invalidate` bumps it, closes the
//! idle set immediately and marks every checked-out connection stale, so
//! those are closed instead of reused when they come back.
use cancel::{CancellationToken, Wake};
use connstring::ServerAddress;
use error::Error::{self, PoolClosed, PoolWaitTimeout, WaitQueueFull};
use error::Result;
use event::{ClusterEvent, ConnectionClosedReason, Listener};
use options::ConnectionPoolSettings;
use stream::{Connector, Stream};

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Bookkeeping for one pooled connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub address: ServerAddress,
    pub created_at: Instant,
    pub last_used_at: Instant,
    /// The pool generation when the connection was opened.
    pub generation: u64,
}

/// A point-in-time view of a pool's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus checked-out connections, including ones being opened.
    pub total: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub generation: u64,
    /// Callers currently blocked in the wait queue.
    pub waiting: usize,
    /// Connections currently being opened for waiting callers.
    pub connecting: usize,
}

/// Handles threaded connections to a single server.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.address)
            .finish()
    }
}

struct PoolInner {
    address: ServerAddress,
    settings: ConnectionPoolSettings,
    connector: Arc<dyn Connector>,
    listener: Arc<Listener>,
    state: Mutex<Pool>,
    // Waiters block here until the pool is repopulated, a slot frees up
    // or the queue ahead of them moves.
    wait_lock: Condvar,
}

struct IdleConnection {
    info: ConnectionInfo,
    stream: Box<dyn Stream>,
}

struct Pool {
    idle: Vec<IdleConnection>,
    // Live connections: idle, checked out, or being opened.
    total: usize,
    // Connections being opened by callers, bounded by `max_connecting`.
    connecting: usize,
    generation: u64,
    next_id: u64,
    // FIFO wait queue of tickets. Only the ticket at the front may take
    // a connection or a free slot.
    waiters: VecDeque<u64>,
    next_ticket: u64,
    closed: bool,
}

impl Pool {
    fn leave_queue(&mut self, ticket: Option<u64>) {
        if let Some(t) = ticket {
            self.waiters.retain(|&w| w != t);
        }
    }

    fn checked_out(&self) -> usize {
        self.total - self.idle.len()
    }
}

// What a caller at the front of the queue can do right now.
enum Checkout {
    Ready(IdleConnection),
    Open { id: u64, generation: u64 },
    Wait,
}

/// Holds a checked-out connection, returning it to the pool when dropped.
pub struct PooledConnection {
    info: ConnectionInfo,
    stream: Box<dyn Stream>,
    pool: Arc<PoolInner>,
    discard: bool,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("info", &self.info)
            .field("discard", &self.discard)
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.info.address
    }

    pub fn generation(&self) -> u64 {
        self.info.generation
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Returns the underlying stream.
    pub fn stream(&mut self) -> &mut dyn Stream {
        self.info.last_used_at = Instant::now();
        &mut *self.stream
    }

    /// Marks the connection as broken so it is closed instead of reused.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Whether the connection predates the pool's current generation.
    pub fn is_stale(&self) -> bool {
        self.pool.lock_state()
            .map(|state| state.generation != self.info.generation)
            .unwrap_or(true)
    }
}

impl Read for PooledConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.stream().read(buf);
        if result.is_err() {
            self.discard = true;
        }
        result
    }
}

impl Write for PooledConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.stream().write(buf);
        if result.is_err() {
            self.discard = true;
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.stream().flush();
        if result.is_err() {
            self.discard = true;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let stream = mem::replace(&mut self.stream, Box::new(io::Cursor::new(Vec::new())));
        let info = self.info.clone();
        self.pool.check_in(info, stream, self.discard);
    }
}

impl Wake for PoolInner {
    fn wake(&self) {
        let _guard = self.state.lock();
        self.wait_lock.notify_all();
    }
}

impl PoolInner {
    fn lock_state(&self) -> Result<MutexGuard<Pool>> {
        Ok(self.state.lock()?)
    }

    fn expiry(&self, info: &ConnectionInfo, generation: u64, now: Instant)
              -> Option<ConnectionClosedReason> {
        if info.generation != generation {
            Some(ConnectionClosedReason::Stale)
        } else if now.duration_since(info.created_at) > self.settings.max_life_time {
            Some(ConnectionClosedReason::LifeTimeExpired)
        } else if now.duration_since(info.last_used_at) > self.settings.max_idle_time {
            Some(ConnectionClosedReason::Idle)
        } else {
            None
        }
    }

    fn close_connection(&self, info: &ConnectionInfo, stream: Box<dyn Stream>,
                        reason: ConnectionClosedReason) {
        debug!(address = %self.address, connection_id = info.id, ?reason, "closing connection");
        self.connector.close(&self.address, stream);
        self.listener.emit(ClusterEvent::ConnectionClosed {
            address: self.address.clone(),
            connection_id: info.id,
            reason: reason,
        });
    }

    fn check_in(&self, mut info: ConnectionInfo, stream: Box<dyn Stream>, discard: bool) {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            // A poisoned pool can't track the slot anymore; just close.
            Err(_) => {
                self.close_connection(&info, stream, ConnectionClosedReason::PoolClosed);
                return;
            }
        };

        let reason = if state.closed {
            Some(ConnectionClosedReason::PoolClosed)
        } else if discard {
            Some(ConnectionClosedReason::Error)
        } else {
            self.expiry(&info, state.generation, now)
        };

        match reason {
            Some(reason) => {
                state.total -= 1;
                self.wait_lock.notify_all();
                drop(state);
                self.close_connection(&info, stream, reason);
            }
            None => {
                info.last_used_at = now;
                state.idle.push(IdleConnection { info: info, stream: stream });
                // Notify waiting threads that the pool has been repopulated.
                self.wait_lock.notify_all();
            }
        }
    }
}

impl ConnectionPool {
    /// Returns a pool for the address using the given settings.
    pub fn new(address: ServerAddress, settings: ConnectionPoolSettings,
               connector: Arc<dyn Connector>, listener: Arc<Listener>) -> Result<ConnectionPool> {
        settings.validate()?;
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                address: address,
                settings: settings,
                connector: connector,
                listener: listener,
                wait_lock: Condvar::new(),
                state: Mutex::new(Pool {
                    idle: Vec::new(),
                    total: 0,
                    connecting: 0,
                    generation: 0,
                    next_id: 1,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                    closed: false,
                }),
            }),
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn settings(&self) -> &ConnectionPoolSettings {
        &self.inner.settings
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.inner.lock_state()?.generation)
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let state = self.inner.lock_state()?;
        Ok(PoolStats {
            total: state.total,
            idle: state.idle.len(),
            checked_out: state.checked_out(),
            generation: state.generation,
            waiting: state.waiters.len(),
            connecting: state.connecting,
        })
    }

    /// Checks out a connection, waiting at most the configured wait-queue
    /// timeout.
    pub fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_with(None, None)
    }

    /// Checks out a connection. An idle connection from the current
    /// generation is reused first; otherwise a new one is opened if the pool
    /// has room. A full pool queues the caller, failing immediately when the
    /// wait queue is itself full. A timeout too large to represent as a
    /// deadline waits without one.
    pub fn acquire_with(&self, timeout: Option<Duration>,
                        cancel: Option<&CancellationToken>) -> Result<PooledConnection> {
        let timeout = timeout.unwrap_or(self.inner.settings.wait_queue_timeout);
        let deadline = Instant::now().checked_add(timeout);

        if let Some(token) = cancel {
            let waker: Weak<dyn Wake> = Arc::downgrade(&self.inner) as Weak<dyn Wake>;
            token.register(waker);
        }

        let mut ticket = None;
        let mut state = self.inner.lock_state()?;
        loop {
            let mut to_close = Vec::new();
            let step = self.next_step(&mut state, ticket, &mut to_close);

            match step {
                Checkout::Ready(idle) => {
                    state.leave_queue(ticket);
                    if !state.waiters.is_empty() {
                        self.inner.wait_lock.notify_all();
                    }
                    drop(state);
                    self.close_all(to_close);
                    return Ok(self.wrap(idle.info, idle.stream));
                }
                Checkout::Open { id, generation } => {
                    state.leave_queue(ticket);
                    drop(state);
                    self.close_all(to_close);

                    match self.open(id, generation)? {
                        Some(connection) => return Ok(connection),
                        // The pool was cleared while connecting; start over
                        // at the back of the queue.
                        None => {
                            ticket = None;
                            state = self.inner.lock_state()?;
                            continue;
                        }
                    }
                }
                Checkout::Wait => {
                    if !to_close.is_empty() {
                        drop(state);
                        self.close_all(to_close);
                        state = self.inner.lock_state()?;
                        continue;
                    }
                }
            }

            if state.closed {
                state.leave_queue(ticket);
                return Err(PoolClosed(self.inner.address.clone()));
            }

            if ticket.is_none() {
                if state.waiters.len() >= self.inner.settings.wait_queue_size {
                    warn!(address = %self.inner.address, waiting = state.waiters.len(),
                          "connection pool wait queue is full");
                    return Err(WaitQueueFull {
                        address: self.inner.address.clone(),
                        max_size: self.inner.settings.max_size,
                        wait_queue_size: self.inner.settings.wait_queue_size,
                    });
                }
                let t = state.next_ticket;
                state.next_ticket += 1;
                state.waiters.push_back(t);
                ticket = Some(t);
            }

            if cancel.map_or(false, |token| token.is_cancelled()) {
                state.leave_queue(ticket);
                self.inner.wait_lock.notify_all();
                return Err(Error::Cancelled);
            }

            let now = Instant::now();
            if deadline.map_or(false, |deadline| now >= deadline) {
                state.leave_queue(ticket);
                // Whoever is now at the front may be able to proceed.
                self.inner.wait_lock.notify_all();
                warn!(address = %self.inner.address, ?timeout, "timed out waiting for a connection");
                return Err(PoolWaitTimeout {
                    address: self.inner.address.clone(),
                    timeout: timeout,
                    total: state.total,
                    idle: state.idle.len(),
                    max_size: self.inner.settings.max_size,
                });
            }

            state = match deadline {
                Some(deadline) => self.inner.wait_lock.wait_timeout(state, deadline - now)?.0,
                None => self.inner.wait_lock.wait(state)?,
            };
        }
    }

    // Decides what the caller holding `ticket` may do. Expired idle
    // connections found along the way are moved into `to_close`.
    fn next_step(&self, state: &mut Pool, ticket: Option<u64>,
                 to_close: &mut Vec<(IdleConnection, ConnectionClosedReason)>) -> Checkout {
        if state.closed {
            return Checkout::Wait;
        }

        let at_front = match ticket {
            Some(t) => state.waiters.front() == Some(&t),
            None => state.waiters.is_empty(),
        };
        if !at_front {
            return Checkout::Wait;
        }

        let now = Instant::now();
        while let Some(mut idle) = state.idle.pop() {
            match self.inner.expiry(&idle.info, state.generation, now) {
                Some(reason) => {
                    state.total -= 1;
                    to_close.push((idle, reason));
                }
                None => {
                    idle.info.last_used_at = now;
                    return Checkout::Ready(idle);
                }
            }
        }

        if state.total < self.inner.settings.max_size &&
           state.connecting < self.inner.settings.max_connecting {
            state.total += 1;
            state.connecting += 1;
            let id = state.next_id;
            state.next_id += 1;
            return Checkout::Open { id: id, generation: state.generation };
        }

        Checkout::Wait
    }

    // Opens a connection for a reserved slot. Returns None when the pool was
    // cleared or closed in the meantime; the slot is released either way.
    // The connecting permit is always given back.
    fn open(&self, id: u64, generation: u64) -> Result<Option<PooledConnection>> {
        match self.inner.connector.connect(&self.inner.address) {
            Ok(stream) => {
                let now = Instant::now();
                let info = ConnectionInfo {
                    id: id,
                    address: self.inner.address.clone(),
                    created_at: now,
                    last_used_at: now,
                    generation: generation,
                };

                let current = {
                    let mut state = self.inner.lock_state()?;
                    state.connecting -= 1;
                    self.inner.wait_lock.notify_all();
                    if state.closed || state.generation != generation {
                        state.total -= 1;
                        false
                    } else {
                        true
                    }
                };

                if !current {
                    self.inner.close_connection(&info, stream, ConnectionClosedReason::Stale);
                    return Ok(None);
                }

                debug!(address = %self.inner.address, connection_id = id, "opened connection");
                self.inner.listener.emit(ClusterEvent::ConnectionCreated {
                    address: self.inner.address.clone(),
                    connection_id: id,
                });
                Ok(Some(self.wrap(info, stream)))
            }
            Err(err) => {
                if let Ok(mut state) = self.inner.state.lock() {
                    state.total -= 1;
                    state.connecting -= 1;
                }
                self.inner.wait_lock.notify_all();
                warn!(address = %self.inner.address, error = %err, "failed to open connection");
                Err(err)
            }
        }
    }

    fn wrap(&self, info: ConnectionInfo, stream: Box<dyn Stream>) -> PooledConnection {
        PooledConnection {
            info: info,
            stream: stream,
            pool: self.inner.clone(),
            discard: false,
        }
    }

    fn close_all(&self, connections: Vec<(IdleConnection, ConnectionClosedReason)>) {
        for (idle, reason) in connections {
            self.inner.close_connection(&idle.info, idle.stream, reason);
        }
    }

    /// Returns a connection to the pool. Stale, expired or discarded
    /// connections are closed instead of being kept idle.
    pub fn release(&self, connection: PooledConnection) {
        debug_assert_eq!(connection.address(), self.address());
        drop(connection);
    }

    /// Bumps the pool generation and closes every idle connection.
    /// Checked-out connections are closed when they are released. Returns
    /// the new generation.
    pub fn invalidate(&self) -> Result<u64> {
        let (generation, idle) = {
            let mut state = self.inner.lock_state()?;
            state.generation += 1;
            let idle = mem::replace(&mut state.idle, Vec::new());
            state.total -= idle.len();
            self.inner.wait_lock.notify_all();
            (state.generation, idle)
        };

        info!(address = %self.inner.address, generation, closed = idle.len(), "connection pool cleared");
        for conn in idle {
            self.inner.close_connection(&conn.info, conn.stream, ConnectionClosedReason::Stale);
        }
        self.inner.listener.emit(ClusterEvent::PoolCleared {
            address: self.inner.address.clone(),
            generation: generation,
        });
        Ok(generation)
    }

    /// Closes idle connections past their idle or life time, then opens
    /// connections until the pool holds at least `min_size`. Maintenance
    /// opens one connection at a time, so it stays within `max_connecting`.
    pub fn perform_maintenance(&self) -> Result<()> {
        let now = Instant::now();
        let (expired, reserved, generation) = {
            let mut state = self.inner.lock_state()?;
            if state.closed {
                return Ok(());
            }

            let generation = state.generation;
            let (keep, expired): (Vec<_>, Vec<_>) = mem::replace(&mut state.idle, Vec::new())
                .into_iter()
                .map(|idle| {
                    let reason = self.inner.expiry(&idle.info, generation, now);
                    (idle, reason)
                })
                .partition(|&(_, ref reason)| reason.is_none());
            state.idle = keep.into_iter().map(|(idle, _)| idle).collect();
            state.total -= expired.len();

            let reserved = self.inner.settings.min_size.saturating_sub(state.total);
            state.total += reserved;
            let ids = (0..reserved).map(|i| state.next_id + i as u64).collect::<Vec<_>>();
            state.next_id += reserved as u64;
            (expired, ids, generation)
        };

        for (idle, reason) in expired {
            if let Some(reason) = reason {
                self.inner.close_connection(&idle.info, idle.stream, reason);
            }
        }

        let mut ids = reserved.into_iter();
        while let Some(id) = ids.next() {
            match self.inner.connector.connect(&self.inner.address) {
                Ok(stream) => {
                    let now = Instant::now();
                    let info = ConnectionInfo {
                        id: id,
                        address: self.inner.address.clone(),
                        created_at: now,
                        last_used_at: now,
                        generation: generation,
                    };
                    let mut state = self.inner.lock_state()?;
                    if state.closed || state.generation != generation {
                        state.total -= 1 + ids.len();
                        drop(state);
                        self.inner.close_connection(&info, stream, ConnectionClosedReason::Stale);
                        break;
                    }
                    state.idle.push(IdleConnection { info: info, stream: stream });
                    self.inner.wait_lock.notify_all();
                    drop(state);
                    self.inner.listener.emit(ClusterEvent::ConnectionCreated {
                        address: self.inner.address.clone(),
                        connection_id: id,
                    });
                }
                Err(err) => {
                    warn!(address = %self.inner.address, error = %err,
                          "failed to populate connection pool");
                    let mut state = self.inner.lock_state()?;
                    state.total -= 1 + ids.len();
                    self.inner.wait_lock.notify_all();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Closes the pool. Idle connections are closed now; checked-out ones
    /// when they are released. Waiters fail with `PoolClosed`.
    pub fn close(&self) {
        let idle = match self.inner.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                let idle = mem::replace(&mut state.idle, Vec::new());
                state.total -= idle.len();
                self.inner.wait_lock.notify_all();
                idle
            }
            Err(_) => return,
        };
        for conn in idle {
            self.inner.close_connection(&conn.info, conn.stream, ConnectionClosedReason::PoolClosed);
        }
    }
}
