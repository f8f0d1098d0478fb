//! Request scopes pin a sequence of operations to one server.
//!
//! A scope is begun with either a read preference or an explicit server.
//! While it is active every operation issued through it runs against the
//! pinned server and, unless the scope pins the server only, on the same
//! pooled connection. Scopes nest: an inner `begin` reuses the outer pin and
//! the pin is released only when the outermost guard ends.
//!
//! A scope belongs to a single thread of control. It is not `Sync`, and
//! re-entering it from inside `with_connection` is rejected.
use error::Error::InvalidPinning;
use error::Result;

use common::ReadPreference;
use connstring::ServerAddress;
use pool::PooledConnection;
use topology::{Cluster, SelectedServer};

use std::cell::{Cell, RefCell};
use std::fmt;

use tracing::debug;

struct Pin {
    server: SelectedServer,
    connection: Option<PooledConnection>,
}

/// Pins operations to one server, and optionally one connection.
pub struct RequestScope {
    cluster: Cluster,
    pin_connection: bool,
    nesting_level: Cell<usize>,
    pin: RefCell<Option<Pin>>,
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("nesting_level", &self.nesting_level.get())
            .field("pinned_address", &self.pinned_address())
            .finish()
    }
}

/// Ends one level of a request scope when dropped.
#[must_use = "the request ends as soon as the guard is dropped"]
pub struct RequestGuard<'a> {
    scope: &'a RequestScope,
    ended: bool,
}

impl<'a> RequestGuard<'a> {
    /// Ends this level of the scope, reporting misuse instead of ignoring it.
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.scope.end()
    }
}

impl<'a> Drop for RequestGuard<'a> {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.scope.end();
        }
    }
}

impl RequestScope {
    /// Returns a scope that pins both the server and a connection.
    pub fn new(cluster: &Cluster) -> RequestScope {
        RequestScope {
            cluster: cluster.clone(),
            pin_connection: true,
            nesting_level: Cell::new(0),
            pin: RefCell::new(None),
        }
    }

    /// Returns a scope that pins the server but checks out a connection
    /// for every operation.
    pub fn server_only(cluster: &Cluster) -> RequestScope {
        RequestScope {
            pin_connection: false,
            ..RequestScope::new(cluster)
        }
    }

    pub fn nesting_level(&self) -> usize {
        self.nesting_level.get()
    }

    pub fn is_active(&self) -> bool {
        self.nesting_level.get() > 0
    }

    pub fn pinned_address(&self) -> Option<ServerAddress> {
        self.pin.try_borrow().ok().and_then(|pin| {
            pin.as_ref().map(|pin| pin.server.address().clone())
        })
    }

    pub fn pinned_connection_id(&self) -> Option<u64> {
        self.pin.try_borrow().ok().and_then(|pin| {
            pin.as_ref().and_then(|pin| pin.connection.as_ref().map(|conn| conn.id()))
        })
    }

    /// Begins a scope on a server selected with the read preference. If a
    /// scope is already active, the existing pin is reused.
    pub fn begin(&self, read_preference: &ReadPreference) -> Result<RequestGuard> {
        if self.is_active() {
            return self.nest();
        }

        let server = self.cluster.select_server(read_preference)?;
        self.pin(server)
    }

    /// Begins a scope on the given server. Nesting a scope on a different
    /// server than the one already pinned is an error.
    pub fn begin_with_server(&self, address: &ServerAddress) -> Result<RequestGuard> {
        if self.is_active() {
            match self.pinned_address() {
                Some(ref pinned) if pinned == address => return self.nest(),
                Some(pinned) => {
                    return Err(InvalidPinning(format!(
                        "A request pinned to {} cannot be nested with server {}.", pinned, address)))
                }
                None => return Err(InvalidPinning("The request scope is in use.".to_owned())),
            }
        }

        let server = match self.cluster.server(address)? {
            Some(server) => server,
            None => {
                return Err(InvalidPinning(format!("{} is not part of the cluster.", address)))
            }
        };
        self.pin(server)
    }

    fn nest(&self) -> Result<RequestGuard> {
        self.nesting_level.set(self.nesting_level.get() + 1);
        Ok(RequestGuard { scope: self, ended: false })
    }

    fn pin(&self, server: SelectedServer) -> Result<RequestGuard> {
        let connection = if self.pin_connection {
            Some(self.cluster.acquire_connection(server.address(), None, None)?)
        } else {
            None
        };

        let mut pin = self.pin.try_borrow_mut()
            .map_err(|_| InvalidPinning("The request scope is in use.".to_owned()))?;
        debug!(address = %server.address(),
               connection_id = ?connection.as_ref().map(|conn| conn.id()),
               "request pinned");
        *pin = Some(Pin {
            server: server,
            connection: connection,
        });
        self.nesting_level.set(1);
        Ok(RequestGuard { scope: self, ended: false })
    }

    /// Leaves one level of the scope. At the outermost level the pinned
    /// connection goes back to its pool and the pin is cleared.
    fn end(&self) -> Result<()> {
        let level = self.nesting_level.get();
        if level == 0 {
            return Err(InvalidPinning("The request scope is not active.".to_owned()));
        }
        if level > 1 {
            self.nesting_level.set(level - 1);
            return Ok(());
        }

        let pin = self.pin.try_borrow_mut()
            .map_err(|_| InvalidPinning("The request scope is in use.".to_owned()))?
            .take();
        self.nesting_level.set(0);
        if let Some(pin) = pin {
            debug!(address = %pin.server.address(), "request unpinned");
            // Dropping the connection returns it to its pool.
            drop(pin.connection);
        }
        Ok(())
    }

    /// Runs an operation on the pinned connection, or on a connection to the
    /// pinned server when only the server is pinned. A network error clears
    /// the server's pool and drops the pinned connection; the next operation
    /// opens a new one on the same server.
    pub fn with_connection<F, T>(&self, operation: F) -> Result<T>
        where F: FnOnce(&mut PooledConnection) -> Result<T>
    {
        let mut guard = self.pin.try_borrow_mut()
            .map_err(|_| InvalidPinning("The request scope is already running an operation."
                .to_owned()))?;
        let pin = match *guard {
            Some(ref mut pin) => pin,
            None => return Err(InvalidPinning("The request scope is not active.".to_owned())),
        };

        let address = pin.server.address().clone();
        let mut scratch = None;
        if pin.connection.is_none() {
            let connection = self.cluster.acquire_connection(&address, None, None)?;
            if self.pin_connection {
                pin.connection = Some(connection);
            } else {
                scratch = Some(connection);
            }
        }

        let result = {
            let connection = match scratch {
                Some(ref mut connection) => connection,
                None => {
                    match pin.connection {
                        Some(ref mut connection) => connection,
                        None => return Err(InvalidPinning("No pinned connection.".to_owned())),
                    }
                }
            };
            let result = operation(connection);
            if let Err(ref err) = result {
                if err.is_network_error() {
                    connection.discard();
                }
            }
            result
        };

        if let Err(ref err) = result {
            if err.is_network_error() {
                pin.connection = None;
                self.cluster.handle_operation_error(&address, err)?;
            }
        }
        result
    }
}
