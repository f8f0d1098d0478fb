//! Error types for topology monitoring, server selection and pooling.
use bson::oid;

use connstring::ServerAddress;
use topology::TopologyType;

use std::{error, fmt, io, result, sync};
use std::time::Duration;

pub type Result<T> = result::Result<T, Error>;

/// The error type for cluster, pool and request operations.
#[derive(Debug)]
pub enum Error {
    /// Invalid settings or arguments supplied by the caller.
    ArgumentError(String),
    /// A generic failure while performing an operation.
    OperationError(String),
    /// A health-check reply could not be interpreted.
    ResponseError(String),
    /// A failure reported by the underlying connection.
    IoError(io::Error),
    /// A lock was poisoned by a panicking thread.
    LockError,
    /// No eligible server was found before the selection deadline.
    SelectionTimeout {
        read_preference: String,
        topology_type: TopologyType,
        server_count: usize,
        candidate_count: usize,
        fastest_round_trip_time: Option<Duration>,
        timeout: Duration,
    },
    /// The pool is at capacity and its wait queue is full.
    WaitQueueFull {
        address: ServerAddress,
        max_size: usize,
        wait_queue_size: usize,
    },
    /// No connection became available before the wait-queue deadline.
    PoolWaitTimeout {
        address: ServerAddress,
        timeout: Duration,
        total: usize,
        idle: usize,
        max_size: usize,
    },
    /// The pool was shut down.
    PoolClosed(ServerAddress),
    /// The server's last observed state is disconnected.
    ServerUnavailable {
        address: ServerAddress,
        message: String,
    },
    /// A request scope was used inconsistently. This is a programming error.
    InvalidPinning(String),
    /// A blocking wait was abandoned through its cancellation token.
    Cancelled,
}

impl Error {
    /// Whether the error was caused by the network or an unreachable server.
    pub fn is_network_error(&self) -> bool {
        match *self {
            Error::IoError(_) | Error::ServerUnavailable { .. } => true,
            _ => false,
        }
    }

    /// Whether a higher layer may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        match *self {
            Error::SelectionTimeout { .. } |
            Error::WaitQueueFull { .. } |
            Error::PoolWaitTimeout { .. } => true,
            _ => self.is_network_error(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<oid::Error> for Error {
    fn from(err: oid::Error) -> Error {
        Error::ResponseError(err.to_string())
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::LockError
    }
}

fn fmt_rtt(rtt: &Option<Duration>) -> String {
    match *rtt {
        Some(d) => format!("{}ms", d.as_secs_f64() * 1000.0),
        None => String::from("n/a"),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ArgumentError(ref inner) => inner.fmt(fmt),
            Error::OperationError(ref inner) => inner.fmt(fmt),
            Error::ResponseError(ref inner) => inner.fmt(fmt),
            Error::IoError(ref inner) => inner.fmt(fmt),
            Error::LockError => write!(fmt, "Lock poisoned."),
            Error::SelectionTimeout {
                ref read_preference,
                topology_type,
                server_count,
                candidate_count,
                ref fastest_round_trip_time,
                timeout,
            } => write!(fmt,
                        "No server matched {} within {:?} (topology {:?}, {} known servers, \
                         {} candidates, fastest round trip {}).",
                        read_preference,
                        timeout,
                        topology_type,
                        server_count,
                        candidate_count,
                        fmt_rtt(fastest_round_trip_time)),
            Error::WaitQueueFull { ref address, max_size, wait_queue_size } => {
                write!(fmt,
                       "Connection pool for {} is full ({} connections) and its wait queue \
                        is full ({} waiters).",
                       address, max_size, wait_queue_size)
            }
            Error::PoolWaitTimeout { ref address, timeout, total, idle, max_size } => {
                write!(fmt,
                       "Timed out after {:?} waiting for a connection to {} \
                        ({} of {} connections open, {} idle).",
                       timeout, address, total, max_size, idle)
            }
            Error::PoolClosed(ref address) => write!(fmt, "Connection pool for {} is closed.", address),
            Error::ServerUnavailable { ref address, ref message } => {
                write!(fmt, "Server {} is unavailable: {}", address, message)
            }
            Error::InvalidPinning(ref inner) => write!(fmt, "Invalid request pinning: {}", inner),
            Error::Cancelled => write!(fmt, "The wait was cancelled."),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IoError(ref inner) => Some(inner),
            _ => None,
        }
    }
}
