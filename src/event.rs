//! Topology and pool monitoring.
//!
//! The listener lets higher layers react to runtime information about the
//! cluster without polling. Hooks see every event; subscribers receive
//! description changes over a channel.
use connstring::ServerAddress;
use error::Result;
use topology::ClusterDescription;

use std::fmt::{self, Display, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// A change from one published cluster description to the next.
#[derive(Clone, Debug)]
pub struct ClusterDescriptionChanged {
    pub old: Arc<ClusterDescription>,
    pub new: Arc<ClusterDescription>,
}

/// Why the pool closed a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionClosedReason {
    /// The pool was cleared after the connection was created.
    Stale,
    /// The connection sat unused for longer than the maximum idle time.
    Idle,
    /// The connection outlived the maximum life time.
    LifeTimeExpired,
    /// The connection saw an error and was discarded by its user.
    Error,
    /// The pool was shut down.
    PoolClosed,
}

pub enum ClusterEvent {
    DescriptionChanged(ClusterDescriptionChanged),
    ServerHeartbeatSucceeded {
        address: ServerAddress,
        round_trip_time: Duration,
    },
    ServerHeartbeatFailed {
        address: ServerAddress,
        duration: Duration,
        message: String,
    },
    PoolCleared {
        address: ServerAddress,
        generation: u64,
    },
    ConnectionCreated {
        address: ServerAddress,
        connection_id: u64,
    },
    ConnectionClosed {
        address: ServerAddress,
        connection_id: u64,
        reason: ConnectionClosedReason,
    },
}

impl Display for ClusterEvent {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match *self {
            ClusterEvent::DescriptionChanged(ref changed) => {
                write!(fmt, "TOPOLOGY CHANGED {:?} -> {:?} (revision {} -> {})",
                       changed.old.topology_type, changed.new.topology_type,
                       changed.old.revision, changed.new.revision)
            }
            ClusterEvent::ServerHeartbeatSucceeded { ref address, round_trip_time } => {
                write!(fmt, "HEARTBEAT {} SUCCEEDED ({:?})", address, round_trip_time)
            }
            ClusterEvent::ServerHeartbeatFailed { ref address, duration, ref message } => {
                write!(fmt, "HEARTBEAT {} FAILED: {} ({:?})", address, message, duration)
            }
            ClusterEvent::PoolCleared { ref address, generation } => {
                write!(fmt, "POOL {} CLEARED (generation {})", address, generation)
            }
            ClusterEvent::ConnectionCreated { ref address, connection_id } => {
                write!(fmt, "CONNECTION {}#{} CREATED", address, connection_id)
            }
            ClusterEvent::ConnectionClosed { ref address, connection_id, reason } => {
                write!(fmt, "CONNECTION {}#{} CLOSED ({:?})", address, connection_id, reason)
            }
        }
    }
}

pub type EventHook = Box<dyn Fn(&ClusterEvent) + Send + Sync>;

/// Dispatches cluster events to registered hooks and subscribers.
pub struct Listener {
    no_hooks: AtomicBool,
    hooks: RwLock<Vec<EventHook>>,
    subscribers: Mutex<Vec<Sender<ClusterDescriptionChanged>>>,
}

impl Default for Listener {
    fn default() -> Listener {
        Listener::new()
    }
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_hooks: AtomicBool::new(true),
            hooks: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a hook that runs, on the emitting thread, for every event.
    pub fn add_hook(&self, hook: EventHook) -> Result<()> {
        let mut guard = self.hooks.write()?;
        self.no_hooks.store(false, Ordering::SeqCst);
        guard.deref_mut().push(hook);
        Ok(())
    }

    /// Returns a channel that receives every subsequent description change.
    pub fn subscribe(&self) -> Result<Receiver<ClusterDescriptionChanged>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock()?.push(tx);
        Ok(rx)
    }

    pub fn emit(&self, event: ClusterEvent) {
        if let ClusterEvent::DescriptionChanged(ref changed) = event {
            self.notify_subscribers(changed);
        }
        self.run_hooks(&event);
    }

    /// Sends a description change to every live subscriber.
    pub(crate) fn notify_subscribers(&self, changed: &ClusterDescriptionChanged) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            // Dropped receivers are forgotten.
            subscribers.retain(|tx| tx.send(changed.clone()).is_ok());
        }
    }

    /// Runs the registered hooks. Callers must not hold cluster or pool
    /// locks, since hooks may call back into either.
    pub(crate) fn run_hooks(&self, event: &ClusterEvent) {
        if self.no_hooks.load(Ordering::SeqCst) {
            return;
        }

        if let Ok(guard) = self.hooks.read() {
            for hook in guard.deref().iter() {
                hook(event);
            }
        }
    }
}
