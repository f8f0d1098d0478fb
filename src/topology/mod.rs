//! Cluster discovery, monitoring and server selection.
//!
//! A `Cluster` owns one monitor and one connection pool per known server.
//! Monitors publish new `ServerDescription`s; the cluster folds each one into
//! a new immutable `ClusterDescription` and swaps it in atomically, so
//! selection reads the current snapshot without taking any lock. Callers
//! blocked in selection are woken on every publish.
pub mod description;
pub mod monitor;
pub mod selector;
pub mod server;

use error::Error::{self, OperationError, SelectionTimeout, ServerUnavailable};
use error::Result;

use arc_swap::ArcSwap;
use rand::{thread_rng, Rng};

use cancel::{CancellationToken, Wake};
use common::ReadPreference;
use connstring::ServerAddress;
use event::{ClusterDescriptionChanged, ClusterEvent, Listener};
use options::ClusterSettings;
use pool::{ConnectionPool, PooledConnection};
use stream::{Connector, Prober};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

pub use self::description::{ClusterDescription, DescriptionUpdate, TopologyType};
pub use self::monitor::RoundTripTime;
pub use self::server::{ProbeReply, Server, ServerDescription, ServerState, ServerType};

/// A server chosen by selection, together with its connection pool.
#[derive(Clone, Debug)]
pub struct SelectedServer {
    /// The description the server was selected from.
    pub description: ServerDescription,
    pool: ConnectionPool,
}

impl SelectedServer {
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Holds the monitored state of a server set.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

pub(crate) struct ClusterInner {
    settings: ClusterSettings,
    description: ArcSwap<ClusterDescription>,
    servers: Mutex<HashMap<ServerAddress, Server>>,
    // Serializes publishes and holds the last published revision. Selection
    // waiters block on `changed` with this lock.
    revision: Mutex<u64>,
    changed: Condvar,
    listener: Arc<Listener>,
    connector: Arc<dyn Connector>,
    prober: Arc<dyn Prober>,
    running: AtomicBool,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let description = self.inner.description.load();
        f.debug_struct("Cluster")
            .field("topology_type", &description.topology_type)
            .field("revision", &description.revision)
            .finish()
    }
}

impl Wake for ClusterInner {
    fn wake(&self) {
        let _guard = self.revision.lock();
        self.changed.notify_all();
    }
}

impl ClusterInner {
    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let servers = match self.servers.lock() {
            Ok(mut servers) => servers.drain().map(|(_, server)| server).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        for server in &servers {
            server.stop();
        }

        let _guard = self.revision.lock();
        self.changed.notify_all();
        info!(servers = servers.len(), "cluster shut down");
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Cluster {
    /// Starts monitoring the seed list. Monitors run on their own threads
    /// until the cluster is shut down or the last handle is dropped.
    pub fn new(settings: ClusterSettings, connector: Arc<dyn Connector>,
               prober: Arc<dyn Prober>) -> Result<Cluster> {
        Cluster::with_listener(settings, connector, prober, Arc::new(Listener::new()))
    }

    /// Like `new`, reporting events to an existing listener so that no event
    /// from the first checks is missed.
    pub fn with_listener(settings: ClusterSettings, connector: Arc<dyn Connector>,
                         prober: Arc<dyn Prober>, listener: Arc<Listener>) -> Result<Cluster> {
        settings.validate()?;

        let description = ClusterDescription::new(&settings);
        info!(topology_type = %description.topology_type, seeds = settings.seeds.len(),
              "starting cluster monitoring");

        let cluster = Cluster {
            inner: Arc::new(ClusterInner {
                description: ArcSwap::from_pointee(description),
                servers: Mutex::new(HashMap::new()),
                revision: Mutex::new(0),
                changed: Condvar::new(),
                listener: listener,
                connector: connector,
                prober: prober,
                running: AtomicBool::new(true),
                settings: settings,
            }),
        };

        {
            let mut servers = cluster.inner.servers.lock()?;
            for seed in &cluster.inner.settings.seeds {
                let server = cluster.spawn_server(seed)?;
                servers.insert(seed.clone(), server);
            }
        }
        Ok(cluster)
    }

    pub(crate) fn from_inner(inner: Arc<ClusterInner>) -> Cluster {
        Cluster { inner: inner }
    }

    fn spawn_server(&self, address: &ServerAddress) -> Result<Server> {
        Server::new(address.clone(), &self.inner.settings, self.inner.connector.clone(),
                    self.inner.prober.clone(), self.inner.listener.clone(),
                    Arc::downgrade(&self.inner))
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.inner.settings
    }

    /// Returns the current snapshot.
    pub fn description(&self) -> Arc<ClusterDescription> {
        self.inner.description.load_full()
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.inner.listener
    }

    /// Returns a channel receiving every subsequent description change.
    pub fn subscribe(&self) -> Result<Receiver<ClusterDescriptionChanged>> {
        self.inner.listener.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Replaces the description of one server, recomputes the topology and
    /// publishes the new snapshot. Monitors are started for newly reported
    /// members and stopped for removed ones.
    pub fn update_server_description(&self, server: ServerDescription) -> Result<()> {
        let mut revision = self.inner.revision.lock()?;
        if !self.is_running() {
            return Ok(());
        }

        let old = self.inner.description.load_full();
        let update = match old.apply(server) {
            Some(update) => update,
            None => return Ok(()),
        };
        let DescriptionUpdate { description, added, removed, demoted } = update;
        let new = Arc::new(description);

        if old.topology_type != new.topology_type {
            info!(from = %old.topology_type, to = %new.topology_type, "topology type changed");
        }

        // Removed servers close their pools on drop, which runs hooks, so
        // they are dropped once both locks are released.
        let mut stopped = Vec::new();
        {
            let mut servers = self.inner.servers.lock()?;
            for address in &removed {
                info!(address = %address, "server removed");
                stopped.extend(servers.remove(address));
            }
            for address in &added {
                if servers.contains_key(address) {
                    continue;
                }
                info!(address = %address, "server added");
                match self.spawn_server(address) {
                    Ok(server) => {
                        servers.insert(address.clone(), server);
                    }
                    Err(err) => warn!(address = %address, error = %err, "failed to start monitor"),
                }
            }
            for address in &demoted {
                info!(address = %address, "stale primary demoted");
                if let Some(server) = servers.get(address) {
                    server.request_check();
                }
            }
        }

        self.inner.description.store(new.clone());
        *revision = new.revision;
        self.inner.changed.notify_all();

        debug!(revision = new.revision, topology_type = %new.topology_type,
               "published cluster description");
        let changed = ClusterDescriptionChanged { old: old, new: new };
        // Subscribers receive changes in revision order.
        self.inner.listener.notify_subscribers(&changed);
        drop(revision);
        drop(stopped);

        self.inner.listener.run_hooks(&ClusterEvent::DescriptionChanged(changed));
        Ok(())
    }

    /// Selects a server for reads using the configured selection timeout.
    pub fn select_server(&self, read_preference: &ReadPreference) -> Result<SelectedServer> {
        self.select_server_with(read_preference, None, None)
    }

    /// Selects a server for writes using the configured selection timeout.
    pub fn select_writable_server(&self) -> Result<SelectedServer> {
        self.select_with(&ReadPreference::primary(), None, None, true)
    }

    /// Selects a server matching the read preference, blocking until one
    /// is eligible, the timeout elapses, or the token is cancelled.
    pub fn select_server_with(&self, read_preference: &ReadPreference, timeout: Option<Duration>,
                              cancel: Option<&CancellationToken>) -> Result<SelectedServer> {
        read_preference.validate()?;
        self.inner.settings.check_max_staleness(read_preference)?;
        self.select_with(read_preference, timeout, cancel, false)
    }

    fn select_with(&self, read_preference: &ReadPreference, timeout: Option<Duration>,
                   cancel: Option<&CancellationToken>, writable: bool) -> Result<SelectedServer> {
        let timeout = timeout.unwrap_or(self.inner.settings.server_selection_timeout);
        let deadline = Instant::now().checked_add(timeout);

        if let Some(token) = cancel {
            let waker: Weak<dyn Wake> = Arc::downgrade(&self.inner) as Weak<dyn Wake>;
            token.register(waker);
        }

        let mut checks_requested = false;
        loop {
            if !self.is_running() {
                return Err(OperationError("The cluster has been shut down.".to_owned()));
            }

            let description = self.description();
            let candidate_count = {
                let candidates = if writable {
                    selector::select_writable(&description)
                } else {
                    selector::select(&description, read_preference)
                };

                if !candidates.is_empty() {
                    let chosen = candidates[thread_rng().gen_range(0, candidates.len())];
                    if let Some(pool) = self.pool(&chosen.address)? {
                        debug!(address = %chosen.address, candidates = candidates.len(),
                               read_preference = %read_preference, "selected server");
                        return Ok(SelectedServer {
                            description: chosen.clone(),
                            pool: pool,
                        });
                    }
                }
                candidates.len()
            };

            if cancel.map_or(false, |token| token.is_cancelled()) {
                return Err(Error::Cancelled);
            }

            let now = Instant::now();
            if deadline.map_or(false, |deadline| now >= deadline) {
                warn!(read_preference = %read_preference, topology_type = %description.topology_type,
                      "server selection timed out");
                return Err(SelectionTimeout {
                    read_preference: read_preference.to_string(),
                    topology_type: description.topology_type,
                    server_count: description.servers.len(),
                    candidate_count: candidate_count,
                    fastest_round_trip_time: description.fastest_round_trip_time(),
                    timeout: timeout,
                });
            }

            if !checks_requested {
                self.request_all_checks()?;
                checks_requested = true;
            }

            let revision = self.inner.revision.lock()?;
            if *revision == description.revision && self.is_running() &&
               !cancel.map_or(false, |token| token.is_cancelled()) {
                match deadline {
                    Some(deadline) => {
                        let _ = self.inner.changed.wait_timeout(revision, deadline - now)?;
                    }
                    None => {
                        drop(self.inner.changed.wait(revision)?);
                    }
                }
            }
        }
    }

    fn pool(&self, address: &ServerAddress) -> Result<Option<ConnectionPool>> {
        let servers = self.inner.servers.lock()?;
        Ok(servers.get(address).map(|server| server.pool().clone()))
    }

    /// Returns the server with the given address, if the cluster currently
    /// knows it.
    pub fn server(&self, address: &ServerAddress) -> Result<Option<SelectedServer>> {
        let description = match self.description().server(address) {
            Some(description) => description.clone(),
            None => return Ok(None),
        };
        Ok(self.pool(address)?.map(|pool| {
            SelectedServer {
                description: description,
                pool: pool,
            }
        }))
    }

    /// Checks out a connection to the server. Fails with `ServerUnavailable`
    /// if the server's latest description is disconnected, clearing its pool
    /// and requesting a re-check.
    pub fn acquire_connection(&self, address: &ServerAddress, timeout: Option<Duration>,
                              cancel: Option<&CancellationToken>) -> Result<PooledConnection> {
        let server = match self.server(address)? {
            Some(server) => server,
            None => {
                return Err(ServerUnavailable {
                    address: address.clone(),
                    message: "the server is no longer part of the cluster".to_owned(),
                })
            }
        };

        if server.description.state == ServerState::Disconnected {
            let message = server.description.error
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "the last health check failed".to_owned());
            let err = ServerUnavailable {
                address: address.clone(),
                message: message,
            };
            self.handle_operation_error(address, &err)?;
            return Err(err);
        }

        match server.pool.acquire_with(timeout, cancel) {
            Ok(connection) => Ok(connection),
            Err(err) => {
                self.handle_operation_error(address, &err)?;
                Err(err)
            }
        }
    }

    /// Reacts to an error seen while talking to a server. Network errors
    /// clear the server's pool and request a re-check.
    pub fn handle_operation_error(&self, address: &ServerAddress, err: &Error) -> Result<()> {
        if !err.is_network_error() {
            return Ok(());
        }

        warn!(address = %address, error = %err, "network error, clearing connection pool");
        let pool = match self.inner.servers.lock()?.get(address) {
            Some(server) => {
                server.request_check();
                server.pool().clone()
            }
            None => return Ok(()),
        };
        // Clearing runs hooks, which may call back into the cluster.
        pool.invalidate()?;
        Ok(())
    }

    /// Asks the server's monitor for an immediate check.
    pub fn request_check(&self, address: &ServerAddress) -> Result<()> {
        if let Some(server) = self.inner.servers.lock()?.get(address) {
            server.request_check();
        }
        Ok(())
    }

    fn request_all_checks(&self) -> Result<()> {
        for server in self.inner.servers.lock()?.values() {
            server.request_check();
        }
        Ok(())
    }

    /// Stops every monitor and closes every pool. Blocked selections fail.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}
