//! Per-server state: the observed description and the server's resources.
use error::Error::{self, OperationError, ResponseError};
use error::Result;

use bson::{self, oid, Bson};
use chrono::{DateTime, Utc};

use common::TagSet;
use connstring::{self, ServerAddress};
use event::Listener;
use options::ClusterSettings;
use pool::ConnectionPool;
use stream::{Connector, Prober};

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use super::monitor::{Monitor, MonitorControl};
use super::ClusterInner;

/// Describes the server role within a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerType {
    /// Standalone server.
    Standalone,
    /// Replica set primary.
    ReplicaSetPrimary,
    /// Replica set secondary.
    ReplicaSetSecondary,
    /// Replica set arbiter.
    ReplicaSetArbiter,
    /// Replica set member of some other type, including members that are
    /// still being initialized.
    ReplicaSetOther,
    /// Shard router.
    ShardRouter,
    /// Server type is currently unknown.
    Unknown,
}

/// Whether the last health check reached the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Not checked yet, or waiting for a requested re-check.
    Connecting,
    Connected,
    Disconnected,
}

/// The parsed reply of a health-check probe.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeReply {
    pub ok: bool,
    pub is_master: bool,
    pub is_secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    /// Shard routers add this field to the reply, set to "isdbgrid".
    pub msg: String,
    pub is_replica_set: bool,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    pub election_id: Option<oid::ObjectId>,
    pub me: Option<ServerAddress>,
    pub primary: Option<ServerAddress>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub tags: TagSet,
    pub last_write_date: Option<DateTime<Utc>>,
}

fn parse_host_list(doc: &bson::Document, key: &str) -> Vec<ServerAddress> {
    match doc.get(key) {
        Some(&Bson::Array(ref arr)) => {
            arr.iter()
                .filter_map(|bson| match *bson {
                    Bson::String(ref s) => connstring::parse_host(s).ok(),
                    _ => None,
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

fn as_bool(value: Option<&Bson>) -> bool {
    match value {
        Some(&Bson::Boolean(b)) => b,
        Some(&Bson::I32(v)) => v != 0,
        Some(&Bson::I64(v)) => v != 0,
        Some(&Bson::FloatingPoint(v)) => v != 0.0,
        _ => false,
    }
}

impl ProbeReply {
    /// Parses a health-check reply document from the server.
    pub fn parse(doc: &bson::Document) -> Result<ProbeReply> {
        let ok = match doc.get("ok") {
            Some(&Bson::I32(v)) => v != 0,
            Some(&Bson::I64(v)) => v != 0,
            Some(&Bson::FloatingPoint(v)) => v != 0.0,
            Some(&Bson::Boolean(b)) => b,
            _ => return Err(ResponseError("Probe reply does not contain `ok`.".to_owned())),
        };

        let mut reply = ProbeReply {
            ok: ok,
            is_master: as_bool(doc.get("ismaster")),
            is_secondary: as_bool(doc.get("secondary")),
            arbiter_only: as_bool(doc.get("arbiterOnly")),
            hidden: as_bool(doc.get("hidden")),
            msg: String::new(),
            is_replica_set: as_bool(doc.get("isreplicaset")),
            set_name: None,
            set_version: None,
            election_id: None,
            me: None,
            primary: None,
            hosts: parse_host_list(doc, "hosts"),
            passives: parse_host_list(doc, "passives"),
            arbiters: parse_host_list(doc, "arbiters"),
            tags: TagSet::new(),
            last_write_date: None,
        };

        if let Some(&Bson::String(ref s)) = doc.get("msg") {
            reply.msg = s.to_owned();
        }

        if let Some(&Bson::String(ref s)) = doc.get("setName") {
            if !s.is_empty() {
                reply.set_name = Some(s.to_owned());
            }
        }

        reply.set_version = match doc.get("setVersion") {
            Some(&Bson::I32(v)) => Some(i64::from(v)),
            Some(&Bson::I64(v)) => Some(v),
            _ => None,
        };

        if let Some(&Bson::String(ref s)) = doc.get("me") {
            reply.me = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::String(ref s)) = doc.get("primary") {
            reply.primary = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(ref tag) = *v {
                    reply.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        match doc.get("electionId") {
            Some(&Bson::ObjectId(ref id)) => reply.election_id = Some(id.clone()),
            Some(&Bson::Document(ref doc)) => {
                if let Some(&Bson::String(ref s)) = doc.get("$oid") {
                    reply.election_id = Some(oid::ObjectId::with_string(s)?);
                }
            }
            _ => (),
        }

        if let Some(&Bson::Document(ref last_write)) = doc.get("lastWrite") {
            if let Some(&Bson::UtcDatetime(ref date)) = last_write.get("lastWriteDate") {
                reply.last_write_date = Some(date.clone());
            }
        }

        Ok(reply)
    }

    /// Derives the server's role from the reply.
    pub fn server_type(&self) -> ServerType {
        if !self.ok {
            ServerType::Unknown
        } else if self.msg == "isdbgrid" {
            ServerType::ShardRouter
        } else if self.set_name.is_some() {
            if self.is_master {
                ServerType::ReplicaSetPrimary
            } else if self.is_secondary {
                ServerType::ReplicaSetSecondary
            } else if self.arbiter_only {
                ServerType::ReplicaSetArbiter
            } else {
                ServerType::ReplicaSetOther
            }
        } else if self.is_replica_set {
            // Members still being initialized answer without a set name.
            ServerType::ReplicaSetOther
        } else {
            ServerType::Standalone
        }
    }
}

/// Server information gathered from server monitoring. Descriptions are
/// never updated in place; every check produces a new one.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub state: ServerState,
    pub server_type: ServerType,
    /// Server tags for targeted read operations on specific replica set members.
    pub tags: TagSet,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    /// The server's current election id, if it believes it is a primary.
    pub election_id: Option<oid::ObjectId>,
    /// The server's host information, if it is part of a replica set.
    pub me: Option<ServerAddress>,
    /// The server's opinion of who the primary is.
    pub primary: Option<ServerAddress>,
    /// All hosts in the replica set known by this server.
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    /// The moving average of health-check round trips.
    pub round_trip_time: Option<Duration>,
    pub last_update_time: DateTime<Utc>,
    pub last_write_date: Option<DateTime<Utc>>,
    /// Any error encountered while monitoring this server.
    pub error: Option<Arc<Error>>,
}

impl ServerDescription {
    /// Returns a description for a server that has not been checked yet.
    pub fn new(address: ServerAddress) -> ServerDescription {
        ServerDescription {
            address: address,
            state: ServerState::Connecting,
            server_type: ServerType::Unknown,
            tags: TagSet::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            me: None,
            primary: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            round_trip_time: None,
            last_update_time: Utc::now(),
            last_write_date: None,
            error: None,
        }
    }

    /// Builds a connected description from a successful probe.
    pub fn from_reply(address: ServerAddress, reply: ProbeReply,
                      round_trip_time: Duration) -> ServerDescription {
        ServerDescription {
            state: ServerState::Connected,
            server_type: reply.server_type(),
            tags: reply.tags,
            set_name: reply.set_name,
            set_version: reply.set_version,
            election_id: reply.election_id,
            me: reply.me,
            primary: reply.primary,
            hosts: reply.hosts,
            passives: reply.passives,
            arbiters: reply.arbiters,
            round_trip_time: Some(round_trip_time),
            last_write_date: reply.last_write_date,
            ..ServerDescription::new(address)
        }
    }

    /// Builds a description for a server whose check failed.
    pub fn disconnected(address: ServerAddress, error: Error) -> ServerDescription {
        ServerDescription {
            state: ServerState::Disconnected,
            error: Some(Arc::new(error)),
            ..ServerDescription::new(address)
        }
    }

    /// Returns an unknown copy of this description, used when a newer
    /// primary supersedes this one. The server is re-checked afterwards.
    pub fn demoted(&self, reason: &str) -> ServerDescription {
        ServerDescription {
            round_trip_time: self.round_trip_time,
            error: Some(Arc::new(OperationError(reason.to_owned()))),
            ..ServerDescription::new(self.address.clone())
        }
    }

    /// Whether the server answered its last check with a known role.
    pub fn is_available(&self) -> bool {
        self.state == ServerState::Connected && self.server_type != ServerType::Unknown
    }

    pub fn is_primary(&self) -> bool {
        self.server_type == ServerType::ReplicaSetPrimary
    }

    pub fn is_secondary(&self) -> bool {
        self.server_type == ServerType::ReplicaSetSecondary
    }

    /// Whether every pair of the tag set is present on the server.
    pub fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        tag_set.iter().all(|(k, v)| self.tags.get(k) == Some(v))
    }

    /// The replica set membership the server reports, in reply order.
    pub fn members(&self) -> Vec<ServerAddress> {
        self.hosts.iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
            .cloned()
            .collect()
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:?}, {:?}", self.address, self.server_type, self.state)?;
        if let Some(rtt) = self.round_trip_time {
            write!(f, ", rtt {:?}", rtt)?;
        }
        if let Some(ref err) = self.error {
            write!(f, ", error: {}", err)?;
        }
        write!(f, ")")
    }
}

/// Holds the connection pool and monitor of a single server.
pub struct Server {
    pub address: ServerAddress,
    pool: ConnectionPool,
    // Shared with the monitor thread. When this server is dropped, the
    // monitor will be stopped.
    monitor: Arc<MonitorControl>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server").field("address", &self.address).finish()
    }
}

impl Server {
    /// Returns a new server with the given address, initializing a new
    /// connection pool and a monitor thread.
    pub(crate) fn new(address: ServerAddress, settings: &ClusterSettings,
                      connector: Arc<dyn Connector>, prober: Arc<dyn Prober>,
                      listener: Arc<Listener>, cluster: Weak<ClusterInner>) -> Result<Server> {
        let pool = ConnectionPool::new(address.clone(), settings.pool.clone(), connector,
                                       listener.clone())?;
        let control = Arc::new(MonitorControl::new());
        let monitor = Monitor::new(address.clone(), settings, pool.clone(), prober, listener,
                                   control.clone(), cluster);

        thread::Builder::new()
            .name(format!("monitor {}", address))
            .spawn(move || monitor.run())?;

        Ok(Server {
            address: address,
            pool: pool,
            monitor: control,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Asks the monitor to check the server as soon as the minimum
    /// heartbeat spacing allows.
    pub fn request_check(&self) {
        self.monitor.request_check();
    }

    /// Stops the monitor and closes the pool.
    pub fn stop(&self) {
        self.monitor.stop();
        self.pool.close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
