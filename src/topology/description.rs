//! The cluster-wide view assembled from individual server descriptions.
use bson::oid;

use connstring::ServerAddress;
use options::{ClusterSettings, ConnectionMode};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::server::{ServerDescription, ServerType};

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An immutable snapshot of the cluster. Every accepted server description
/// produces a new snapshot with a higher revision.
#[derive(Clone, Debug)]
pub struct ClusterDescription {
    pub topology_type: TopologyType,
    /// Known servers within the topology.
    pub servers: HashMap<ServerAddress, ServerDescription>,
    pub revision: u64,
    /// The replica set name, configured or discovered from the first member.
    pub set_name: Option<String>,
    /// Used to estimate secondary staleness.
    pub heartbeat_frequency: Duration,
    // The largest (setVersion, electionId) reported by a primary.
    max_set_version: Option<i64>,
    max_election_id: Option<oid::ObjectId>,
}

/// The result of applying one server description.
#[derive(Clone, Debug)]
pub struct DescriptionUpdate {
    pub description: ClusterDescription,
    /// Members reported by the replica set that now need monitors.
    pub added: Vec<ServerAddress>,
    /// Servers dropped from the topology whose monitors must stop.
    pub removed: Vec<ServerAddress>,
    /// Former primaries reset to unknown that should be checked again.
    pub demoted: Vec<ServerAddress>,
}

// Compares (setVersion, electionId) pairs, treating missing parts as lowest.
fn compare_primary_ids(a: (Option<i64>, Option<&oid::ObjectId>),
                       b: (Option<i64>, Option<&oid::ObjectId>)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.map(|id| id.bytes()).cmp(&b.1.map(|id| id.bytes())))
}

impl ClusterDescription {
    /// Returns the initial description for the settings. Every seed starts
    /// out unknown.
    pub fn new(settings: &ClusterSettings) -> ClusterDescription {
        let topology_type = match settings.connection_mode {
            ConnectionMode::Direct => TopologyType::Single,
            ConnectionMode::Sharded => TopologyType::Sharded,
            ConnectionMode::ReplicaSet => TopologyType::ReplicaSetNoPrimary,
            ConnectionMode::Automatic if settings.replica_set_name.is_some() => {
                TopologyType::ReplicaSetNoPrimary
            }
            ConnectionMode::Automatic => TopologyType::Unknown,
        };

        let servers = settings.seeds.iter()
            .map(|address| (address.clone(), ServerDescription::new(address.clone())))
            .collect();

        ClusterDescription {
            topology_type: topology_type,
            servers: servers,
            revision: 0,
            set_name: settings.replica_set_name.clone(),
            heartbeat_frequency: settings.heartbeat_frequency,
            max_set_version: None,
            max_election_id: None,
        }
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers.values().find(|server| server.is_primary())
    }

    /// The fastest round trip among available servers, for diagnostics.
    pub fn fastest_round_trip_time(&self) -> Option<Duration> {
        self.servers.values()
            .filter(|server| server.is_available())
            .filter_map(|server| server.round_trip_time)
            .min()
    }

    /// Applies a new description for one server and returns the resulting
    /// snapshot. Returns None when the server is no longer part of the
    /// topology, since its report is obsolete.
    pub fn apply(&self, description: ServerDescription) -> Option<DescriptionUpdate> {
        if !self.servers.contains_key(&description.address) {
            return None;
        }

        let mut update = DescriptionUpdate {
            description: self.clone(),
            added: Vec::new(),
            removed: Vec::new(),
            demoted: Vec::new(),
        };
        update.description.revision = self.revision + 1;
        update.apply(description);
        Some(update)
    }
}

impl DescriptionUpdate {
    fn apply(&mut self, description: ServerDescription) {
        let address = description.address.clone();
        let stype = description.server_type;
        let ghost = stype == ServerType::ReplicaSetOther && description.set_name.is_none();
        self.description.servers.insert(address.clone(), description.clone());

        match self.description.topology_type {
            TopologyType::Single => (),
            TopologyType::Unknown => {
                match stype {
                    ServerType::Standalone => self.update_unknown_with_standalone(&address),
                    ServerType::ShardRouter => self.description.topology_type = TopologyType::Sharded,
                    ServerType::ReplicaSetPrimary => self.update_rs_from_primary(&description),
                    _ if ghost => (),
                    ServerType::ReplicaSetSecondary |
                    ServerType::ReplicaSetArbiter |
                    ServerType::ReplicaSetOther => self.update_rs_without_primary(&description),
                    ServerType::Unknown => (),
                }
            }
            TopologyType::Sharded => {
                match stype {
                    ServerType::Unknown | ServerType::ShardRouter => (),
                    _ => self.remove(&address),
                }
            }
            TopologyType::ReplicaSetNoPrimary => {
                match stype {
                    ServerType::Standalone | ServerType::ShardRouter => self.remove(&address),
                    ServerType::ReplicaSetPrimary => self.update_rs_from_primary(&description),
                    _ if ghost => (),
                    ServerType::ReplicaSetSecondary |
                    ServerType::ReplicaSetArbiter |
                    ServerType::ReplicaSetOther => self.update_rs_without_primary(&description),
                    ServerType::Unknown => (),
                }
                self.check_if_has_primary();
            }
            TopologyType::ReplicaSetWithPrimary => {
                match stype {
                    ServerType::Standalone | ServerType::ShardRouter => self.remove(&address),
                    ServerType::ReplicaSetPrimary => self.update_rs_from_primary(&description),
                    _ if ghost => (),
                    ServerType::ReplicaSetSecondary |
                    ServerType::ReplicaSetArbiter |
                    ServerType::ReplicaSetOther => self.update_rs_with_primary_from_member(&description),
                    ServerType::Unknown => (),
                }
                self.check_if_has_primary();
            }
        }
    }

    fn remove(&mut self, address: &ServerAddress) {
        if self.description.servers.remove(address).is_some() {
            self.added.retain(|a| a != address);
            self.demoted.retain(|a| a != address);
            self.removed.push(address.clone());
        }
    }

    // Sets the correct replica set topology type.
    fn check_if_has_primary(&mut self) {
        self.description.topology_type = if self.description.primary().is_some() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    // Updates an unknown topology with a new standalone server description.
    fn update_unknown_with_standalone(&mut self, address: &ServerAddress) {
        if self.description.servers.len() == 1 {
            self.description.topology_type = TopologyType::Single;
        } else {
            self.remove(address);
        }
    }

    // Adopts the set name from the member, or removes the member if it
    // reports a different set. Returns false if the member was removed.
    fn check_set_name(&mut self, description: &ServerDescription) -> bool {
        match (self.description.set_name.clone(), description.set_name.clone()) {
            (None, name) => {
                self.description.set_name = name;
                true
            }
            (Some(ref expected), Some(ref name)) if expected == name => true,
            _ => {
                self.remove(&description.address);
                false
            }
        }
    }

    // Updates a replica set topology with a new primary server description.
    fn update_rs_from_primary(&mut self, description: &ServerDescription) {
        if !self.check_set_name(description) {
            self.check_if_has_primary();
            return;
        }

        let address = &description.address;
        if description.set_version.is_some() && description.election_id.is_some() {
            let max = (self.description.max_set_version, self.description.max_election_id.as_ref());
            let reported = (description.set_version, description.election_id.as_ref());
            if max.1.is_some() && compare_primary_ids(reported, max) == Ordering::Less {
                // Stale primary.
                let demoted = description.demoted("Primary reported an outdated election id.");
                self.description.servers.insert(address.clone(), demoted);
                self.check_if_has_primary();
                return;
            }
            self.description.max_election_id = description.election_id.clone();
        }

        if let Some(version) = description.set_version {
            if self.description.max_set_version.map_or(true, |max| version > max) {
                self.description.max_set_version = Some(version);
            }
        }

        // Invalidate any old primaries.
        let old_primaries = self.description.servers.values()
            .filter(|server| server.is_primary() && server.address != *address)
            .map(|server| server.address.clone())
            .collect::<Vec<_>>();
        for old in old_primaries {
            let demoted = match self.description.servers.get(&old) {
                Some(server) => server.demoted("A newer primary was discovered."),
                None => continue,
            };
            self.description.servers.insert(old.clone(), demoted);
            self.demoted.push(old);
        }

        self.add_missing_hosts(description);

        // Remove hosts that are not reported by the primary.
        let members = description.members();
        let stale = self.description.servers.keys()
            .filter(|host| !members.contains(*host))
            .cloned()
            .collect::<Vec<_>>();
        for host in stale {
            self.remove(&host);
        }

        self.check_if_has_primary();
    }

    // Updates a replica set topology with a missing primary.
    fn update_rs_without_primary(&mut self, description: &ServerDescription) {
        self.description.topology_type = TopologyType::ReplicaSetNoPrimary;
        if !self.check_set_name(description) {
            return;
        }

        self.add_missing_hosts(description);

        if let Some(ref me) = description.me {
            if *me != description.address {
                self.remove(&description.address);
            }
        }
    }

    // Updates a replica set topology with an updated member description.
    fn update_rs_with_primary_from_member(&mut self, description: &ServerDescription) {
        if self.description.set_name != description.set_name {
            self.remove(&description.address);
            return;
        }

        if let Some(ref me) = description.me {
            if *me != description.address {
                self.remove(&description.address);
            }
        }
    }

    // Begins tracking hosts that are not currently known.
    fn add_missing_hosts(&mut self, description: &ServerDescription) {
        for host in description.members() {
            if !self.description.servers.contains_key(&host) {
                self.description.servers.insert(host.clone(), ServerDescription::new(host.clone()));
                self.removed.retain(|a| *a != host);
                self.added.push(host);
            }
        }
    }
}
