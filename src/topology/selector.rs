//! Server selection.
//!
//! Selection is a pure function of a cluster snapshot and a read
//! preference. It narrows the known servers down to the eligible set:
//!
//! 1. servers compatible with the topology and the read mode,
//! 2. secondaries within `max_staleness`, when one is given,
//! 3. servers matching the first tag set that matches any of them,
//! 4. servers within the latency window of the fastest remaining one.
//!
//! The caller picks one of the survivors at random.
use chrono::{DateTime, Utc};

use common::{ReadMode, ReadPreference, TagSet};

use std::time::Duration;

use super::description::{ClusterDescription, TopologyType};
use super::server::{ServerDescription, ServerType};

/// Returns the servers eligible for a read with the given preference,
/// ordered by address.
pub fn select<'a>(description: &'a ClusterDescription, read_preference: &ReadPreference)
                  -> Vec<&'a ServerDescription> {
    let mut candidates = match description.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single => available(description, |_| true),
        TopologyType::Sharded => available(description, |s| s.server_type == ServerType::ShardRouter),
        TopologyType::ReplicaSetNoPrimary |
        TopologyType::ReplicaSetWithPrimary => select_replica_set(description, read_preference),
    };

    candidates = within_latency_window(candidates, read_preference.local_threshold);
    candidates.sort_by(|a, b| a.address.cmp(&b.address));
    candidates
}

/// Returns the servers that can accept writes: the primary of a replica
/// set, the routers of a sharded cluster, or the single server.
pub fn select_writable<'a>(description: &'a ClusterDescription) -> Vec<&'a ServerDescription> {
    select(description, &ReadPreference::primary())
}

fn available<'a, F>(description: &'a ClusterDescription, filter: F) -> Vec<&'a ServerDescription>
    where F: Fn(&ServerDescription) -> bool
{
    description.servers
        .values()
        .filter(|server| server.is_available() && filter(server))
        .collect()
}

fn select_replica_set<'a>(description: &'a ClusterDescription, read_preference: &ReadPreference)
                          -> Vec<&'a ServerDescription> {
    let primaries = available(description, |s| s.is_primary());

    match read_preference.mode {
        ReadMode::Primary => primaries,
        ReadMode::PrimaryPreferred => {
            if primaries.is_empty() {
                eligible_secondaries(description, read_preference)
            } else {
                primaries
            }
        }
        ReadMode::Secondary => eligible_secondaries(description, read_preference),
        ReadMode::SecondaryPreferred => {
            let secondaries = eligible_secondaries(description, read_preference);
            if secondaries.is_empty() {
                primaries
            } else {
                secondaries
            }
        }
        ReadMode::Nearest => {
            let members = available(description, |s| s.is_primary() || s.is_secondary());
            let members = filter_stale(description, members, read_preference.max_staleness);
            filter_tag_sets(members, &read_preference.tag_sets)
        }
    }
}

fn eligible_secondaries<'a>(description: &'a ClusterDescription, read_preference: &ReadPreference)
                            -> Vec<&'a ServerDescription> {
    let secondaries = available(description, |s| s.is_secondary());
    let secondaries = filter_stale(description, secondaries, read_preference.max_staleness);
    filter_tag_sets(secondaries, &read_preference.tag_sets)
}

fn duration_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> i64 {
    later.signed_duration_since(earlier).num_milliseconds()
}

/// Estimates how far a secondary lags behind, in milliseconds. Returns
/// None when the server reported no write date.
pub fn staleness(description: &ClusterDescription, server: &ServerDescription) -> Option<i64> {
    if !server.is_secondary() {
        return Some(0);
    }

    let last_write = server.last_write_date?;
    let heartbeat = description.heartbeat_frequency.as_millis() as i64;

    match description.primary() {
        Some(primary) => {
            let primary_write = primary.last_write_date?;
            let lag = duration_between(server.last_update_time, last_write) -
                      duration_between(primary.last_update_time, primary_write);
            Some(lag + heartbeat)
        }
        None => {
            let freshest = description.servers
                .values()
                .filter(|s| s.is_available() && s.is_secondary())
                .filter_map(|s| s.last_write_date)
                .max()?;
            Some(duration_between(freshest, last_write) + heartbeat)
        }
    }
}

fn filter_stale<'a>(description: &ClusterDescription, servers: Vec<&'a ServerDescription>,
                    max_staleness: Option<Duration>) -> Vec<&'a ServerDescription> {
    let max = match max_staleness {
        Some(max) => max.as_millis() as i64,
        None => return servers,
    };

    servers.into_iter()
        .filter(|server| staleness(description, server).map_or(true, |lag| lag <= max))
        .collect()
}

// The first tag set matching at least one server decides. If none match,
// no tag filtering is applied.
fn filter_tag_sets<'a>(servers: Vec<&'a ServerDescription>, tag_sets: &[TagSet])
                       -> Vec<&'a ServerDescription> {
    for tag_set in tag_sets {
        let matched = servers.iter()
            .cloned()
            .filter(|server| server.matches_tag_set(tag_set))
            .collect::<Vec<_>>();
        if !matched.is_empty() {
            return matched;
        }
    }
    servers
}

fn within_latency_window<'a>(servers: Vec<&'a ServerDescription>, local_threshold: Duration)
                             -> Vec<&'a ServerDescription> {
    let fastest = match servers.iter().filter_map(|s| s.round_trip_time).min() {
        Some(fastest) => fastest,
        None => return servers,
    };
    let limit = fastest + local_threshold;

    servers.into_iter()
        .filter(|server| server.round_trip_time.map_or(true, |rtt| rtt <= limit))
        .collect()
}
