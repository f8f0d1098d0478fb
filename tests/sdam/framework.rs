use bson;

use mongo_driver_core::{ClusterDescription, ClusterSettings, ConnectionMode, Error};
use mongo_driver_core::topology::{DescriptionUpdate, ProbeReply, ServerDescription};

use mock::address;

use std::io;
use std::time::Duration;

/// Starts a description from a seed list, as `Cluster::new` would.
pub fn start(seeds: &[&str], mode: ConnectionMode, set_name: Option<&str>) -> ClusterDescription {
    let mut settings = ClusterSettings::with_seeds(seeds.iter().map(|s| address(s)).collect());
    settings.connection_mode = mode;
    settings.replica_set_name = set_name.map(|s| s.to_owned());
    ClusterDescription::new(&settings)
}

/// Applies a successful probe reply from the host.
pub fn reply(description: &ClusterDescription, host: &str, doc: bson::Document) -> DescriptionUpdate {
    let reply = ProbeReply::parse(&doc).unwrap();
    let server = ServerDescription::from_reply(address(host), reply, Duration::from_millis(1));
    description.apply(server).expect("host is not part of the topology")
}

/// Applies a failed probe of the host.
pub fn network_error(description: &ClusterDescription, host: &str) -> DescriptionUpdate {
    let err = Error::IoError(io::Error::new(io::ErrorKind::ConnectionReset, "simulated network error"));
    let server = ServerDescription::disconnected(address(host), err);
    description.apply(server).expect("host is not part of the topology")
}

/// Asserts the set of known hosts, ignoring order.
pub fn assert_hosts(description: &ClusterDescription, expected: &[&str]) {
    let mut actual = description.servers.keys().map(|a| a.to_string()).collect::<Vec<_>>();
    actual.sort();
    let mut expected = expected.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    expected.sort();
    assert_eq!(actual, expected);
}
