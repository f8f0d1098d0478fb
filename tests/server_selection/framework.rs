use chrono::{Duration as ChronoDuration, Utc};
use serde_json;

use mongo_driver_core::{ClusterDescription, ClusterSettings, ReadPreference, ServerDescription,
                        ServerState, ServerType, TagSet, TopologyType};
use mongo_driver_core::topology::selector;

use mock::address;

use std::fs::File;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteServer {
    pub address: String,
    #[serde(rename = "type")]
    pub server_type: String,
    pub rtt_ms: u64,
    #[serde(default)]
    pub tags: TagSet,
    pub last_write_ago_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suite {
    pub topology_type: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_frequency_ms: u64,
    pub servers: Vec<SuiteServer>,
    pub read_preference: ReadPreference,
    #[serde(default)]
    pub write: bool,
    pub suitable: Vec<String>,
}

fn default_heartbeat() -> u64 {
    10_000
}

impl Suite {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Suite {
        let file = File::open(path.as_ref()).unwrap();
        serde_json::from_reader(file).unwrap()
    }
}

fn topology_type(s: &str) -> TopologyType {
    match s {
        "Single" => TopologyType::Single,
        "ReplicaSetNoPrimary" => TopologyType::ReplicaSetNoPrimary,
        "ReplicaSetWithPrimary" => TopologyType::ReplicaSetWithPrimary,
        "Sharded" => TopologyType::Sharded,
        _ => TopologyType::Unknown,
    }
}

fn server_type(s: &str) -> ServerType {
    match s {
        "Standalone" => ServerType::Standalone,
        "ReplicaSetPrimary" => ServerType::ReplicaSetPrimary,
        "ReplicaSetSecondary" => ServerType::ReplicaSetSecondary,
        "ReplicaSetArbiter" => ServerType::ReplicaSetArbiter,
        "ReplicaSetOther" => ServerType::ReplicaSetOther,
        "ShardRouter" => ServerType::ShardRouter,
        _ => ServerType::Unknown,
    }
}

pub fn load_description(suite: &Suite) -> ClusterDescription {
    let mut settings = ClusterSettings::default();
    settings.heartbeat_frequency = Duration::from_millis(suite.heartbeat_frequency_ms);

    let mut description = ClusterDescription::new(&settings);
    description.topology_type = topology_type(&suite.topology_type);

    let now = Utc::now();
    for server in &suite.servers {
        let mut desc = ServerDescription::new(address(&server.address));
        desc.server_type = server_type(&server.server_type);
        desc.state = if desc.server_type == ServerType::Unknown {
            ServerState::Disconnected
        } else {
            ServerState::Connected
        };
        desc.round_trip_time = Some(Duration::from_millis(server.rtt_ms));
        desc.tags = server.tags.clone();
        desc.last_update_time = now;
        desc.last_write_date = server.last_write_ago_ms.map(|ago| now - ChronoDuration::milliseconds(ago));
        description.servers.insert(desc.address.clone(), desc);
    }
    description
}

pub fn run_suite(path: &Path) {
    let suite = Suite::from_file(path);
    let description = load_description(&suite);

    let selected = if suite.write {
        selector::select_writable(&description)
    } else {
        selector::select(&description, &suite.read_preference)
    };

    let mut actual = selected.iter().map(|s| s.address.to_string()).collect::<Vec<_>>();
    actual.sort();
    let mut expected = suite.suitable.clone();
    expected.sort();
    assert_eq!(actual, expected, "{}", path.display());
}
