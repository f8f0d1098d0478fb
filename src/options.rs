//! Cluster and connection pool settings.
//!
//! Settings are produced by an outer configuration layer and handed to
//! `Cluster::new`; nothing in this crate reads process-wide configuration.
//! All durations deserialize from integer milliseconds.
use common::ReadPreference;
use connstring::ServerAddress;
use error::Error::ArgumentError;
use error::Result;

use std::time::Duration;

pub const DEFAULT_HEARTBEAT_FREQUENCY_MS: u64 = 10_000;
pub const DEFAULT_MIN_HEARTBEAT_FREQUENCY_MS: u64 = 500;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SERVER_SELECTION_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_MIN_POOL_SIZE: usize = 0;
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;
pub const DEFAULT_MAX_IDLE_TIME_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_MAX_LIFE_TIME_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_WAIT_QUEUE_TIMEOUT_MS: u64 = 2 * 60 * 1000;
pub const DEFAULT_WAIT_QUEUE_MULTIPLE: usize = 5;
pub const DEFAULT_MAX_CONNECTING: usize = 2;

// Staleness is estimated from heartbeats, so the bound must leave room
// for at least one heartbeat plus the server's idle write period.
const IDLE_WRITE_PERIOD_MS: u64 = 10_000;

/// How the seed list is interpreted when the cluster starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ConnectionMode {
    /// Discover the topology type from the first replies.
    Automatic,
    /// Talk to the single seed regardless of its role.
    Direct,
    /// Expect the seeds to be members of a replica set.
    ReplicaSet,
    /// Expect the seeds to be shard routers.
    Sharded,
}

impl Default for ConnectionMode {
    fn default() -> ConnectionMode {
        ConnectionMode::Automatic
    }
}

/// Settings for one server's connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionPoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    #[serde(with = "::options::duration_ms")]
    pub max_idle_time: Duration,
    #[serde(with = "::options::duration_ms")]
    pub max_life_time: Duration,
    #[serde(with = "::options::duration_ms")]
    pub wait_queue_timeout: Duration,
    pub wait_queue_size: usize,
    /// How many connections a pool may be opening at the same time.
    pub max_connecting: usize,
}

impl Default for ConnectionPoolSettings {
    fn default() -> ConnectionPoolSettings {
        ConnectionPoolSettings {
            min_size: DEFAULT_MIN_POOL_SIZE,
            max_size: DEFAULT_MAX_POOL_SIZE,
            max_idle_time: Duration::from_millis(DEFAULT_MAX_IDLE_TIME_MS),
            max_life_time: Duration::from_millis(DEFAULT_MAX_LIFE_TIME_MS),
            wait_queue_timeout: Duration::from_millis(DEFAULT_WAIT_QUEUE_TIMEOUT_MS),
            wait_queue_size: DEFAULT_WAIT_QUEUE_MULTIPLE * DEFAULT_MAX_POOL_SIZE,
            max_connecting: DEFAULT_MAX_CONNECTING,
        }
    }
}

impl ConnectionPoolSettings {
    /// Returns settings bounded to `max_size` connections, with the wait
    /// queue scaled to match.
    pub fn with_max_size(max_size: usize) -> ConnectionPoolSettings {
        ConnectionPoolSettings {
            max_size: max_size,
            wait_queue_size: DEFAULT_WAIT_QUEUE_MULTIPLE * max_size,
            ..ConnectionPoolSettings::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(ArgumentError("The maximum pool size must be greater than zero.".to_owned()));
        }
        if self.max_connecting == 0 {
            return Err(ArgumentError(
                "The number of concurrently opening connections must be greater than zero."
                    .to_owned()));
        }
        if self.min_size > self.max_size {
            return Err(ArgumentError(format!(
                "The minimum pool size ({}) cannot exceed the maximum pool size ({}).",
                self.min_size, self.max_size)));
        }
        Ok(())
    }
}

/// Settings for discovering and monitoring a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSettings {
    pub seeds: Vec<ServerAddress>,
    pub replica_set_name: Option<String>,
    pub connection_mode: ConnectionMode,
    #[serde(with = "::options::duration_ms")]
    pub heartbeat_frequency: Duration,
    #[serde(with = "::options::duration_ms")]
    pub min_heartbeat_frequency: Duration,
    #[serde(with = "::options::duration_ms")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "::options::duration_ms")]
    pub server_selection_timeout: Duration,
    pub read_preference: ReadPreference,
    pub pool: ConnectionPoolSettings,
}

impl Default for ClusterSettings {
    fn default() -> ClusterSettings {
        ClusterSettings {
            seeds: Vec::new(),
            replica_set_name: None,
            connection_mode: ConnectionMode::Automatic,
            heartbeat_frequency: Duration::from_millis(DEFAULT_HEARTBEAT_FREQUENCY_MS),
            min_heartbeat_frequency: Duration::from_millis(DEFAULT_MIN_HEARTBEAT_FREQUENCY_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            server_selection_timeout: Duration::from_millis(DEFAULT_SERVER_SELECTION_TIMEOUT_MS),
            read_preference: ReadPreference::primary(),
            pool: ConnectionPoolSettings::default(),
        }
    }
}

impl ClusterSettings {
    /// Returns default settings for the given seed list.
    pub fn with_seeds(seeds: Vec<ServerAddress>) -> ClusterSettings {
        ClusterSettings {
            seeds: seeds,
            ..ClusterSettings::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(ArgumentError("At least one seed address is required.".to_owned()));
        }
        if self.connection_mode == ConnectionMode::Direct && self.seeds.len() > 1 {
            return Err(ArgumentError(
                "A direct connection cannot be used with multiple seeds.".to_owned()));
        }
        if self.replica_set_name.is_some() &&
           (self.connection_mode == ConnectionMode::Sharded ||
            self.connection_mode == ConnectionMode::Direct) {
            return Err(ArgumentError(format!(
                "A replica set name cannot be combined with the {:?} connection mode.",
                self.connection_mode)));
        }
        if self.heartbeat_frequency < self.min_heartbeat_frequency {
            return Err(ArgumentError(
                "The heartbeat frequency cannot be shorter than the minimum heartbeat frequency."
                    .to_owned()));
        }
        self.read_preference.validate()?;
        self.check_max_staleness(&self.read_preference)?;
        self.pool.validate()
    }

    /// Rejects a max staleness too small to be measured with this
    /// heartbeat frequency.
    pub fn check_max_staleness(&self, read_preference: &ReadPreference) -> Result<()> {
        if let Some(max_staleness) = read_preference.max_staleness {
            let floor = self.heartbeat_frequency + Duration::from_millis(IDLE_WRITE_PERIOD_MS);
            if max_staleness < floor {
                return Err(ArgumentError(format!(
                    "Max staleness ({:?}) must be at least the heartbeat frequency plus the \
                     idle write period ({:?}).",
                    max_staleness, floor)));
            }
        }
        Ok(())
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where D: Deserializer<'de>
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

pub(crate) mod duration_ms_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where D: Deserializer<'de>
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
