//! The client-side runtime of a MongoDB-style driver: topology discovery and
//! monitoring, server selection, per-server connection pooling, and request
//! pinning.
//!
//! The wire protocol is not part of this crate. Health checks and
//! connections are delegated to a `Prober` and a `Connector`, so the same
//! runtime drives real TCP connections or in-memory test doubles.
//!
//! ```no_run
//! use mongo_driver_core::{Cluster, ClusterSettings, ReadPreference, ServerAddress};
//! use mongo_driver_core::stream::{Prober, StreamConnector};
//! # use mongo_driver_core::Result;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # struct WireProber;
//! # impl Prober for WireProber {
//! #     fn probe(&self, _: &ServerAddress, _: Duration) -> Result<mongo_driver_core::bson::Document> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! # fn main() -> Result<()> {
//! let settings = ClusterSettings::with_seeds(vec![ServerAddress::new("localhost", 27017)]);
//! let cluster = Cluster::new(settings, Arc::new(StreamConnector::Tcp), Arc::new(WireProber))?;
//!
//! let server = cluster.select_server(&ReadPreference::secondary_preferred())?;
//! let connection = cluster.acquire_connection(server.address(), None, None)?;
//! // Run the operation, then drop the connection to return it to the pool.
//! drop(connection);
//! # Ok(())
//! # }
//! ```
extern crate arc_swap;
#[cfg_attr(test, macro_use)]
pub extern crate bson;
extern crate chrono;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate tracing;

pub mod cancel;
pub mod common;
pub mod connstring;
pub mod error;
pub mod event;
pub mod failpoint;
pub mod options;
pub mod pool;
pub mod request;
pub mod stream;
pub mod topology;

pub use cancel::CancellationToken;
pub use common::{ReadMode, ReadPreference, TagSet};
pub use connstring::ServerAddress;
pub use error::{Error, Result};
pub use options::{ClusterSettings, ConnectionMode, ConnectionPoolSettings};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use request::{RequestGuard, RequestScope};
pub use topology::{Cluster, ClusterDescription, SelectedServer, ServerDescription, ServerState,
                   ServerType, TopologyType};
