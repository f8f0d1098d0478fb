//! Outbound collaborators: opening connections and health-checking servers.
//!
//! The wire codec lives outside this crate. Pools only need something that
//! can open and close byte streams, and monitors only need something that
//! can run the health-check command and hand back the decoded reply.
use bson;

use connstring::ServerAddress;
use error::Error::OperationError;
use error::Result;

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// A bidirectional byte stream to a server.
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

/// Opens and closes pooled connections.
pub trait Connector: Send + Sync {
    /// Opens a new connection to the server.
    fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Stream>>;

    /// Closes a connection the pool no longer wants.
    fn close(&self, _address: &ServerAddress, stream: Box<dyn Stream>) {
        drop(stream);
    }
}

/// Runs the lightweight health-check command against a server and returns
/// the decoded reply document.
pub trait Prober: Send + Sync {
    fn probe(&self, address: &ServerAddress, timeout: Duration) -> Result<bson::Document>;
}

impl<P: Prober + ?Sized> Prober for Arc<P> {
    fn probe(&self, address: &ServerAddress, timeout: Duration) -> Result<bson::Document> {
        (**self).probe(address, timeout)
    }
}

/// Encapsulates the functionality for how to connect to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamConnector {
    /// Connect to the server through a regular TCP stream.
    Tcp,
    /// Connect through a TCP stream, giving up on each resolved address
    /// after the given timeout.
    TcpWithTimeout(Duration),
}

impl Default for StreamConnector {
    fn default() -> Self {
        StreamConnector::Tcp
    }
}

impl StreamConnector {
    /// Connects to the server, trying every resolved address in turn.
    pub fn connect_tcp(&self, address: &ServerAddress) -> io::Result<TcpStream> {
        let stream = match *self {
            StreamConnector::Tcp => TcpStream::connect((&address.host_name[..], address.port))?,
            StreamConnector::TcpWithTimeout(timeout) => {
                let mut last_err = None;
                let mut connected = None;
                for addr in (&address.host_name[..], address.port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            connected = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                match connected {
                    Some(s) => s,
                    None => {
                        return Err(last_err.unwrap_or_else(|| {
                            io::Error::new(io::ErrorKind::NotFound,
                                           format!("{} did not resolve to any address", address))
                        }))
                    }
                }
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Connector for StreamConnector {
    fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Stream>> {
        match self.connect_tcp(address) {
            Ok(stream) => Ok(Box::new(stream)),
            Err(ref e) if e.kind() == io::ErrorKind::InvalidInput => {
                Err(OperationError(format!("Cannot connect to {}: {}", address, e)))
            }
            Err(e) => Err(e.into()),
        }
    }
}
