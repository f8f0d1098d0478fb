//! Server addresses and host-string parsing.
use error::Error::{self, ArgumentError};
use error::Result;

use serde::de::{self, Deserialize, Deserializer};

use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 27017;

/// Encapsulates the hostname and port of a server. Addresses are the stable
/// key for monitors and connection pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    pub host_name: String,
    pub port: u16,
}

impl ServerAddress {
    /// Creates a new address. The host name is lowercased.
    pub fn new(host_name: &str, port: u16) -> ServerAddress {
        ServerAddress {
            host_name: host_name.to_ascii_lowercase(),
            port: port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host_name.contains(':') {
            write!(fmt, "[{}]:{}", self.host_name, self.port)
        } else {
            write!(fmt, "{}:{}", self.host_name, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_host(s)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        let s = String::deserialize(deserializer)?;
        parse_host(&s).map_err(de::Error::custom)
    }
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ArgumentError(format!("Invalid port '{}'.", port))),
        Ok(val) => Ok(val),
    }
}

fn parse_ipv6_literal_host(entity: &str) -> Result<ServerAddress> {
    match entity.find(']') {
        Some(end) => {
            let host = &entity[1..end];
            let rest = &entity[end + 1..];
            if rest.is_empty() {
                Ok(ServerAddress::new(host, DEFAULT_PORT))
            } else if rest.starts_with(':') {
                Ok(ServerAddress::new(host, parse_port(&rest[1..])?))
            } else {
                Err(ArgumentError(format!("Unexpected characters after IPv6 literal in '{}'.", entity)))
            }
        }
        None => Err(ArgumentError(
            "An IPv6 address must be enclosed in '[' and ']' according to RFC 2732.".to_owned())),
    }
}

/// Parses a host entity of the form `host`, `host:port` or `[ipv6]:port`.
/// All host names are lowercased.
pub fn parse_host(entity: &str) -> Result<ServerAddress> {
    let entity = entity.trim();
    if entity.is_empty() {
        return Err(ArgumentError("Empty host.".to_owned()));
    }

    if entity.starts_with('[') {
        return parse_ipv6_literal_host(entity);
    }

    match entity.find(':') {
        Some(idx) => {
            let (host, port) = (&entity[..idx], &entity[idx + 1..]);
            if port.contains(':') {
                return Err(ArgumentError(
                    "An IPv6 address literal must be enclosed in '[' and ']' according to RFC 2732."
                        .to_owned()));
            }
            if host.is_empty() {
                return Err(ArgumentError(format!("Missing host name in '{}'.", entity)));
            }
            Ok(ServerAddress::new(host, parse_port(port)?))
        }
        None => Ok(ServerAddress::new(entity, DEFAULT_PORT)),
    }
}

/// Splits and parses a comma-separated seed list.
pub fn split_hosts(host_str: &str) -> Result<Vec<ServerAddress>> {
    let mut hosts = Vec::new();
    for entity in host_str.split(',') {
        if entity.trim().is_empty() {
            return Err(ArgumentError("Empty host, or extra comma in host list.".to_owned()));
        }
        let host = parse_host(entity)?;
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    Ok(hosts)
}
