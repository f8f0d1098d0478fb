//! Fail points for tests and operational drills.
//!
//! A fail point forces one server to look slow or broken for a number of
//! operations or until disabled. They wrap the outbound collaborators, so
//! selection and pooling code never consults them directly.
use bson;

use connstring::ServerAddress;
use error::Result;
use stream::{Connector, Prober, Stream};

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How often a fail point fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPointMode {
    Off,
    /// Fire for the next `n` operations, then turn off.
    Times(usize),
    AlwaysOn,
}

/// What a fail point does when it fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailPointAction {
    /// Delay the operation before letting it proceed.
    Latency(Duration),
    /// Fail the operation with a network error.
    Error,
}

#[derive(Clone, Debug)]
struct FailPoint {
    mode: FailPointMode,
    action: FailPointAction,
}

/// A shared registry of fail points keyed by server address.
#[derive(Clone, Default)]
pub struct FailPoints {
    inner: Arc<Mutex<HashMap<ServerAddress, FailPoint>>>,
}

impl FailPoints {
    pub fn new() -> FailPoints {
        FailPoints::default()
    }

    pub fn enable(&self, address: &ServerAddress, mode: FailPointMode, action: FailPointAction) {
        if let Ok(mut points) = self.inner.lock() {
            points.insert(address.clone(), FailPoint { mode: mode, action: action });
        }
    }

    pub fn disable(&self, address: &ServerAddress) {
        if let Ok(mut points) = self.inner.lock() {
            points.remove(address);
        }
    }

    /// Returns the current mode for the address.
    pub fn mode(&self, address: &ServerAddress) -> FailPointMode {
        self.inner.lock().ok()
            .and_then(|points| points.get(address).map(|p| p.mode))
            .unwrap_or(FailPointMode::Off)
    }

    // Consumes one activation, if any, and applies it.
    fn trigger(&self, address: &ServerAddress) -> Result<()> {
        let action = {
            let mut points = self.inner.lock()?;
            let fire = match points.get_mut(address) {
                Some(point) => {
                    match point.mode {
                        FailPointMode::Off => None,
                        FailPointMode::AlwaysOn => Some(point.action.clone()),
                        FailPointMode::Times(n) => {
                            point.mode = if n <= 1 {
                                FailPointMode::Off
                            } else {
                                FailPointMode::Times(n - 1)
                            };
                            if n == 0 { None } else { Some(point.action.clone()) }
                        }
                    }
                }
                None => None,
            };
            fire
        };

        match action {
            Some(FailPointAction::Latency(delay)) => {
                thread::sleep(delay);
                Ok(())
            }
            Some(FailPointAction::Error) => {
                Err(io::Error::new(io::ErrorKind::ConnectionReset,
                                   format!("fail point triggered for {}", address)).into())
            }
            None => Ok(()),
        }
    }
}

/// A prober that consults fail points before delegating.
pub struct FailPointProber<P> {
    inner: P,
    fail_points: FailPoints,
}

impl<P: Prober> FailPointProber<P> {
    pub fn new(inner: P, fail_points: FailPoints) -> FailPointProber<P> {
        FailPointProber {
            inner: inner,
            fail_points: fail_points,
        }
    }
}

impl<P: Prober> Prober for FailPointProber<P> {
    fn probe(&self, address: &ServerAddress, timeout: Duration) -> Result<bson::Document> {
        self.fail_points.trigger(address)?;
        self.inner.probe(address, timeout)
    }
}

/// A connector that consults fail points before delegating.
pub struct FailPointConnector<C> {
    inner: C,
    fail_points: FailPoints,
}

impl<C: Connector> FailPointConnector<C> {
    pub fn new(inner: C, fail_points: FailPoints) -> FailPointConnector<C> {
        FailPointConnector {
            inner: inner,
            fail_points: fail_points,
        }
    }
}

impl<C: Connector> Connector for FailPointConnector<C> {
    fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Stream>> {
        self.fail_points.trigger(address)?;
        self.inner.connect(address)
    }

    fn close(&self, address: &ServerAddress, stream: Box<dyn Stream>) {
        self.inner.close(address, stream)
    }
}
