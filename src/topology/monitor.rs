//! Background server monitoring using health-check probes.
use error::Error::ResponseError;
use error::Result;

use connstring::ServerAddress;
use event::{ClusterEvent, Listener};
use options::ClusterSettings;
use pool::ConnectionPool;
use stream::Prober;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::server::{ProbeReply, ServerDescription, ServerType};
use super::{Cluster, ClusterInner};

// Weight of the newest sample in the round-trip average.
const RTT_ALPHA: f64 = 0.2;

/// An exponentially weighted moving average of round-trip times.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RoundTripTime {
    average: Option<Duration>,
}

impl RoundTripTime {
    pub fn new() -> RoundTripTime {
        RoundTripTime::default()
    }

    /// Folds a sample into the average and returns the new average.
    pub fn add_sample(&mut self, sample: Duration) -> Duration {
        let average = match self.average {
            None => sample,
            Some(previous) => {
                let secs = RTT_ALPHA * sample.as_secs_f64() +
                           (1.0 - RTT_ALPHA) * previous.as_secs_f64();
                Duration::from_secs_f64(secs)
            }
        };
        self.average = Some(average);
        average
    }

    pub fn average(&self) -> Option<Duration> {
        self.average
    }

    pub fn reset(&mut self) {
        self.average = None;
    }
}

#[derive(Default)]
struct Signal {
    check_requested: bool,
}

/// The handle a server keeps to its monitor thread.
pub struct MonitorControl {
    running: AtomicBool,
    signal: Mutex<Signal>,
    // To allow servers to request an immediate update, this condvar can be
    // notified to wake up the monitor.
    condvar: Condvar,
}

impl MonitorControl {
    pub fn new() -> MonitorControl {
        MonitorControl {
            running: AtomicBool::new(true),
            signal: Mutex::new(Signal::default()),
            condvar: Condvar::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn request_check(&self) {
        if let Ok(mut signal) = self.signal.lock() {
            signal.check_requested = true;
            self.condvar.notify_one();
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _guard = self.signal.lock();
        self.condvar.notify_all();
    }
}

/// Monitors a server and publishes its descriptions into the cluster.
pub(crate) struct Monitor {
    address: ServerAddress,
    pool: ConnectionPool,
    prober: Arc<dyn Prober>,
    listener: Arc<Listener>,
    control: Arc<MonitorControl>,
    cluster: Weak<ClusterInner>,
    heartbeat_frequency: Duration,
    min_heartbeat_frequency: Duration,
    heartbeat_timeout: Duration,
    round_trip_time: RoundTripTime,
    // The role observed by the previous check.
    last_type: ServerType,
}

impl Monitor {
    pub fn new(address: ServerAddress, settings: &ClusterSettings, pool: ConnectionPool,
               prober: Arc<dyn Prober>, listener: Arc<Listener>, control: Arc<MonitorControl>,
               cluster: Weak<ClusterInner>) -> Monitor {
        Monitor {
            address: address,
            pool: pool,
            prober: prober,
            listener: listener,
            control: control,
            cluster: cluster,
            heartbeat_frequency: settings.heartbeat_frequency,
            min_heartbeat_frequency: settings.min_heartbeat_frequency,
            heartbeat_timeout: settings.heartbeat_timeout,
            round_trip_time: RoundTripTime::new(),
            last_type: ServerType::Unknown,
        }
    }

    /// Checks the server until the monitor is stopped or the cluster goes away.
    pub fn run(mut self) {
        debug!(address = %self.address, "monitor started");

        loop {
            if !self.control.is_running() {
                break;
            }

            let last_check = Instant::now();
            let description = self.check();
            if !self.publish(description) {
                break;
            }

            if let Err(err) = self.pool.perform_maintenance() {
                warn!(address = %self.address, error = %err, "pool maintenance failed");
            }

            if !self.wait_for_next_check(last_check) {
                break;
            }
        }

        debug!(address = %self.address, "monitor stopped");
    }

    // Sleeps until the heartbeat is due, or until a requested check is
    // allowed by the minimum spacing. Returns false once stopped.
    fn wait_for_next_check(&self, last_check: Instant) -> bool {
        let mut signal = match self.control.signal.lock() {
            Ok(signal) => signal,
            Err(_) => return false,
        };

        loop {
            if !self.control.is_running() {
                return false;
            }

            let due = if signal.check_requested {
                self.min_heartbeat_frequency
            } else {
                self.heartbeat_frequency
            };
            let elapsed = last_check.elapsed();
            if elapsed >= due {
                signal.check_requested = false;
                return true;
            }

            signal = match self.control.condvar.wait_timeout(signal, due - elapsed) {
                Ok((signal, _)) => signal,
                Err(_) => return false,
            };
        }
    }

    fn probe(&self) -> Result<(ProbeReply, Duration)> {
        let start = Instant::now();
        let doc = self.prober.probe(&self.address, self.heartbeat_timeout)?;
        let elapsed = start.elapsed();

        let reply = ProbeReply::parse(&doc)?;
        if !reply.ok {
            return Err(ResponseError(format!("{} returned a not-ok probe reply.", self.address)));
        }
        Ok((reply, elapsed))
    }

    // Runs one health check, retrying once when the server was known to be
    // up, and returns the resulting description.
    fn check(&mut self) -> ServerDescription {
        let start = Instant::now();
        let result = match self.probe() {
            Err(ref err) if self.last_type != ServerType::Unknown => {
                debug!(address = %self.address, error = %err, "heartbeat failed, retrying once");
                self.probe()
            }
            result => result,
        };

        match result {
            Ok((reply, sample)) => {
                let average = self.round_trip_time.add_sample(sample);
                self.listener.emit(ClusterEvent::ServerHeartbeatSucceeded {
                    address: self.address.clone(),
                    round_trip_time: sample,
                });
                let description = ServerDescription::from_reply(self.address.clone(), reply, average);
                self.last_type = description.server_type;
                description
            }
            Err(err) => {
                warn!(address = %self.address, error = %err, "heartbeat failed");
                self.round_trip_time.reset();
                self.last_type = ServerType::Unknown;
                self.listener.emit(ClusterEvent::ServerHeartbeatFailed {
                    address: self.address.clone(),
                    duration: start.elapsed(),
                    message: err.to_string(),
                });

                // Refresh all connections.
                if let Err(err) = self.pool.invalidate() {
                    warn!(address = %self.address, error = %err, "failed to clear connection pool");
                }
                ServerDescription::disconnected(self.address.clone(), err)
            }
        }
    }

    // Returns false when the cluster is gone.
    fn publish(&self, description: ServerDescription) -> bool {
        let inner = match self.cluster.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let cluster = Cluster::from_inner(inner);
        if let Err(err) = cluster.update_server_description(description) {
            info!(address = %self.address, error = %err, "failed to publish server description");
        }
        true
    }
}
