use bson;

use mongo_driver_core::{CancellationToken, Cluster, ConnectionMode, Error, ReadPreference, Result,
                        ServerAddress, ServerDescription, ServerState, ServerType, TopologyType};
use mongo_driver_core::event::{ClusterEvent, Listener};
use mongo_driver_core::failpoint::{FailPointAction, FailPointMode, FailPointProber, FailPoints};
use mongo_driver_core::stream::Prober;
use mongo_driver_core::topology::RoundTripTime;

use mock::{address, fast_settings, primary, secondary, standalone, wait_until, MockConnector,
           MockProber};

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn start(seeds: &[&str], prober: Arc<MockProber>) -> Cluster {
    Cluster::new(fast_settings(seeds), Arc::new(MockConnector::new()), prober).unwrap()
}

#[test]
fn discovers_replica_set_members() {
    let prober = Arc::new(MockProber::new());
    let hosts = ["a:27017", "b:27017"];
    prober.reply(&address("a:27017"), primary("a:27017", &hosts));
    prober.reply(&address("b:27017"), secondary("b:27017", &hosts));

    let cluster = start(&["a:27017"], prober.clone());
    wait_until("the secondary is discovered", || {
        let description = cluster.description();
        description.topology_type == TopologyType::ReplicaSetWithPrimary &&
        description.server(&address("b:27017")).map_or(false, |s| s.is_secondary())
    });

    let server = cluster.select_server(&ReadPreference::secondary()).unwrap();
    assert_eq!(*server.address(), address("b:27017"));
    assert_eq!(server.description.server_type, ServerType::ReplicaSetSecondary);

    let writable = cluster.select_writable_server().unwrap();
    assert_eq!(*writable.address(), address("a:27017"));
}

#[test]
fn selection_waits_for_a_server() {
    let prober = Arc::new(MockProber::new());
    let cluster = start(&["a:27017"], prober.clone());

    let selector = {
        let cluster = cluster.clone();
        thread::spawn(move || {
            cluster.select_server_with(&ReadPreference::primary(), Some(Duration::from_secs(5)), None)
                .map(|server| server.address().clone())
        })
    };

    thread::sleep(Duration::from_millis(100));
    prober.reply(&address("a:27017"), standalone());

    assert_eq!(selector.join().unwrap().unwrap(), address("a:27017"));
    assert_eq!(cluster.description().topology_type, TopologyType::Single);
}

#[test]
fn selection_timeout_reports_topology_state() {
    let prober = Arc::new(MockProber::new());
    let cluster = start(&["a:27017", "b:27017"], prober);

    let start = Instant::now();
    let result = cluster.select_server_with(&ReadPreference::nearest(),
                                            Some(Duration::from_millis(200)), None);
    match result {
        Err(ref err @ Error::SelectionTimeout { .. }) => {
            assert!(err.is_retryable());
            if let Error::SelectionTimeout { server_count, candidate_count, topology_type, .. } = *err {
                assert_eq!(server_count, 2);
                assert_eq!(candidate_count, 0);
                assert_eq!(topology_type, TopologyType::Unknown);
            }
        }
        other => panic!("expected SelectionTimeout, got {:?}", other.map(|s| s.description)),
    }
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[test]
fn selection_can_be_cancelled() {
    let prober = Arc::new(MockProber::new());
    let cluster = start(&["a:27017"], prober);
    let token = CancellationToken::new();

    let selector = {
        let cluster = cluster.clone();
        let token = token.clone();
        thread::spawn(move || {
            cluster.select_server_with(&ReadPreference::primary(), Some(Duration::from_secs(5)),
                                       Some(&token))
                .map(|_| ())
        })
    };

    thread::sleep(Duration::from_millis(50));
    let cancelled_at = Instant::now();
    token.cancel();
    match selector.join().unwrap() {
        Err(Error::Cancelled) => (),
        other => panic!("expected Cancelled, got {:?}", other),
    }
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
}

#[test]
fn invalid_read_preference_is_rejected_before_waiting() {
    let cluster = start(&["a:27017"], Arc::new(MockProber::new()));
    let stale = ReadPreference::secondary().with_max_staleness(Duration::from_secs(1)).unwrap();
    match cluster.select_server(&stale) {
        Err(Error::ArgumentError(_)) => (),
        other => panic!("expected ArgumentError, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn failed_heartbeat_disconnects_and_clears_pool() {
    let prober = Arc::new(MockProber::new());
    prober.reply(&address("a:27017"), standalone());
    let cluster = start(&["a:27017"], prober.clone());

    let server = cluster.select_server(&ReadPreference::primary()).unwrap();
    let conn = cluster.acquire_connection(server.address(), None, None).unwrap();

    prober.fail(&address("a:27017"));
    cluster.request_check(&address("a:27017")).unwrap();
    wait_until("the server is disconnected", || {
        cluster.description()
            .server(&address("a:27017"))
            .map_or(false, |s| s.state == ServerState::Disconnected)
    });

    assert!(conn.is_stale());
    assert!(server.pool().generation().unwrap() >= 1);

    match cluster.acquire_connection(server.address(), None, None) {
        Err(ref err @ Error::ServerUnavailable { .. }) => assert!(err.is_retryable()),
        other => panic!("expected ServerUnavailable, got {:?}", other),
    }
}

#[test]
fn network_errors_clear_the_pool() {
    let prober = Arc::new(MockProber::new());
    prober.reply(&address("a:27017"), standalone());
    let cluster = start(&["a:27017"], prober);
    let server = cluster.select_server(&ReadPreference::primary()).unwrap();
    let before = server.pool().generation().unwrap();

    let logic_error = Error::OperationError("duplicate key".to_owned());
    cluster.handle_operation_error(server.address(), &logic_error).unwrap();
    assert_eq!(server.pool().generation().unwrap(), before);

    let network_error = Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
    cluster.handle_operation_error(server.address(), &network_error).unwrap();
    assert_eq!(server.pool().generation().unwrap(), before + 1);
}

#[test]
fn removed_member_is_forgotten() {
    let prober = Arc::new(MockProber::new());
    prober.reply(&address("a:27017"), primary("a:27017", &["a:27017"]));
    let cluster = start(&["a:27017", "b:27017"], prober);

    wait_until("b is removed", || cluster.description().server(&address("b:27017")).is_none());
    assert!(cluster.server(&address("b:27017")).unwrap().is_none());
    assert!(cluster.server(&address("a:27017")).unwrap().is_some());
}

#[test]
fn subscribers_see_description_changes() {
    let cluster = start(&["a:27017"], Arc::new(MockProber::new()));
    let changes = cluster.subscribe().unwrap();

    let server = ::mongo_driver_core::ServerDescription::new(address("a:27017"));
    cluster.update_server_description(server).unwrap();

    let change = changes.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(change.new.revision, change.old.revision + 1);
    assert!(cluster.description().revision >= change.new.revision);
}

#[test]
fn hooks_see_heartbeats() {
    let listener = Arc::new(Listener::new());
    let heartbeats = Arc::new(AtomicUsize::new(0));
    {
        let heartbeats = heartbeats.clone();
        listener.add_hook(Box::new(move |event: &ClusterEvent| {
            if let ClusterEvent::ServerHeartbeatSucceeded { .. } = *event {
                heartbeats.fetch_add(1, Ordering::SeqCst);
            }
        })).unwrap();
    }

    let prober = Arc::new(MockProber::new());
    prober.reply(&address("a:27017"), standalone());
    let _cluster = Cluster::with_listener(fast_settings(&["a:27017"]), Arc::new(MockConnector::new()),
                                          prober, listener)
        .unwrap();

    wait_until("two heartbeats succeed", || heartbeats.load(Ordering::SeqCst) >= 2);
}

#[test]
fn fail_points_disconnect_a_server_until_disabled() {
    let inner = MockProber::new();
    inner.reply(&address("a:27017"), standalone());
    let fail_points = FailPoints::new();
    fail_points.enable(&address("a:27017"), FailPointMode::AlwaysOn, FailPointAction::Error);

    let prober = Arc::new(FailPointProber::new(inner, fail_points.clone()));
    let cluster = Cluster::new(fast_settings(&["a:27017"]), Arc::new(MockConnector::new()), prober)
        .unwrap();

    wait_until("the server is disconnected", || {
        cluster.description()
            .server(&address("a:27017"))
            .map_or(false, |s| s.state == ServerState::Disconnected)
    });

    fail_points.disable(&address("a:27017"));
    let server = cluster.select_server(&ReadPreference::primary()).unwrap();
    assert_eq!(server.description.server_type, ServerType::Standalone);
}

#[test]
fn shutdown_stops_monitoring() {
    let prober = Arc::new(MockProber::new());
    prober.reply(&address("a:27017"), standalone());
    let cluster = start(&["a:27017"], prober.clone());
    cluster.select_server(&ReadPreference::primary()).unwrap();

    cluster.shutdown();
    assert!(!cluster.is_running());
    match cluster.select_server(&ReadPreference::primary()) {
        Err(Error::OperationError(_)) => (),
        other => panic!("expected OperationError, got {:?}", other.map(|_| ())),
    }

    thread::sleep(Duration::from_millis(250));
    let probes = prober.probes();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(prober.probes(), probes);
}

#[test]
fn dropping_the_cluster_stops_monitoring() {
    let prober = Arc::new(MockProber::new());
    prober.reply(&address("a:27017"), standalone());
    let cluster = start(&["a:27017"], prober.clone());
    cluster.select_server(&ReadPreference::primary()).unwrap();
    drop(cluster);

    thread::sleep(Duration::from_millis(250));
    let probes = prober.probes();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(prober.probes(), probes);
}

#[test]
fn direct_mode_requires_one_seed() {
    let mut settings = fast_settings(&["a:27017", "b:27017"]);
    settings.connection_mode = ConnectionMode::Direct;
    let result = Cluster::new(settings, Arc::new(MockConnector::new()), Arc::new(MockProber::new()));
    match result {
        Err(Error::ArgumentError(_)) => (),
        other => panic!("expected ArgumentError, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn round_trip_time_is_a_moving_average() {
    let mut rtt = RoundTripTime::new();
    rtt.add_sample(Duration::from_millis(10));
    rtt.add_sample(Duration::from_millis(20));
    let average = rtt.add_sample(Duration::from_millis(20));

    // 10 -> 12 -> 13.6
    assert_relative_eq!(average.as_secs_f64() * 1000.0, 13.6, epsilon = 1e-6);
}

// Runs `f` on a separate thread and reports whether it finished in time.
fn finishes<F: FnOnce() -> bool + Send + 'static>(f: F) -> bool {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(5)) == Ok(true)
}

#[test]
fn pool_cleared_hook_may_call_back_into_the_cluster() {
    let slot: Arc<Mutex<Option<Cluster>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));
    let listener = Arc::new(Listener::new());
    {
        let slot = slot.clone();
        let calls = calls.clone();
        listener.add_hook(Box::new(move |event: &ClusterEvent| {
            if let ClusterEvent::PoolCleared { ref address, .. } = *event {
                let cluster = slot.lock().unwrap().clone();
                if let Some(cluster) = cluster {
                    cluster.request_check(address).unwrap();
                    assert!(cluster.server(address).unwrap().is_some());
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            }
        })).unwrap();
    }

    let prober = Arc::new(MockProber::new());
    prober.reply(&address("a:27017"), standalone());
    let cluster = Cluster::with_listener(fast_settings(&["a:27017"]), Arc::new(MockConnector::new()),
                                         prober, listener)
        .unwrap();
    cluster.select_server(&ReadPreference::primary()).unwrap();
    *slot.lock().unwrap() = Some(cluster.clone());

    let handle = cluster.clone();
    let finished = finishes(move || {
        let err = Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        handle.handle_operation_error(&address("a:27017"), &err).is_ok()
    });
    *slot.lock().unwrap() = None;

    assert!(finished, "handling the error deadlocked");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn removed_server_closes_connections_outside_the_cluster_locks() {
    let slot: Arc<Mutex<Option<Cluster>>> = Arc::new(Mutex::new(None));
    let closed = Arc::new(AtomicUsize::new(0));
    let listener = Arc::new(Listener::new());
    {
        let slot = slot.clone();
        let closed = closed.clone();
        listener.add_hook(Box::new(move |event: &ClusterEvent| {
            if let ClusterEvent::ConnectionClosed { ref address, .. } = *event {
                let cluster = slot.lock().unwrap().clone();
                if let Some(cluster) = cluster {
                    cluster.request_check(address).unwrap();
                    let _ = cluster.server(address).unwrap();
                    closed.fetch_add(1, Ordering::SeqCst);
                }
            }
        })).unwrap();
    }

    let prober = Arc::new(MockProber::new());
    let hosts = ["a:27017", "b:27017"];
    prober.reply(&address("a:27017"), primary("a:27017", &hosts));
    prober.reply(&address("b:27017"), secondary("b:27017", &hosts));
    let cluster = Cluster::with_listener(fast_settings(&["a:27017"]), Arc::new(MockConnector::new()),
                                         prober.clone(), listener)
        .unwrap();

    let selected = cluster.select_server(&ReadPreference::secondary()).unwrap();
    assert_eq!(*selected.address(), address("b:27017"));
    drop(selected.pool().acquire().unwrap());
    drop(selected);
    *slot.lock().unwrap() = Some(cluster.clone());

    prober.reply(&address("a:27017"), primary("a:27017", &["a:27017"]));
    wait_until("the secondary is removed", || {
        cluster.description().server(&address("b:27017")).is_none()
    });
    wait_until("its idle connection is closed", || closed.load(Ordering::SeqCst) >= 1);

    let handle = cluster.clone();
    let finished = finishes(move || handle.select_writable_server().is_ok());
    *slot.lock().unwrap() = None;
    assert!(finished, "selection deadlocked");
}

#[test]
fn subscribers_see_revisions_in_order() {
    let cluster = start(&["a:27017"], Arc::new(MockProber::new()));
    let changes = cluster.subscribe().unwrap();

    let workers = (0..8)
        .map(|_| {
            let cluster = cluster.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    cluster.update_server_description(ServerDescription::new(address("a:27017")))
                        .unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().unwrap();
    }

    let mut last = 0;
    let mut seen = 0;
    while let Ok(changed) = changes.try_recv() {
        assert!(changed.new.revision > last,
                "revision {} arrived after {}", changed.new.revision, last);
        assert_eq!(changed.old.revision + 1, changed.new.revision);
        last = changed.new.revision;
        seen += 1;
    }
    assert!(seen >= 8 * 200);
}

#[test]
fn unbounded_selection_waits_for_a_server() {
    let prober = Arc::new(MockProber::new());
    let cluster = start(&["a:27017"], prober.clone());

    let selector = {
        let cluster = cluster.clone();
        thread::spawn(move || {
            cluster.select_server_with(&ReadPreference::primary(),
                                       Some(Duration::from_secs(u64::max_value())), None)
                .map(|server| server.address().clone())
        })
    };

    thread::sleep(Duration::from_millis(100));
    prober.reply(&address("a:27017"), standalone());
    assert_eq!(selector.join().unwrap().unwrap(), address("a:27017"));
}

// Records when each health check reaches the server.
#[derive(Default)]
struct RecordingProber {
    inner: MockProber,
    checks: Mutex<Vec<Instant>>,
}

impl Prober for RecordingProber {
    fn probe(&self, address: &ServerAddress, timeout: Duration) -> Result<bson::Document> {
        self.checks.lock().unwrap().push(Instant::now());
        self.inner.probe(address, timeout)
    }
}

#[test]
fn requested_checks_are_spaced_by_the_minimum_frequency() {
    let prober = Arc::new(RecordingProber::default());
    prober.inner.reply(&address("a:27017"), standalone());
    let mut settings = fast_settings(&["a:27017"]);
    settings.heartbeat_frequency = Duration::from_secs(10);
    settings.min_heartbeat_frequency = Duration::from_millis(300);
    let cluster = Cluster::new(settings, Arc::new(MockConnector::new()), prober.clone()).unwrap();
    cluster.select_server(&ReadPreference::primary()).unwrap();
    thread::sleep(Duration::from_millis(500));

    let start = Instant::now();
    for _ in 0..50 {
        cluster.request_check(&address("a:27017")).unwrap();
    }
    thread::sleep(Duration::from_secs(1));

    let checks = prober.checks.lock().unwrap()
        .iter()
        .cloned()
        .filter(|at| *at >= start)
        .collect::<Vec<_>>();
    assert!(!checks.is_empty());
    assert!(checks.len() <= 2, "{} checks for one burst of requests", checks.len());
    for pair in checks.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(250));
    }
}

#[test]
fn single_heartbeat_failure_is_retried_before_clearing_the_pool() {
    let inner = Arc::new(MockProber::new());
    inner.reply(&address("a:27017"), standalone());
    let fail_points = FailPoints::new();
    let prober = Arc::new(FailPointProber::new(inner.clone(), fail_points.clone()));

    let failures = Arc::new(AtomicUsize::new(0));
    let listener = Arc::new(Listener::new());
    {
        let failures = failures.clone();
        listener.add_hook(Box::new(move |event: &ClusterEvent| {
            if let ClusterEvent::ServerHeartbeatFailed { .. } = *event {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        })).unwrap();
    }

    let mut settings = fast_settings(&["a:27017"]);
    settings.heartbeat_frequency = Duration::from_secs(10);
    let cluster = Cluster::with_listener(settings, Arc::new(MockConnector::new()), prober, listener)
        .unwrap();
    let pool = cluster.select_server(&ReadPreference::primary()).unwrap().pool().clone();
    thread::sleep(Duration::from_millis(100));
    let generation = pool.stats().unwrap().generation;
    let answered = inner.probes();

    fail_points.enable(&address("a:27017"), FailPointMode::Times(1), FailPointAction::Error);
    cluster.request_check(&address("a:27017")).unwrap();
    wait_until("the retry reaches the server", || inner.probes() > answered);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(fail_points.mode(&address("a:27017")), FailPointMode::Off);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().unwrap().generation, generation);
    assert_eq!(cluster.description().server(&address("a:27017")).map(|s| s.server_type),
               Some(ServerType::Standalone));

    fail_points.enable(&address("a:27017"), FailPointMode::Times(2), FailPointAction::Error);
    cluster.request_check(&address("a:27017")).unwrap();
    wait_until("the pool is cleared", || pool.stats().unwrap().generation == generation + 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}
