mod framework;

use mongo_driver_core::{ClusterSettings, ReadPreference};
use mongo_driver_core::topology::selector;

use self::framework::{load_description, run_suite, Suite};

use std::fs;
use std::path::Path;

#[test]
fn server_selection_suites() {
    let dir = "tests/server_selection/data/";
    let mut ran = 0;
    for entry in fs::read_dir(&Path::new(dir)).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().map_or(false, |ext| ext == "json") {
            run_suite(&path);
            ran += 1;
        }
    }
    assert!(ran > 0);
}

#[test]
fn writable_selection_ignores_read_preference() {
    let suite = Suite::from_file("tests/server_selection/data/nearest_latency_window.json");
    let description = load_description(&suite);
    let writable = selector::select_writable(&description);
    assert_eq!(writable.len(), 1);
    assert!(writable[0].is_primary());
}

#[test]
fn selection_is_repeatable() {
    let suite = Suite::from_file("tests/server_selection/data/tag_set_fallback.json");
    let description = load_description(&suite);
    let first = selector::select(&description, &suite.read_preference)
        .into_iter()
        .map(|s| s.address.clone())
        .collect::<Vec<_>>();
    let second = selector::select(&description, &suite.read_preference)
        .into_iter()
        .map(|s| s.address.clone())
        .collect::<Vec<_>>();
    assert_eq!(first, second);
}

#[test]
fn max_staleness_must_cover_a_heartbeat() {
    let settings = ClusterSettings::default();
    let too_small = ReadPreference::secondary()
        .with_max_staleness(::std::time::Duration::from_secs(15))
        .unwrap();
    assert!(settings.check_max_staleness(&too_small).is_err());

    let enough = ReadPreference::secondary()
        .with_max_staleness(::std::time::Duration::from_secs(90))
        .unwrap();
    assert!(settings.check_max_staleness(&enough).is_ok());
}
