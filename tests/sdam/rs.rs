use bson::oid::ObjectId;

use mongo_driver_core::{ConnectionMode, ServerState, ServerType, TopologyType};

use mock::{address, primary, secondary, standalone};
use super::framework::{assert_hosts, network_error, reply, start};

fn primary_with_election(me: &str, hosts: &[&str], set_version: i32, election: u8) -> ::bson::Document {
    let mut doc = primary(me, hosts);
    doc.insert("setVersion", set_version);
    doc.insert("electionId", ObjectId::with_bytes([election; 12]));
    doc
}

#[test]
fn discover_members_from_primary() {
    let description = start(&["a:27017"], ConnectionMode::Automatic, None);
    let update = reply(&description, "a:27017", primary("a:27017", &["a:27017", "b:27017", "c:27017"]));

    assert_eq!(update.description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(update.description.set_name, Some("rs".to_owned()));
    assert_hosts(&update.description, &["a:27017", "b:27017", "c:27017"]);
    assert_eq!(update.added.len(), 2);
    assert!(update.removed.is_empty());

    let b = update.description.server(&address("b:27017")).unwrap();
    assert_eq!(b.server_type, ServerType::Unknown);
    assert_eq!(b.state, ServerState::Connecting);
}

#[test]
fn secondary_without_primary() {
    let description = start(&["a:27017"], ConnectionMode::Automatic, None);
    let update = reply(&description, "a:27017", secondary("a:27017", &["a:27017", "b:27017"]));

    assert_eq!(update.description.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert_hosts(&update.description, &["a:27017", "b:27017"]);
}

#[test]
fn member_of_another_set_is_removed() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::Automatic, Some("rs"));
    assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);

    let mut doc = secondary("b:27017", &["a:27017", "b:27017"]);
    doc.insert("setName", "other");
    let update = reply(&description, "b:27017", doc);

    assert_hosts(&update.description, &["a:27017"]);
    assert_eq!(update.removed, vec![address("b:27017")]);
}

#[test]
fn member_with_wrong_me_is_removed() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::ReplicaSet, None);
    let update = reply(&description, "b:27017",
                       secondary("c:27017", &["a:27017", "b:27017", "c:27017"]));

    assert_eq!(update.description.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert_hosts(&update.description, &["a:27017", "c:27017"]);
}

#[test]
fn primary_removes_unlisted_hosts() {
    let description = start(&["a:27017", "b:27017", "c:27017"], ConnectionMode::Automatic, None);
    let update = reply(&description, "a:27017", primary("a:27017", &["a:27017", "b:27017"]));

    assert_hosts(&update.description, &["a:27017", "b:27017"]);
    assert_eq!(update.removed, vec![address("c:27017")]);
}

#[test]
fn new_primary_demotes_old_one() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::Automatic, None);
    let hosts = ["a:27017", "b:27017"];
    let first = reply(&description, "a:27017", primary("a:27017", &hosts));
    let second = reply(&first.description, "b:27017", primary("b:27017", &hosts));

    let description = second.description;
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(description.primary().unwrap().address, address("b:27017"));
    assert_eq!(description.servers.values().filter(|s| s.is_primary()).count(), 1);
    assert_eq!(description.server(&address("a:27017")).unwrap().server_type, ServerType::Unknown);
    assert_eq!(second.demoted, vec![address("a:27017")]);
}

#[test]
fn primary_with_older_election_id_is_stale() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::Automatic, None);
    let hosts = ["a:27017", "b:27017"];
    let first = reply(&description, "a:27017", primary_with_election("a:27017", &hosts, 1, 2));
    let second = reply(&first.description, "b:27017", primary_with_election("b:27017", &hosts, 1, 1));

    let description = second.description;
    assert_eq!(description.primary().unwrap().address, address("a:27017"));
    assert_eq!(description.server(&address("b:27017")).unwrap().server_type, ServerType::Unknown);
    assert!(second.demoted.is_empty());
}

#[test]
fn higher_set_version_wins() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::Automatic, None);
    let hosts = ["a:27017", "b:27017"];
    let first = reply(&description, "a:27017", primary_with_election("a:27017", &hosts, 1, 9));
    let second = reply(&first.description, "b:27017", primary_with_election("b:27017", &hosts, 2, 1));

    assert_eq!(second.description.primary().unwrap().address, address("b:27017"));
    assert_eq!(second.demoted, vec![address("a:27017")]);
}

#[test]
fn losing_the_primary() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::Automatic, None);
    let hosts = ["a:27017", "b:27017"];
    let update = reply(&description, "a:27017", primary("a:27017", &hosts));
    let update = network_error(&update.description, "a:27017");

    assert_eq!(update.description.topology_type, TopologyType::ReplicaSetNoPrimary);
    let a = update.description.server(&address("a:27017")).unwrap();
    assert_eq!(a.state, ServerState::Disconnected);
    assert!(a.error.is_some());
    assert_hosts(&update.description, &hosts);
}

#[test]
fn standalone_is_removed_from_replica_set() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::ReplicaSet, None);
    let update = reply(&description, "a:27017", standalone());

    assert_hosts(&update.description, &["b:27017"]);
    assert_eq!(update.description.topology_type, TopologyType::ReplicaSetNoPrimary);
}

#[test]
fn ghost_is_kept_without_changes() {
    let description = start(&["a:27017"], ConnectionMode::Automatic, None);
    let update = reply(&description, "a:27017", doc! { "ok": 1, "isreplicaset": true });

    assert_eq!(update.description.topology_type, TopologyType::Unknown);
    assert_eq!(update.description.server(&address("a:27017")).unwrap().server_type,
               ServerType::ReplicaSetOther);
}

#[test]
fn every_update_bumps_the_revision() {
    let description = start(&["a:27017"], ConnectionMode::Automatic, None);
    let first = reply(&description, "a:27017", secondary("a:27017", &["a:27017"]));
    let second = network_error(&first.description, "a:27017");

    assert_eq!(description.revision, 0);
    assert_eq!(first.description.revision, 1);
    assert_eq!(second.description.revision, 2);
}

#[test]
fn reports_from_removed_servers_are_ignored() {
    let description = start(&["a:27017", "b:27017"], ConnectionMode::Automatic, None);
    let update = reply(&description, "a:27017", primary("a:27017", &["a:27017"]));
    let server = ::mongo_driver_core::ServerDescription::new(address("b:27017"));
    assert!(update.description.apply(server).is_none());
}
