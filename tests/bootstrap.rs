//! End to end tests over a local swarm of nodes.

use souk::{Bytes, Config, Dht, Id, Testnet};

#[test]
fn swarm_bootstraps() {
    let testnet = Testnet::new(8).expect("testnet");

    // The seed node starts alone; its self-lookup finds nothing. Once
    // every other node's bootstrap lookup has been answered, the seed
    // has necessarily served their requests and learned about them.
    for node in &testnet.nodes {
        node.bootstrapped().expect("node is running");
    }

    for node in &testnet.nodes {
        assert!(!node.to_bootstrap().expect("node is running").is_empty());
    }
}

#[test]
fn put_get_delete_across_the_swarm() {
    let testnet = Testnet::new(8).expect("testnet");

    let writer = &testnet.nodes[2];
    let reader = &testnet.nodes[6];

    writer.bootstrapped().expect("node is running");
    reader.bootstrapped().expect("node is running");

    let key = Id::random();
    let value = Bytes::from_static(b"listing: hand-thrown ceramic mug");

    writer
        .put(key, value.clone())
        .expect("node is running")
        .expect("put succeeds");

    let values = reader.get(key).expect("node is running");
    assert!(values.contains(&value));

    writer
        .delete(key, Id::hash_of(&value))
        .expect("node is running")
        .expect("delete succeeds");

    let values = writer.get(key).expect("node is running");
    assert!(!values.contains(&value));
}

#[test]
fn multiple_values_under_one_key() {
    let testnet = Testnet::new(6).expect("testnet");

    let first = &testnet.nodes[1];
    let second = &testnet.nodes[4];

    first.bootstrapped().expect("node is running");
    second.bootstrapped().expect("node is running");

    let key = Id::random();
    let a = Bytes::from_static(b"offer from the first node");
    let b = Bytes::from_static(b"offer from the second node");

    first
        .put(key, a.clone())
        .expect("node is running")
        .expect("put succeeds");
    second
        .put(key, b.clone())
        .expect("node is running")
        .expect("put succeeds");

    let values = first.get(key).expect("node is running");
    assert!(values.contains(&a));
    assert!(values.contains(&b));
}

#[test]
fn late_joiner_sees_existing_values() {
    let testnet = Testnet::new(5).expect("testnet");

    let writer = &testnet.nodes[3];
    writer.bootstrapped().expect("node is running");

    let key = Id::random();
    let value = Bytes::from_static(b"published before the reader joined");

    writer
        .put(key, value.clone())
        .expect("node is running")
        .expect("put succeeds");

    let reader = Dht::new(Config {
        bootstrap: testnet.bootstrap.clone(),
        port: Some(0),
        ..Default::default()
    })
    .expect("node");
    reader.bootstrapped().expect("node is running");

    let values = reader.get(key).expect("node is running");
    assert!(values.contains(&value));

    reader.shutdown();
}

#[test]
fn snapshot_survives_restart() {
    let path = std::env::temp_dir().join(format!("souk-e2e-{}.snapshot", rand::random::<u64>()));

    let testnet = Testnet::new(4).expect("testnet");

    let key = Id::random();
    let value = Bytes::from_static(b"persisted listing");

    {
        let node = Dht::new(Config {
            bootstrap: testnet.bootstrap.clone(),
            port: Some(0),
            snapshot_path: Some(path.clone()),
            ..Default::default()
        })
        .expect("node");

        node.bootstrapped().expect("node is running");
        node.put(key, value.clone())
            .expect("node is running")
            .expect("put succeeds");

        // Writes the snapshot before the actor thread exits.
        node.shutdown();
    }

    let restarted = Dht::new(Config {
        bootstrap: vec![],
        port: Some(0),
        snapshot_path: Some(path.clone()),
        ..Default::default()
    })
    .expect("node");

    let values = restarted.get(key).expect("node is running");
    assert!(values.contains(&value));

    restarted.shutdown();
    let _ = std::fs::remove_file(path);
}
