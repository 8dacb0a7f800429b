//! Integration tests for the `Dht` public API over in-process networks.

mod common;

use std::time::Duration;

use kadroute::{Datastore, DhtConfig, DhtError, Host, MemoryNetwork, PeerId};
use tokio::time::timeout;

use common::{cluster, link, spawn_node, spawn_node_with, test_config, wait_for, TEST_TIMEOUT};

#[tokio::test]
async fn lone_node_fails_fast() {
    let net = MemoryNetwork::new();
    let node = spawn_node(&net, Vec::new()).await;

    assert!(matches!(
        node.dht.get_value(b"/v/missing").await,
        Err(DhtError::NotFound)
    ));
    assert!(matches!(
        node.dht.find_peer(&PeerId::random()).await,
        Err(DhtError::NotFound)
    ));
    assert!(matches!(node.dht.bootstrap().await, Err(DhtError::NotFound)));
    assert_eq!(node.dht.routing_table_size().await, 0);
}

#[tokio::test]
async fn put_then_get_on_same_node() {
    let (_net, nodes) = cluster(6).await;

    for (i, node) in nodes.iter().enumerate() {
        let key = format!("/v/key-{i}");
        let value = format!("value-{i}").into_bytes();
        timeout(TEST_TIMEOUT, node.dht.put_value(key.as_bytes(), value.clone()))
            .await
            .unwrap()
            .unwrap();
        let fetched = timeout(TEST_TIMEOUT, node.dht.get_value(key.as_bytes()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, value);
    }
}

#[tokio::test]
async fn values_reach_every_node() {
    let (_net, nodes) = cluster(6).await;

    timeout(TEST_TIMEOUT, nodes[5].dht.put_value(b"/signed/shared", b"v1".to_vec()))
        .await
        .unwrap()
        .unwrap();

    for node in &nodes {
        let value = timeout(TEST_TIMEOUT, node.dht.get_value(b"/signed/shared"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, b"v1");
    }
}

#[tokio::test]
async fn find_peer_across_cluster() {
    let (_net, nodes) = cluster(8).await;
    let target = &nodes[3];

    let info = timeout(TEST_TIMEOUT, nodes[7].dht.find_peer(&target.id()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.id, target.id());
    assert_eq!(info.addrs, target.info().addrs);

    let own = nodes[7].dht.find_peer(&nodes[7].id()).await.unwrap();
    assert_eq!(own.id, nodes[7].id());
}

#[tokio::test]
async fn bootstrap_fills_routing_tables() {
    let (_net, nodes) = cluster(8).await;
    for node in &nodes {
        let size = node.dht.routing_table_size().await;
        assert!(size >= 2, "node {} knows only {} peers", node.id(), size);
        assert!(!node.dht.routing_peers().await.contains(&node.id()));
    }
}

#[tokio::test]
async fn provider_stream_ends_with_not_found() {
    let (_net, nodes) = cluster(4).await;

    let mut stream = nodes[0].dht.find_providers_async(b"nobody-has-this", 0);
    let mut items = Vec::new();
    while let Some(item) = timeout(TEST_TIMEOUT, stream.recv()).await.unwrap() {
        items.push(item);
    }
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(DhtError::NotFound)));
}

#[tokio::test]
async fn providers_found_from_any_node() {
    let (_net, nodes) = cluster(6).await;
    let provider = &nodes[2];

    timeout(TEST_TIMEOUT, provider.dht.provide(b"content", true))
        .await
        .unwrap()
        .unwrap();

    for node in &nodes {
        let found = timeout(TEST_TIMEOUT, node.dht.find_providers(b"content", 0))
            .await
            .unwrap()
            .unwrap();
        assert!(
            found.iter().any(|p| p.id == provider.id()),
            "provider not found from {}",
            node.id()
        );
    }
}

#[tokio::test]
async fn provide_without_announce_stays_local() {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net, Vec::new()).await;
    let b = spawn_node(&net, Vec::new()).await;
    link(&a, &b).await;

    a.dht.provide(b"quiet", false).await.unwrap();
    let local = a.dht.find_providers(b"quiet", 1).await.unwrap();
    assert_eq!(local[0].id, a.id());

    // b asks a, which answers from its provider store.
    let remote = timeout(TEST_TIMEOUT, b.dht.find_providers(b"quiet", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote[0].id, a.id());
}

#[tokio::test]
async fn get_values_returns_distinct_records() {
    let (_net, nodes) = cluster(4).await;

    timeout(TEST_TIMEOUT, nodes[1].dht.put_value(b"/v/multi", b"same".to_vec()))
        .await
        .unwrap()
        .unwrap();

    let records = timeout(TEST_TIMEOUT, nodes[3].dht.get_values(b"/v/multi", 4))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, b"same");
    assert!(nodes[3].dht.get_values(b"/v/multi", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn public_key_fetched_through_the_network() {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net, Vec::new()).await;
    let b = spawn_node(&net, Vec::new()).await;
    let c = spawn_node(&net, Vec::new()).await;
    link(&a, &b).await;
    link(&b, &c).await;

    timeout(TEST_TIMEOUT, c.dht.publish_public_key())
        .await
        .unwrap()
        .unwrap();
    let key = timeout(TEST_TIMEOUT, a.dht.get_public_key(&c.id()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, c.host.keypair().public_key_bytes());
    assert!(c.id().matches_public_key(&key));
}

#[tokio::test]
async fn disconnected_peers_leave_routing_table() {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net, Vec::new()).await;
    let b = spawn_node(&net, Vec::new()).await;
    link(&a, &b).await;

    net.set_offline(&b.id());
    let gone = b.id();
    wait_for(|| async { !a.dht.routing_peers().await.contains(&gone) }).await;
    assert!(a.dht.ping(&b.id()).await.is_err());
}

#[tokio::test]
async fn lookups_survive_offline_peers() {
    let (net, nodes) = cluster(8).await;

    timeout(TEST_TIMEOUT, nodes[0].dht.put_value(b"/v/durable", b"still here".to_vec()))
        .await
        .unwrap()
        .unwrap();
    net.set_offline(&nodes[0].id());
    net.set_offline(&nodes[1].id());

    let value = timeout(TEST_TIMEOUT, nodes[6].dht.get_value(b"/v/durable"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"still here");
}

#[tokio::test]
async fn expired_addresses_are_purged_in_background() {
    let net = MemoryNetwork::new();
    let node = spawn_node_with(
        &net,
        DhtConfig {
            address_gc_interval: Duration::from_millis(50),
            ..test_config()
        },
    )
    .await;
    let book = node.host.address_book();
    let before = book.len();

    let passing = PeerId::random();
    book.add(&passing, &["/mem/passing".to_string()], Duration::from_millis(20));
    assert_eq!(book.len(), before + 1);
    wait_for(|| async { book.len() == before }).await;
}

#[tokio::test]
async fn read_repair_reaches_stale_replicas() {
    let (_net, nodes) = cluster(4).await;
    let key = b"/v/repair";
    timeout(TEST_TIMEOUT, nodes[0].dht.put_value(key, b"kept".to_vec()))
        .await
        .unwrap()
        .unwrap();
    nodes[2].store.delete(key).await.unwrap();

    let value = timeout(TEST_TIMEOUT, nodes[1].dht.get_value(key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"kept");
    let store = &nodes[2].store;
    wait_for(|| async { store.get(key).await.unwrap().is_some() }).await;
}

#[tokio::test]
async fn closed_dht_rejects_operations() {
    let (_net, nodes) = cluster(3).await;
    let node = &nodes[1];

    node.dht.close().await;
    assert!(matches!(
        node.dht.put_value(b"/v/late", b"x".to_vec()).await,
        Err(DhtError::Cancelled)
    ));
    assert!(matches!(node.dht.get_value(b"/v/late").await, Err(DhtError::Cancelled)));
    assert!(matches!(node.dht.bootstrap().await, Err(DhtError::Cancelled)));
    let mut providers = node.dht.find_providers_async(b"x", 0);
    assert!(matches!(providers.recv().await, Some(Err(DhtError::Cancelled))));
    // Closing twice is harmless.
    node.dht.close().await;
}
