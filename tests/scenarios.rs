//! End-to-end scenarios over in-process networks.

mod common;

use std::time::Duration;

use kadroute::{
    encode_sequenced, read_message, write_message, Connectedness, Datastore, Host, Message,
    MessageType, Record, WireErrorKind, WirePeer, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PROTOCOL_ID,
};
use tokio::time::timeout;

use common::{link, spawn_node, wait_for, TEST_TIMEOUT};

#[tokio::test]
async fn store_and_fetch_round_trip() {
    let net = kadroute::MemoryNetwork::new();
    let a = spawn_node(&net, Vec::new()).await;
    let b = spawn_node(&net, Vec::new()).await;
    link(&a, &b).await;

    timeout(TEST_TIMEOUT, a.dht.put_value(b"/v/hello", b"world".to_vec()))
        .await
        .unwrap()
        .unwrap();
    let value = timeout(TEST_TIMEOUT, b.dht.get_value(b"/v/hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"world");
}

#[tokio::test]
async fn three_hop_provider_discovery() {
    let net = kadroute::MemoryNetwork::new();
    let a = spawn_node(&net, Vec::new()).await;
    let b = spawn_node(&net, Vec::new()).await;
    let c = spawn_node(&net, Vec::new()).await;
    let d = spawn_node(&net, Vec::new()).await;
    link(&a, &b).await;
    link(&b, &c).await;
    link(&b, &d).await;

    timeout(TEST_TIMEOUT, d.dht.provide(b"hello", true))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(common::SETTLE).await;

    let providers = timeout(TEST_TIMEOUT, a.dht.find_providers(b"hello", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].id, d.id());
    assert!(!providers[0].addrs.is_empty());
}

#[tokio::test]
async fn ping_on_loopback() {
    let net = kadroute::MemoryNetwork::new();
    let a = spawn_node(&net, Vec::new()).await;
    let b = spawn_node(&net, Vec::new()).await;
    link(&a, &b).await;

    let rtt = timeout(Duration::from_millis(100), a.dht.ping(&b.id()))
        .await
        .expect("ping within deadline")
        .unwrap();
    assert!(rtt < Duration::from_millis(100));
    assert!(a.host.address_book().latency(&b.id()).is_some());
}

#[tokio::test]
async fn highest_sequence_record_selected() {
    let net = kadroute::MemoryNetwork::new();
    let low = spawn_node(&net, Vec::new()).await;
    let high = spawn_node(&net, Vec::new()).await;
    let reader = spawn_node(&net, Vec::new()).await;
    link(&reader, &low).await;
    link(&reader, &high).await;

    let key = b"/ordered/key".to_vec();
    for (node, seq) in [(&low, 3u64), (&high, 7u64)] {
        let value = encode_sequenced(seq, format!("seq-{seq}").as_bytes());
        let mut record = Record::new_signed(node.host.keypair(), key.clone(), value);
        record.stamp_received();
        node.store.put(&key, record.to_bytes().unwrap()).await.unwrap();
    }

    let records = timeout(TEST_TIMEOUT, reader.dht.get_values(&key, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(records.len(), 2);
    let mut authors: Vec<_> = records.iter().map(|r| r.author).collect();
    authors.sort();
    let mut expected = vec![low.id(), high.id()];
    expected.sort();
    assert_eq!(authors, expected);

    let best = timeout(TEST_TIMEOUT, reader.dht.get_value(&key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(best, encode_sequenced(7, b"seq-7"));
}

#[tokio::test]
async fn invalid_signature_rejected_on_put() {
    let net = kadroute::MemoryNetwork::new();
    let target = spawn_node(&net, Vec::new()).await;
    let raw = net.add_host();

    let key = b"/signed/item".to_vec();
    let mut record = Record::new_signed(raw.keypair(), key.clone(), b"payload".to_vec());
    record.signature[0] ^= 0xff;
    let request = Message::new(MessageType::PutValue, key.clone()).with_record(record);

    raw.connect(&target.info()).await.unwrap();
    let mut stream = raw.new_stream(&target.id(), DEFAULT_PROTOCOL_ID).await.unwrap();
    write_message(&mut stream, &request, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    let reply = timeout(TEST_TIMEOUT, read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE))
        .await
        .unwrap()
        .unwrap()
        .expect("a reply");

    assert_eq!(reply.msg_type, MessageType::PutValue);
    let error = reply.error.expect("validation error in reply");
    assert_eq!(error.kind, WireErrorKind::Validation);
    assert!(reply.record.is_none());
    assert!(target.store.get(&key).await.unwrap().is_none());

    let sender = raw.local_peer();
    wait_for(|| async { target.dht.routing_peers().await.contains(&sender) }).await;
}

#[tokio::test]
async fn unknown_namespace_rejected_on_put() {
    let net = kadroute::MemoryNetwork::new();
    let target = spawn_node(&net, Vec::new()).await;
    let raw = net.add_host();

    let key = b"/nobody/item".to_vec();
    let record = Record::new_signed(raw.keypair(), key.clone(), b"payload".to_vec());
    let request = Message::new(MessageType::PutValue, key.clone()).with_record(record);

    raw.connect(&target.info()).await.unwrap();
    let mut stream = raw.new_stream(&target.id(), DEFAULT_PROTOCOL_ID).await.unwrap();
    write_message(&mut stream, &request, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    let reply = read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap()
        .expect("a reply");

    assert_eq!(reply.error.map(|e| e.kind), Some(WireErrorKind::Unsupported));
    assert!(target.store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn oversized_frame_closes_stream() {
    let net = kadroute::MemoryNetwork::new();
    let target = spawn_node(&net, Vec::new()).await;
    let raw = net.add_host();
    raw.connect(&target.info()).await.unwrap();

    let mut stream = raw.new_stream(&target.id(), DEFAULT_PROTOCOL_ID).await.unwrap();
    let huge = Message::new(MessageType::GetValue, vec![7u8; DEFAULT_MAX_MESSAGE_SIZE + 1]);
    // The frame is refused before it is fully written or the stream ends
    // without a reply.
    let _ = write_message(&mut stream, &huge, DEFAULT_MAX_MESSAGE_SIZE * 2).await;
    let reply = timeout(TEST_TIMEOUT, read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE)).await;
    assert!(!matches!(reply, Ok(Ok(Some(_)))));

    // The node keeps serving new streams.
    let mut fresh = raw.new_stream(&target.id(), DEFAULT_PROTOCOL_ID).await.unwrap();
    write_message(&mut fresh, &Message::ping(), DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    let pong = read_message(&mut fresh, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap()
        .expect("pong");
    assert_eq!(pong.msg_type, MessageType::Ping);
}

#[tokio::test]
async fn provider_announcements_only_for_the_sender() {
    let net = kadroute::MemoryNetwork::new();
    let target = spawn_node(&net, Vec::new()).await;
    let raw = net.add_host();
    let bystander = net.add_host();
    raw.connect(&target.info()).await.unwrap();

    let forged = Message::new(MessageType::AddProvider, b"blob".to_vec())
        .with_provider_peers(vec![WirePeer::new(bystander.info(), Connectedness::Connected)]);
    let honest = Message::new(MessageType::AddProvider, b"blob".to_vec())
        .with_provider_peers(vec![WirePeer::new(raw.info(), Connectedness::Connected)]);

    let mut stream = raw.new_stream(&target.id(), DEFAULT_PROTOCOL_ID).await.unwrap();
    write_message(&mut stream, &forged, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    write_message(&mut stream, &honest, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    // ADD_PROVIDER has no reply; a PING on the same stream orders after both.
    write_message(&mut stream, &Message::ping(), DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    let pong = read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap()
        .expect("pong");
    assert_eq!(pong.msg_type, MessageType::Ping);

    let providers = timeout(TEST_TIMEOUT, target.dht.find_providers(b"blob", 0))
        .await
        .unwrap()
        .unwrap();
    let ids: Vec<_> = providers.iter().map(|p| p.id).collect();
    assert!(ids.contains(&raw.local_peer()));
    assert!(!ids.contains(&bystander.local_peer()));
}
