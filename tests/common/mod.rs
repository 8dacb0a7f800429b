//! Shared helpers for integration tests: in-process DHT networks.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kadroute::{
    AcceptAllValidator, Dht, DhtConfig, FirstValidSelector, Host, MemoryDatastore, MemoryHost,
    MemoryNetwork, PeerId, PeerInfo, SequenceSelector, SequenceValidator,
};

/// Upper bound for any single test step.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for fire-and-forget messages to land.
pub const SETTLE: Duration = Duration::from_millis(200);

pub struct TestNode {
    pub dht: Dht<MemoryHost>,
    pub host: MemoryHost,
    pub store: Arc<MemoryDatastore>,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.host.local_peer()
    }

    pub fn info(&self) -> PeerInfo {
        self.host.info()
    }
}

/// Short timeouts, no background refresh, and the namespaces the tests use:
/// `/v/` accept-all unsigned, `/signed/` accept-all signed, `/ordered/`
/// sequence-numbered with highest-wins selection.
pub fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_secs(2),
        query_timeout: Duration::from_secs(5),
        bootstrap_timeout: Duration::from_secs(2),
        bootstrap_interval: Duration::from_secs(3600),
        ..DhtConfig::default()
    }
    .with_namespace(
        "v",
        Arc::new(AcceptAllValidator::unsigned()),
        Some(Arc::new(FirstValidSelector)),
    )
    .with_namespace("signed", Arc::new(AcceptAllValidator::signed()), None)
    .with_namespace(
        "ordered",
        Arc::new(SequenceValidator { signed: true }),
        Some(Arc::new(SequenceSelector)),
    )
}

pub async fn spawn_node(net: &Arc<MemoryNetwork>, seeds: Vec<PeerInfo>) -> TestNode {
    spawn_node_with(net, test_config().with_seed_peers(seeds)).await
}

pub async fn spawn_node_with(net: &Arc<MemoryNetwork>, config: DhtConfig) -> TestNode {
    let host = net.add_host();
    let store = Arc::new(MemoryDatastore::new());
    let dht = Dht::new(host.clone(), store.clone(), config)
        .await
        .expect("dht should start");
    TestNode { dht, host, store }
}

/// `n` nodes, each seeded with the first one, then bootstrapped again so
/// later joiners are known to earlier ones.
pub async fn cluster(n: usize) -> (Arc<MemoryNetwork>, Vec<TestNode>) {
    let net = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(n);
    let first = spawn_node(&net, Vec::new()).await;
    let seed = first.info();
    nodes.push(first);
    for _ in 1..n {
        nodes.push(spawn_node(&net, vec![seed.clone()]).await);
    }
    for node in &nodes {
        let _ = node.dht.bootstrap().await;
    }
    (net, nodes)
}

/// Connect `a` to `b` and wait until both routing tables hold the other.
pub async fn link(a: &TestNode, b: &TestNode) {
    a.host.connect(&b.info()).await.expect("connect");
    wait_for(|| async {
        a.dht.routing_peers().await.contains(&b.id()) && b.dht.routing_peers().await.contains(&a.id())
    })
    .await;
}

/// Poll `cond` until it holds or [`TEST_TIMEOUT`] passes.
pub async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within {:?}", TEST_TIMEOUT);
}
