//! Integration tests for publish/subscribe between real nodes.
//!
//! Every node listens on an ephemeral loopback port and runs the standard
//! TCP stack, so these exercise the full pipeline: transport, handshake,
//! multiplexer, gossip mesh and discovery.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use topology_net::{ApplicationError, Identity, Keypair, Message, Node, NodeConfig};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const SETTLE: Duration = Duration::from_millis(500);

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_config() -> NodeConfig {
    let mut config = NodeConfig {
        listen: vec![SocketAddr::from(([127, 0, 0, 1], 0))],
        bootstrap_interval: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(200),
        ..NodeConfig::default()
    };
    config.gossip.heartbeat_interval = Duration::from_millis(100);
    config.discovery.interval = Duration::from_millis(200);
    config
}

async fn started(config: NodeConfig) -> (Node, String) {
    let node = Node::new(Keypair::generate(), config);
    let addrs = node.start().await.expect("node start failed");
    let addr = addrs[0].to_string();
    (node, addr)
}

/// Poll an async condition until it holds or the test timeout expires.
macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let result = timeout(TEST_TIMEOUT, async {
            while !$cond {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {}", $what);
    }};
}

async fn wait_for_mesh(node: &Node, topic: &str, peer: Identity) {
    wait_until!(
        "mesh membership",
        node.mesh_peers(topic).await.unwrap_or_default().contains(&peer)
    );
}

// =============================================================================
// Test: two nodes
// =============================================================================

#[tokio::test]
async fn subscriber_receives_published_message_once() {
    let (a, a_addr) = started(fast_config()).await;
    let (b, _) = started(NodeConfig {
        bootstrap: vec![a_addr],
        ..fast_config()
    })
    .await;

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    b.on_message("chat", move |_: &Message| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let mut rx_b = b.messages().await.unwrap();

    a.subscribe("chat").await.unwrap();
    b.subscribe("chat").await.unwrap();
    wait_for_mesh(&a, "chat", b.identity()).await;

    a.publish("chat", b"hi".to_vec()).await.unwrap();

    let message = timeout(TEST_TIMEOUT, rx_b.recv())
        .await
        .expect("message timeout")
        .expect("channel closed");
    assert_eq!(message.topic, "chat");
    assert_eq!(message.data, b"hi");
    assert_eq!(message.from, a.identity());

    sleep(SETTLE).await;
    assert!(rx_b.try_recv().is_err(), "duplicate delivery");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn mesh_degree_one_delivers_each_message_once() {
    let mut config = fast_config();
    config.gossip.mesh_n = 1;
    let (a, a_addr) = started(config.clone()).await;
    let (b, _) = started(NodeConfig {
        bootstrap: vec![a_addr],
        ..config
    })
    .await;
    let mut rx_b = b.messages().await.unwrap();

    a.subscribe("chat").await.unwrap();
    b.subscribe("chat").await.unwrap();
    wait_for_mesh(&a, "chat", b.identity()).await;
    wait_for_mesh(&b, "chat", a.identity()).await;

    let m1 = a.publish("chat", b"first".to_vec()).await.unwrap();
    let m2 = a.publish("chat", b"second".to_vec()).await.unwrap();
    assert_ne!(m1, m2);

    let mut received = Vec::new();
    for _ in 0..2 {
        let message = timeout(TEST_TIMEOUT, rx_b.recv())
            .await
            .expect("message timeout")
            .expect("channel closed");
        received.push(message.id);
    }
    received.sort();
    let mut expected = vec![m1, m2];
    expected.sort();
    assert_eq!(received, expected);

    sleep(SETTLE).await;
    assert!(rx_b.try_recv().is_err(), "duplicate delivery");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn unsubscribed_node_stops_receiving() {
    let (a, a_addr) = started(fast_config()).await;
    let (b, _) = started(NodeConfig {
        bootstrap: vec![a_addr],
        ..fast_config()
    })
    .await;
    let mut rx_b = b.messages().await.unwrap();

    a.subscribe("chat").await.unwrap();
    b.subscribe("chat").await.unwrap();
    wait_for_mesh(&a, "chat", b.identity()).await;

    b.unsubscribe("chat").await.unwrap();
    wait_until!(
        "mesh prune",
        !a.mesh_peers("chat").await.unwrap_or_default().contains(&b.identity())
    );

    // A keeps the topic, so publishing succeeds with nobody listening.
    a.publish("chat", b"anyone?".to_vec()).await.unwrap();
    sleep(SETTLE).await;
    assert!(rx_b.try_recv().is_err());

    let err = b.unsubscribe("chat").await.unwrap_err();
    assert_eq!(
        err.application(),
        Some(&ApplicationError::NotSubscribed("chat".into()))
    );

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn failing_handler_does_not_block_others() {
    let (a, a_addr) = started(fast_config()).await;
    let (b, _) = started(NodeConfig {
        bootstrap: vec![a_addr],
        ..fast_config()
    })
    .await;

    let hits = Arc::new(AtomicUsize::new(0));
    b.on_message("chat", |_: &Message| -> anyhow::Result<()> {
        anyhow::bail!("handler failure")
    });
    let counter = hits.clone();
    b.on_any_message(move |_: &Message| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    a.subscribe("chat").await.unwrap();
    b.subscribe("chat").await.unwrap();
    wait_for_mesh(&a, "chat", b.identity()).await;

    a.publish("chat", b"one".to_vec()).await.unwrap();
    wait_until!("handler delivery", hits.load(Ordering::SeqCst) == 1);

    a.publish("chat", b"two".to_vec()).await.unwrap();
    wait_until!("second delivery", hits.load(Ordering::SeqCst) == 2);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// =============================================================================
// Test: discovery
// =============================================================================

/// B and C only know A. Discovery records gossiped through A let them find
/// and dial each other.
#[tokio::test]
async fn peers_discover_each_other_through_a_hub() {
    let (a, a_addr) = started(fast_config()).await;
    let (b, _) = started(NodeConfig {
        bootstrap: vec![a_addr.clone()],
        ..fast_config()
    })
    .await;
    let (c, _) = started(NodeConfig {
        bootstrap: vec![a_addr],
        ..fast_config()
    })
    .await;

    wait_until!("b to connect c", b.connected_peers().await.contains(&c.identity()));
    wait_until!("c to connect b", c.connected_peers().await.contains(&b.identity()));

    // Once meshed, a message from B reaches C directly or through A.
    let mut rx_c = c.messages().await.unwrap();
    for node in [&a, &b, &c] {
        node.subscribe("news").await.unwrap();
    }
    wait_for_mesh(&c, "news", b.identity()).await;
    b.publish("news", b"from b".to_vec()).await.unwrap();

    let message = timeout(TEST_TIMEOUT, rx_c.recv())
        .await
        .expect("message timeout")
        .expect("channel closed");
    assert_eq!(message.from, b.identity());
    sleep(SETTLE).await;
    assert!(rx_c.try_recv().is_err(), "duplicate delivery");

    for node in [&a, &b, &c] {
        node.stop().await.unwrap();
    }
}

#[tokio::test]
async fn discovered_peers_reports_new_records() {
    let (a, a_addr) = started(fast_config()).await;
    let mut discovered = a.discovered_peers().await.unwrap();

    let (b, _) = started(NodeConfig {
        bootstrap: vec![a_addr],
        ..fast_config()
    })
    .await;

    let record = timeout(TEST_TIMEOUT, discovered.next())
        .await
        .expect("discovery timeout")
        .expect("discovery closed");
    assert_eq!(record.peer_id, b.identity());
    assert!(!record.addrs.is_empty());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
