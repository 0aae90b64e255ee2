//! Broker and session behavior over real loopback TCP: the self-dispatch
//! short-circuit, MRU eviction of the coldest session, and failure fan-out.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use xorbit::{Config, Key, Node, Operation, WireCall};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const SETTLE: Duration = Duration::from_millis(400);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn start_node_with(config: Config) -> Node {
    Node::start(config, loopback(), Vec::new())
        .await
        .expect("node start")
}

#[tokio::test]
async fn requests_to_the_owner_short_circuit() {
    timeout(TEST_TIMEOUT, async {
        let node = start_node_with(Config::default()).await;
        let broker = node.context().broker.clone();

        let value = b"kept at home".to_vec();
        let key = Key::compute(&value);

        // Addressed by our own key: served by the local handler.
        let response = broker
            .send(WireCall {
                peer_key: Some(node.key()),
                endpoint: "127.0.0.1:1".parse().unwrap(),
                op: Operation::Store,
                target: key,
                data: Some(value.clone()),
            })
            .await
            .expect("self store");
        assert!(response.success);

        // Addressed by our own endpoint: same thing.
        let response = broker
            .send(WireCall {
                peer_key: None,
                endpoint: node.addr(),
                op: Operation::FindValue,
                target: key,
                data: None,
            })
            .await
            .expect("self find_value");
        assert!(response.success);
        assert_eq!(response.data, Some(value));

        // No socket was ever opened.
        let stats = node.stats().await;
        assert_eq!(stats.broker.sessions, 0, "self-dispatch must not open sessions");

        node.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pool_overflow_retires_the_coldest_session() {
    timeout(TEST_TIMEOUT, async {
        let config = Config {
            max_connections: 2,
            ..Config::default()
        };
        let main = start_node_with(config).await;
        let e1 = start_node_with(Config::default()).await;
        let e2 = start_node_with(Config::default()).await;
        let e3 = start_node_with(Config::default()).await;
        let broker = main.context().broker.clone();

        let ping = |endpoint: SocketAddr| WireCall {
            peer_key: None,
            endpoint,
            op: Operation::Ping,
            target: main.key(),
            data: None,
        };

        // Establish sessions to e1 and e2, then let identification and the
        // per-peer refresh lookups settle before fixing the recency order.
        broker.send(ping(e1.addr())).await.expect("reach e1");
        broker.send(ping(e2.addr())).await.expect("reach e2");
        sleep(SETTLE).await;

        // Recency now: e1 older, e2 newer.
        broker.send(ping(e1.addr())).await.expect("touch e1");
        broker.send(ping(e2.addr())).await.expect("touch e2");

        assert_eq!(main.stats().await.routing_peers, 2);

        // Third endpoint overflows the pool: e1 is the coldest and goes.
        broker.send(ping(e3.addr())).await.expect("reach e3");
        sleep(SETTLE).await;

        let stats = main.stats().await;
        assert_eq!(stats.broker.sessions, 2, "pool must hold exactly two sessions");

        // e1's peer left the routing table with its session.
        let near_e1 = main.context().routing.nearest(e1.key(), 1, false).await;
        assert!(
            near_e1.iter().all(|p| p.key != e1.key()),
            "evicted peer must be gone from routing"
        );
        let near_e3 = main.context().routing.nearest(e3.key(), 1, false).await;
        assert!(
            near_e3.iter().any(|p| p.key == e3.key()),
            "new peer must be routable"
        );

        for node in [main, e1, e2, e3] {
            node.stop().await;
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transport_failure_fails_callers_and_deregisters() {
    timeout(TEST_TIMEOUT, async {
        let main = start_node_with(Config::default()).await;
        let peer = start_node_with(Config::default()).await;
        let broker = main.context().broker.clone();

        broker
            .send(WireCall {
                peer_key: None,
                endpoint: peer.addr(),
                op: Operation::Ping,
                target: main.key(),
                data: None,
            })
            .await
            .expect("reach peer");
        sleep(SETTLE).await;
        assert_eq!(main.stats().await.routing_peers, 1);

        // Kill the remote; the session collapses.
        let peer_addr = peer.addr();
        peer.stop().await;
        sleep(SETTLE).await;

        // The next call cannot succeed: either the old session already
        // reported the loss, or a fresh connect is refused.
        let result = broker
            .send(WireCall {
                peer_key: None,
                endpoint: peer_addr,
                op: Operation::Ping,
                target: main.key(),
                data: None,
            })
            .await;
        assert!(result.is_err(), "calls to a dead peer must fail");

        sleep(SETTLE).await;
        let stats = main.stats().await;
        assert_eq!(stats.routing_peers, 0, "dead peer must leave routing");
        assert_eq!(stats.broker.sessions, 0, "dead sessions must be dropped");

        main.stop().await;
    })
    .await
    .expect("test timed out");
}
