//! Lookup engine behavior over real nodes: refresh-driven table
//! population, local re-insertion after a fetch, and request multiplexing
//! on a single session.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use xorbit::{Config, Key, Node, Operation, PeerResponse, WireCall};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const SETTLE: Duration = Duration::from_millis(400);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn start_node() -> Node {
    Node::start(Config::default(), loopback(), Vec::new())
        .await
        .expect("node start")
}

#[tokio::test]
async fn refresh_learns_peers_of_peers() {
    timeout(TEST_TIMEOUT, async {
        let hub = start_node().await;
        let early = start_node().await;
        let late = start_node().await;

        early.connect(hub.addr()).await.expect("early -> hub");
        sleep(SETTLE).await;
        late.connect(hub.addr()).await.expect("late -> hub");
        sleep(SETTLE).await;

        match late.refresh(None).await {
            PeerResponse::Success { success_count, .. } => {
                assert!(success_count >= 1, "refresh must visit somebody");
            }
            PeerResponse::Failure { message, .. } => panic!("refresh failed: {message}"),
        }
        sleep(SETTLE).await;

        // The hub's replies advertised `early`; the lookup fed it into the
        // latecomer's table.
        let known = late
            .context()
            .routing
            .nearest(early.key(), 1, false)
            .await;
        assert!(
            known.iter().any(|p| p.key == early.key()),
            "refresh must teach the latecomer about its peers' peers"
        );

        for node in [hub, early, late] {
            node.stop().await;
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn fetched_values_are_cached_locally() {
    timeout(TEST_TIMEOUT, async {
        let holder = start_node().await;
        let seeker = start_node().await;
        seeker.connect(holder.addr()).await.expect("connect");
        sleep(SETTLE).await;

        let value = b"cache me once".to_vec();
        let key = Key::compute(&value);
        // Plant the value on the holder only.
        holder.context().store.put(key, value.clone()).await;

        let visited_first = match seeker.get(key).await {
            PeerResponse::Success { data, success_count } => {
                assert_eq!(data, Some(value.clone()));
                success_count
            }
            PeerResponse::Failure { message, .. } => panic!("get failed: {message}"),
        };
        assert!(visited_first >= 1, "first fetch goes over the network");

        // The fetch re-inserted the value; the second get is local.
        match seeker.get(key).await {
            PeerResponse::Success { data, success_count } => {
                assert_eq!(data, Some(value));
                assert_eq!(success_count, 0, "second fetch must be served locally");
            }
            PeerResponse::Failure { message, .. } => panic!("second get failed: {message}"),
        }

        holder.stop().await;
        seeker.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn many_concurrent_lookups_share_one_session() {
    timeout(TEST_TIMEOUT, async {
        let hub = start_node().await;
        let client = start_node().await;
        client.connect(hub.addr()).await.expect("connect");
        sleep(SETTLE).await;

        // Far more requests than the per-session in-flight bound; the
        // excess must wait its turn, not fail.
        let broker = client.context().broker.clone();
        let mut join = tokio::task::JoinSet::new();
        for i in 0..30u32 {
            let broker = broker.clone();
            let endpoint = hub.addr();
            join.spawn(async move {
                broker
                    .send(WireCall {
                        peer_key: None,
                        endpoint,
                        op: Operation::FindValue,
                        target: Key::compute(format!("missing-{i}").as_bytes()),
                        data: None,
                    })
                    .await
            });
        }
        while let Some(joined) = join.join_next().await {
            let response = joined.expect("task").expect("rpc");
            assert!(!response.success, "nothing was ever stored on the hub");
        }

        // One peer, one session, thirty requests.
        let stats = client.stats().await;
        assert_eq!(stats.broker.sessions, 1);

        hub.stop().await;
        client.stop().await;
    })
    .await
    .expect("test timed out");
}
