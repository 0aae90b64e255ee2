//! # Local Value Store
//!
//! Two [`MruCache`] tiers hold the node's share of the content-addressed
//! key space:
//!
//! - the **cache tier** is bounded by `store_size` entries and absorbs every
//!   PUT and STORE unconditionally;
//! - the **long-term tier** is bounded only by age and receives an entry
//!   when this node ranks among the k closest known peers to the key.
//!
//! Promotion is evaluated off the actor loop: a spawned task asks the
//! routing table for the closest bucket and reports back with a follow-up
//! command, so a slow routing query never stalls reads. When the node is
//! the single closest peer the entry is flagged owner-of-record; the
//! broadcast-to-replicas hook fires for those entries but is disabled.
//!
//! A ticker drives expiry of both tiers every `max_age / 3`.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::Config;
use crate::key::Key;
use crate::mru::MruCache;
use crate::routing::RoutingHandle;

/// Command channel capacity for the store actor.
const STORE_COMMAND_CHANNEL_SIZE: usize = 256;

/// Replica broadcast from the owner-of-record to the remaining k-1 closest
/// peers. Disabled: enabling it requires deduplicating against the sender
/// to avoid STORE storms.
const REPLICA_BROADCAST_ENABLED: bool = false;

/// A long-term entry; the cache tier stores bare byte vectors.
struct LongTermEntry {
    data: Vec<u8>,
    /// This node believed itself the single closest peer at store time.
    owner_of_record: bool,
}

/// Aggregate store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub cache_entries: usize,
    pub long_term_entries: usize,
    /// Long-term entries this node stored as the single closest peer.
    pub owned_entries: usize,
    pub total_bytes: usize,
    /// Age of the oldest entry across both tiers.
    pub oldest_age: Option<Duration>,
}

struct ValueStore {
    cache: MruCache<Key, Vec<u8>>,
    long_term: MruCache<Key, LongTermEntry>,
    max_age: Duration,
}

impl ValueStore {
    fn new(config: &Config) -> Self {
        Self {
            cache: MruCache::new(config.store_size),
            long_term: MruCache::unbounded(),
            max_age: config.max_age,
        }
    }

    fn put(&mut self, key: Key, data: Vec<u8>) {
        self.cache.add(key, data);
    }

    fn get(&self, key: &Key) -> Option<Vec<u8>> {
        self.cache
            .try_get(key)
            .cloned()
            .or_else(|| self.long_term.try_get(key).map(|entry| entry.data.clone()))
    }

    fn promote(&mut self, key: Key, owner_of_record: bool) {
        // The value may have been displaced from the cache tier while the
        // placement query was in flight; nothing to promote then.
        let Some(data) = self.cache.try_get(&key).cloned() else {
            trace!(key = %&key.to_hex()[..16], "promotion skipped: value left the cache tier");
            return;
        };
        self.long_term.add(key, LongTermEntry { data, owner_of_record });
        if owner_of_record {
            self.broadcast_to_replicas(&key);
        }
    }

    /// Replica broadcast hook. Prepared but disabled; see
    /// [`REPLICA_BROADCAST_ENABLED`].
    fn broadcast_to_replicas(&self, key: &Key) {
        if !REPLICA_BROADCAST_ENABLED {
            return;
        }
        debug!(key = %&key.to_hex()[..16], "replica broadcast requested");
    }

    fn expire(&mut self) -> usize {
        self.cache.expire_old(self.max_age) + self.long_term.expire_old(self.max_age)
    }

    fn stats(&self) -> StoreStats {
        let total_bytes = self.cache.iter().map(|(_, v)| v.len()).sum::<usize>()
            + self.long_term.iter().map(|(_, e)| e.data.len()).sum::<usize>();
        let oldest = [
            self.cache.oldest_timestamp(),
            self.long_term.oldest_timestamp(),
        ]
        .into_iter()
        .flatten()
        .min();
        StoreStats {
            cache_entries: self.cache.len(),
            long_term_entries: self.long_term.len(),
            owned_entries: self
                .long_term
                .iter()
                .filter(|(_, e)| e.owner_of_record)
                .count(),
            total_bytes,
            oldest_age: oldest.map(|t| Instant::now().duration_since(t)),
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

enum StoreCommand {
    Put {
        key: Key,
        data: Vec<u8>,
    },
    Get {
        key: Key,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    /// Placement verdict delivered by the spawned routing query.
    Promote {
        key: Key,
        owner_of_record: bool,
    },
    Expire,
    Stats {
        reply: oneshot::Sender<StoreStats>,
    },
    Quit,
}

/// Cloneable handle to the value store actor.
#[derive(Clone)]
pub struct StoreHandle {
    cmd_tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub fn spawn(config: Arc<Config>, owner: Key, routing: RoutingHandle) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(STORE_COMMAND_CHANNEL_SIZE);
        let handle = Self { cmd_tx };

        let actor_handle = handle.clone();
        let actor_config = config.clone();
        tokio::spawn(async move {
            let mut store = ValueStore::new(&actor_config);
            let k = actor_config.k;
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    StoreCommand::Put { key, data } => {
                        store.put(key, data);
                        spawn_placement_query(
                            key,
                            owner,
                            k,
                            routing.clone(),
                            actor_handle.clone(),
                        );
                    }
                    StoreCommand::Get { key, reply } => {
                        let _ = reply.send(store.get(&key));
                    }
                    StoreCommand::Promote {
                        key,
                        owner_of_record,
                    } => {
                        store.promote(key, owner_of_record);
                    }
                    StoreCommand::Expire => {
                        let removed = store.expire();
                        if removed > 0 {
                            debug!(removed, "expired stored values");
                        }
                    }
                    StoreCommand::Stats { reply } => {
                        let _ = reply.send(store.stats());
                    }
                    StoreCommand::Quit => break,
                }
            }
            debug!("store actor shut down");
        });

        // Periodic expiry at a third of the age limit.
        let ticker_handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.max_age / 3);
            interval.tick().await;
            loop {
                interval.tick().await;
                if ticker_handle.cmd_tx.send(StoreCommand::Expire).await.is_err() {
                    break;
                }
            }
        });

        handle
    }

    pub async fn put(&self, key: Key, data: Vec<u8>) {
        let _ = self.cmd_tx.send(StoreCommand::Put { key, data }).await;
    }

    pub async fn get(&self, key: Key) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StoreCommand::Get { key, reply: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn expire(&self) {
        let _ = self.cmd_tx.send(StoreCommand::Expire).await;
    }

    pub async fn stats(&self) -> StoreStats {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StoreCommand::Stats { reply: tx })
            .await
            .is_err()
        {
            return StoreStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(StoreCommand::Quit).await;
    }
}

/// Ask routing for the closest bucket to `key` and report whether the owner
/// belongs among the k closest known peers (and whether it is the single
/// closest). The verdict is delivered back to the actor as a command.
fn spawn_placement_query(
    key: Key,
    owner: Key,
    k: usize,
    routing: RoutingHandle,
    store: StoreHandle,
) {
    tokio::spawn(async move {
        let peers = routing.nearest(key, k, true).await;
        let owner_dist = owner.distance(&key);
        let within_k = peers.len() < k
            || peers
                .last()
                .is_some_and(|farthest| owner_dist < farthest.key.distance(&key));
        if !within_k {
            return;
        }
        let owner_of_record = peers
            .first()
            .is_none_or(|closest| owner_dist < closest.key.distance(&key));
        let _ = store
            .cmd_tx
            .send(StoreCommand::Promote {
                key,
                owner_of_record,
            })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerInfo;
    use tokio::sync::mpsc;

    fn small_config() -> Arc<Config> {
        Arc::new(Config {
            store_size: 4,
            max_age: Duration::from_secs(2),
            ..Config::default()
        })
    }

    fn spawn_routing(owner: Key) -> RoutingHandle {
        let (events_tx, _events_rx) = mpsc::channel(16);
        RoutingHandle::spawn(owner, 20, events_tx)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let owner = Key::compute(b"store-owner");
        let store = StoreHandle::spawn(small_config(), owner, spawn_routing(owner));

        let data = b"hello world".to_vec();
        let key = Key::compute(&data);
        store.put(key, data.clone()).await;
        assert_eq!(store.get(key).await, Some(data));
        assert_eq!(store.get(Key::compute(b"missing")).await, None);
    }

    #[tokio::test]
    async fn empty_table_promotes_to_long_term_as_owner_of_record() {
        // With no known peers the owner is trivially the single closest.
        let owner = Key::compute(b"lonely-owner");
        let store = StoreHandle::spawn(small_config(), owner, spawn_routing(owner));

        let data = b"durable".to_vec();
        let key = Key::compute(&data);
        store.put(key, data.clone()).await;

        // Let the placement query and promotion land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Push the entry out of the bounded cache tier; the long-term copy
        // must survive.
        for i in 0u32..8 {
            let filler = format!("filler{i}").into_bytes();
            store.put(Key::compute(&filler), filler).await;
        }
        let stats = store.stats().await;
        assert_eq!(stats.long_term_entries, 1);
        assert_eq!(stats.owned_entries, 1, "no peers means we are the closest");
        assert_eq!(store.get(key).await, Some(data));
    }

    #[tokio::test]
    async fn distant_key_stays_out_of_long_term_when_closer_peers_exist() {
        let owner = Key::compute(b"crowded-owner");
        let routing = spawn_routing(owner);

        // Find a content key and a set of peers all strictly closer to it
        // than the owner is.
        let data = b"popular value".to_vec();
        let key = Key::compute(&data);
        let owner_dist = owner.distance(&key);
        let mut port = 11000u16;
        let mut planted = 0;
        for i in 0..10_000u32 {
            let candidate = Key::compute(format!("peer{i}").as_bytes());
            if candidate.distance(&key) < owner_dist {
                routing
                    .add(PeerInfo::new(
                        candidate,
                        format!("127.0.0.1:{port}").parse().unwrap(),
                    ))
                    .await;
                port += 1;
                planted += 1;
                if planted == 20 {
                    break;
                }
            }
        }
        assert_eq!(planted, 20, "need a full k of closer peers");

        let store = StoreHandle::spawn(small_config(), owner, routing);
        store.put(key, data).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = store.stats().await;
        assert_eq!(stats.long_term_entries, 0, "owner is not among the k closest");
        assert_eq!(stats.cache_entries, 1);
    }

    #[tokio::test]
    async fn expiry_drops_aged_values() {
        let owner = Key::compute(b"expiry-owner");
        let config = Arc::new(Config {
            store_size: 4,
            max_age: Duration::from_millis(200),
            ..Config::default()
        });
        let store = StoreHandle::spawn(config, owner, spawn_routing(owner));

        let data = b"short lived".to_vec();
        let key = Key::compute(&data);
        store.put(key, data.clone()).await;
        assert_eq!(store.get(key).await, Some(data));

        tokio::time::sleep(Duration::from_millis(350)).await;
        store.expire().await;
        assert_eq!(store.get(key).await, None);
    }

    #[tokio::test]
    async fn stats_report_counts_and_bytes() {
        let owner = Key::compute(b"stats-owner");
        let store = StoreHandle::spawn(small_config(), owner, spawn_routing(owner));

        store.put(Key::compute(b"aa"), b"aa".to_vec()).await;
        store.put(Key::compute(b"bbbb"), b"bbbb".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = store.stats().await;
        assert_eq!(stats.cache_entries, 2);
        // Both entries were promoted (empty routing table), so bytes count
        // both tiers.
        assert_eq!(stats.long_term_entries, 2);
        assert_eq!(stats.total_bytes, (2 + 4) * 2);
        assert!(stats.oldest_age.is_some());
    }
}
