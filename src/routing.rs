//! # Routing Table
//!
//! Kademlia routing state: a binary tree of k-buckets keyed by the XOR
//! distance between the owner and each peer.
//!
//! The tree starts as a single leaf covering the whole key space. A leaf at
//! depth `d` splits on distance bit `d`: the zero child keeps peers whose
//! distance prefix matches the owner (the owner's own side), the one child
//! takes the rest. Only the owner-side path (including the root) may
//! split; every other full bucket refuses further inserts. This keeps the
//! table fine-grained near the owner and coarse far away.
//!
//! Buckets order peers by access recency, most recently seen at the tail.
//! Re-seeing a known (key, address) pair refreshes its position; the same
//! key at a different address is a collision and is rejected outright.
//!
//! ## Actor
//!
//! All table state is owned by a single actor task; [`RoutingHandle`] is the
//! cheap-to-clone front door. Newly inserted peers are published on an
//! events channel so the refresh driver can look up their neighborhood.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::key::{Distance, Key, KEY_BITS};
use crate::peer::PeerInfo;

/// Command channel capacity for the routing actor.
const ROUTING_COMMAND_CHANNEL_SIZE: usize = 256;

/// A leaf bucket: up to `k` peers, most recently seen last.
#[derive(Debug, Default)]
struct KBucket {
    peers: Vec<PeerInfo>,
}

impl KBucket {
    fn position(&self, key: &Key) -> Option<usize> {
        self.peers.iter().position(|p| p.key == *key)
    }

    /// Move an existing peer to the tail and refresh its heartbeat.
    fn refresh(&mut self, pos: usize) {
        let mut peer = self.peers.remove(pos);
        peer.touch();
        self.peers.push(peer);
    }

    fn remove(&mut self, key: &Key) -> bool {
        if let Some(pos) = self.position(key) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }
}

/// One node of the routing tree. Children own their subtrees; there are no
/// parent links, traversal is always root-down.
#[derive(Debug)]
enum TreeNode {
    Leaf(KBucket),
    Branch {
        /// Distance bit this branch discriminates on (== its depth).
        bit: usize,
        /// Peers whose distance bit is 0: the owner-side subtree.
        zero: Box<TreeNode>,
        /// Peers whose distance bit is 1.
        one: Box<TreeNode>,
    },
}

/// Outcome of an insert attempt: (accepted, newly added).
pub type AddOutcome = (bool, bool);

#[derive(Debug)]
pub struct RoutingTable {
    owner: Key,
    k: usize,
    root: TreeNode,
    count: usize,
}

impl RoutingTable {
    pub fn new(owner: Key, k: usize) -> Self {
        assert!(k > 0, "bucket size must be positive");
        Self {
            owner,
            k,
            root: TreeNode::Leaf(KBucket::default()),
            count: 0,
        }
    }

    pub fn owner(&self) -> Key {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Insert or refresh a peer.
    ///
    /// Returns `(true, true)` for a new insert, `(true, false)` for a
    /// recency refresh of a known (key, address) pair, and `(false, false)`
    /// when the insert is refused: the owner itself, a key collision on a
    /// different address, or a full non-splittable bucket.
    pub fn add(&mut self, peer: PeerInfo) -> AddOutcome {
        if peer.key == self.owner {
            return (false, false);
        }
        let dist = self.owner.distance(&peer.key);
        let owner = self.owner;
        let k = self.k;
        let outcome = Self::add_at(&mut self.root, owner, peer, &dist, 0, true, k);
        if outcome == (true, true) {
            self.count += 1;
        }
        outcome
    }

    fn add_at(
        node: &mut TreeNode,
        owner: Key,
        peer: PeerInfo,
        dist: &Distance,
        depth: usize,
        owner_path: bool,
        k: usize,
    ) -> AddOutcome {
        match node {
            TreeNode::Branch { bit, zero, one } => {
                if dist.bit(*bit) {
                    Self::add_at(one, owner, peer, dist, depth + 1, false, k)
                } else {
                    Self::add_at(zero, owner, peer, dist, depth + 1, owner_path, k)
                }
            }
            TreeNode::Leaf(bucket) => {
                if let Some(pos) = bucket.position(&peer.key) {
                    if bucket.peers[pos].addr == peer.addr {
                        bucket.refresh(pos);
                        return (true, false);
                    }
                    // Key collision: never overwrite an incumbent address.
                    warn!(
                        key = %&peer.key.to_hex()[..16],
                        incumbent = %bucket.peers[pos].addr,
                        claimed = %peer.addr,
                        "routing insert refused: key collision"
                    );
                    return (false, false);
                }

                if bucket.peers.len() < k {
                    bucket.peers.push(peer);
                    return (true, true);
                }

                // Full. Split only on the owner path (the root is trivially
                // on it), and only while there are bits left to split on.
                if !owner_path || depth >= KEY_BITS {
                    trace!(depth, "routing insert refused: bucket full");
                    return (false, false);
                }

                Self::split_leaf(node, owner, depth);
                Self::add_at(node, owner, peer, dist, depth, owner_path, k)
            }
        }
    }

    /// Replace a full leaf at `depth` with a branch on bit `depth`,
    /// repartitioning its peers by their owner-relative distance bit.
    fn split_leaf(node: &mut TreeNode, owner: Key, depth: usize) {
        let TreeNode::Leaf(bucket) = std::mem::replace(node, TreeNode::Leaf(KBucket::default()))
        else {
            unreachable!("split target must be a leaf");
        };

        let mut zero = KBucket::default();
        let mut one = KBucket::default();
        for peer in bucket.peers {
            if owner.distance(&peer.key).bit(depth) {
                one.peers.push(peer);
            } else {
                zero.peers.push(peer);
            }
        }

        *node = TreeNode::Branch {
            bit: depth,
            zero: Box::new(TreeNode::Leaf(zero)),
            one: Box::new(TreeNode::Leaf(one)),
        };
        debug!(depth, "split routing bucket");
    }

    /// Remove a peer by key. Returns whether anything was removed.
    pub fn remove(&mut self, key: &Key) -> bool {
        if *key == self.owner {
            return false;
        }
        let dist = self.owner.distance(key);
        let mut node = &mut self.root;
        loop {
            match node {
                TreeNode::Branch { bit, zero, one } => {
                    node = if dist.bit(*bit) { one } else { zero };
                }
                TreeNode::Leaf(bucket) => {
                    let removed = bucket.remove(key);
                    if removed {
                        self.count -= 1;
                    }
                    return removed;
                }
            }
        }
    }

    /// Up to `n` peers closest to `target` by XOR distance.
    ///
    /// With `only_closest_bucket` the result is restricted to the single
    /// leaf bucket nearest the target: at each branch the side whose best
    /// peer is closer wins outright.
    pub fn nearest(&self, target: &Key, n: usize, only_closest_bucket: bool) -> Vec<PeerInfo> {
        if n == 0 {
            return Vec::new();
        }
        let mut peers = if only_closest_bucket {
            Self::collect_closest_bucket(&self.root, target)
        } else {
            let mut all = Vec::with_capacity(self.count);
            Self::collect_all(&self.root, &mut all);
            all
        };
        peers.sort_by(|a, b| a.key.distance(target).cmp(&b.key.distance(target)));
        peers.truncate(n);
        peers
    }

    fn collect_all(node: &TreeNode, out: &mut Vec<PeerInfo>) {
        match node {
            TreeNode::Leaf(bucket) => out.extend(bucket.peers.iter().cloned()),
            TreeNode::Branch { zero, one, .. } => {
                Self::collect_all(zero, out);
                Self::collect_all(one, out);
            }
        }
    }

    fn collect_closest_bucket(node: &TreeNode, target: &Key) -> Vec<PeerInfo> {
        match node {
            TreeNode::Leaf(bucket) => bucket.peers.clone(),
            TreeNode::Branch { zero, one, .. } => {
                let left = Self::collect_closest_bucket(zero, target);
                let right = Self::collect_closest_bucket(one, target);
                match (left.is_empty(), right.is_empty()) {
                    (true, true) => Vec::new(),
                    (false, true) => left,
                    (true, false) => right,
                    (false, false) => {
                        let best = |peers: &[PeerInfo]| {
                            peers
                                .iter()
                                .map(|p| p.key.distance(target))
                                .min()
                                .expect("non-empty")
                        };
                        if best(&left) <= best(&right) {
                            left
                        } else {
                            right
                        }
                    }
                }
            }
        }
    }

    /// Sum of leaf bucket sizes; must always equal `len()`.
    #[cfg(test)]
    fn leaf_sizes(&self) -> Vec<usize> {
        fn walk(node: &TreeNode, out: &mut Vec<usize>) {
            match node {
                TreeNode::Leaf(bucket) => out.push(bucket.peers.len()),
                TreeNode::Branch { zero, one, .. } => {
                    walk(zero, out);
                    walk(one, out);
                }
            }
        }
        let mut sizes = Vec::new();
        walk(&self.root, &mut sizes);
        sizes
    }

    /// (depth, lies on the owner's all-zero path) for every leaf.
    #[cfg(test)]
    fn leaf_depths(&self) -> Vec<(usize, bool)> {
        fn walk(node: &TreeNode, depth: usize, owner_path: bool, out: &mut Vec<(usize, bool)>) {
            match node {
                TreeNode::Leaf(_) => out.push((depth, owner_path)),
                TreeNode::Branch { zero, one, .. } => {
                    walk(zero, depth + 1, owner_path, out);
                    walk(one, depth + 1, false, out);
                }
            }
        }
        let mut depths = Vec::new();
        walk(&self.root, 0, true, &mut depths);
        depths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn peer(seed: &str, port: u16) -> PeerInfo {
        PeerInfo::new(Key::compute(seed.as_bytes()), addr(port))
    }

    #[test]
    fn count_matches_leaf_sizes_and_buckets_stay_bounded() {
        let owner = Key::compute(b"node0");
        let mut table = RoutingTable::new(owner, 4);
        for i in 0..200 {
            let _ = table.add(peer(&format!("item{i}"), 5000 + i as u16));
        }
        let sizes = table.leaf_sizes();
        assert_eq!(sizes.iter().sum::<usize>(), table.len());
        assert!(sizes.iter().all(|&s| s <= 4), "bucket over capacity: {sizes:?}");
    }

    #[test]
    fn only_the_owner_path_grows_deep() {
        let owner = Key::compute(b"node0");
        let mut table = RoutingTable::new(owner, 4);
        for i in 0..1000 {
            let _ = table.add(peer(&format!("item{i}"), 6000 + (i % 1000) as u16));
        }
        let depths = table.leaf_depths();
        let owner_depth = depths
            .iter()
            .find(|(_, on_path)| *on_path)
            .map(|(d, _)| *d)
            .expect("owner path leaf always exists");
        for (depth, on_path) in depths {
            if !on_path {
                assert!(
                    depth <= owner_depth,
                    "non-owner leaf at depth {depth} deeper than owner path {owner_depth}"
                );
            }
        }
    }

    #[test]
    fn nearest_returns_the_true_n_closest() {
        let owner = Key::compute(b"nearest-owner");
        let mut table = RoutingTable::new(owner, 4);
        let mut inserted = Vec::new();
        for i in 0..200 {
            let p = peer(&format!("candidate{i}"), 7000 + i as u16);
            if table.add(p.clone()) == (true, true) {
                inserted.push(p);
            }
        }

        let target = Key::compute(b"somewhere");
        for n in [1, 5, 20, inserted.len()] {
            let got = table.nearest(&target, n, false);
            let mut expected = inserted.clone();
            expected.sort_by(|a, b| a.key.distance(&target).cmp(&b.key.distance(&target)));
            expected.truncate(n);
            let got_keys: Vec<Key> = got.iter().map(|p| p.key).collect();
            let expected_keys: Vec<Key> = expected.iter().map(|p| p.key).collect();
            assert_eq!(got_keys, expected_keys, "n = {n}");
        }
    }

    #[test]
    fn reinsert_refreshes_and_collision_is_refused() {
        let owner = Key::compute(b"collision-owner");
        let mut table = RoutingTable::new(owner, 8);
        let key = Key::compute(b"stable-peer");
        let original = PeerInfo::new(key, addr(8000));

        assert_eq!(table.add(original.clone()), (true, true));
        let before = table.len();

        // Same key, same address: refresh only.
        assert_eq!(table.add(PeerInfo::new(key, addr(8000))), (true, false));
        assert_eq!(table.len(), before);

        // Same key, different address: refused, incumbent untouched.
        assert_eq!(table.add(PeerInfo::new(key, addr(8001))), (false, false));
        assert_eq!(table.len(), before);
        let found = table.nearest(&key, 1, false);
        assert_eq!(found[0].addr, addr(8000));
    }

    #[test]
    fn refreshed_peer_moves_to_the_bucket_tail() {
        let owner = Key::ZERO;
        let mut table = RoutingTable::new(owner, 8);
        let a = peer("tail-a", 8100);
        let b = peer("tail-b", 8101);
        table.add(a.clone());
        table.add(b.clone());
        table.add(a.clone());

        // The single leaf now holds [b, a].
        let TreeNode::Leaf(bucket) = &table.root else {
            panic!("table should still be a single leaf");
        };
        assert_eq!(bucket.peers.last().map(|p| p.key), Some(a.key));
    }

    #[test]
    fn table_fill_scenario() {
        // k = 4, one thousand content keys; nearest(owner, 10) must be the
        // ten accepted keys closest to the owner.
        let owner = Key::compute(b"node0");
        let mut table = RoutingTable::new(owner, 4);
        let mut accepted = Vec::new();
        for i in 0..1000 {
            let p = peer(&format!("item{i}"), 9000 + (i % 500) as u16);
            if table.add(p.clone()).0 {
                accepted.push(p);
            }
        }
        assert!(!accepted.is_empty());

        let mut expected: Vec<Key> = accepted.iter().map(|p| p.key).collect();
        expected.sort_by(|a, b| a.distance(&owner).cmp(&b.distance(&owner)));
        expected.truncate(10);

        let mut got: Vec<Key> = table
            .nearest(&owner, 10, false)
            .into_iter()
            .map(|p| p.key)
            .collect();
        // Order within equal distances is unspecified; compare as sets in
        // distance order.
        got.sort_by(|a, b| a.distance(&owner).cmp(&b.distance(&owner)));
        assert_eq!(got, expected);
    }

    #[test]
    fn closest_bucket_restriction_yields_a_single_leaf() {
        let owner = Key::compute(b"node0");
        let mut table = RoutingTable::new(owner, 4);
        for i in 0..300 {
            let _ = table.add(peer(&format!("item{i}"), 9500 + (i % 400) as u16));
        }
        let target = Key::compute(b"item7");
        let restricted = table.nearest(&target, 64, true);
        assert!(!restricted.is_empty());
        assert!(restricted.len() <= 4, "restricted result exceeds one bucket");

        // The restricted set must be a prefix of the global ordering only in
        // the sense that its best peer matches the global best.
        let global = table.nearest(&target, 1, false);
        assert_eq!(restricted[0].key, global[0].key);
    }

    #[test]
    fn remove_deletes_exactly_the_given_key() {
        let owner = Key::compute(b"remove-owner");
        let mut table = RoutingTable::new(owner, 4);
        let p = peer("removable", 9900);
        table.add(p.clone());
        assert_eq!(table.len(), 1);
        assert!(table.remove(&p.key));
        assert_eq!(table.len(), 0);
        assert!(!table.remove(&p.key));
    }

    #[test]
    fn owner_is_never_inserted() {
        let owner = Key::compute(b"self");
        let mut table = RoutingTable::new(owner, 4);
        assert_eq!(table.add(PeerInfo::new(owner, addr(9999))), (false, false));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn actor_round_trip_and_events() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let owner = Key::compute(b"actor-owner");
        let handle = RoutingHandle::spawn(owner, 4, events_tx);

        let p = peer("actor-peer", 10000);
        assert_eq!(handle.add(p.clone()).await, (true, true));
        assert_eq!(handle.count().await, 1);

        let event = events_rx.recv().await.expect("new peer event");
        assert_eq!(event, p);

        // A refresh does not re-announce the peer.
        assert_eq!(handle.add(p.clone()).await, (true, false));
        assert!(events_rx.try_recv().is_err());

        assert!(handle.remove(p.key).await);
        assert_eq!(handle.count().await, 0);
        handle.quit().await;
    }
}

// ============================================================================
// Actor
// ============================================================================

enum RoutingCommand {
    Add {
        peer: PeerInfo,
        reply: oneshot::Sender<AddOutcome>,
    },
    Remove {
        key: Key,
        reply: oneshot::Sender<bool>,
    },
    Nearest {
        target: Key,
        n: usize,
        only_closest_bucket: bool,
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

/// Cloneable handle to the routing actor.
#[derive(Clone)]
pub struct RoutingHandle {
    cmd_tx: mpsc::Sender<RoutingCommand>,
}

impl RoutingHandle {
    /// Spawn the routing actor. Newly inserted peers are published on
    /// `events`; the channel is fed best-effort so a slow consumer can
    /// never stall routing.
    pub fn spawn(owner: Key, k: usize, events: mpsc::Sender<PeerInfo>) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(ROUTING_COMMAND_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut table = RoutingTable::new(owner, k);
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    RoutingCommand::Add { peer, reply } => {
                        let event = peer.clone();
                        let outcome = table.add(peer);
                        if outcome == (true, true) && events.try_send(event).is_err() {
                            trace!("routing event dropped: refresh driver busy");
                        }
                        let _ = reply.send(outcome);
                    }
                    RoutingCommand::Remove { key, reply } => {
                        let _ = reply.send(table.remove(&key));
                    }
                    RoutingCommand::Nearest {
                        target,
                        n,
                        only_closest_bucket,
                        reply,
                    } => {
                        let _ = reply.send(table.nearest(&target, n, only_closest_bucket));
                    }
                    RoutingCommand::Count { reply } => {
                        let _ = reply.send(table.len());
                    }
                    RoutingCommand::Quit => break,
                }
            }
            debug!("routing actor shut down");
        });
        Self { cmd_tx }
    }

    pub async fn add(&self, peer: PeerInfo) -> AddOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCommand::Add { peer, reply: tx })
            .await
            .is_err()
        {
            return (false, false);
        }
        rx.await.unwrap_or((false, false))
    }

    pub async fn remove(&self, key: Key) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCommand::Remove { key, reply: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn nearest(&self, target: Key, n: usize, only_closest_bucket: bool) -> Vec<PeerInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCommand::Nearest {
                target,
                n,
                only_closest_bucket,
                reply: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCommand::Count { reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RoutingCommand::Quit).await;
    }
}
