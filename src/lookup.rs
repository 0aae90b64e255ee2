//! # Iterative Lookup Engine
//!
//! The α/k-parallel closest-nodes search that PUT, GET and REFRESH all
//! drive. One shared routine, [`LookupEngine::visit_closest`], walks the
//! network in rounds:
//!
//! 1. the working set starts as the routing table's k nearest peers to the
//!    target and is re-sorted by distance every round;
//! 2. the round queries the whole set with at most α requests in flight,
//!    marking each peer used the moment it is dispatched;
//! 3. replies accumulate successes and teach the engine new candidates;
//!    FIND_VALUE rounds also track the closest peer actually tried and drop
//!    any learned candidate that is strictly farther (non-regression);
//! 4. the search ends when enough successes arrived, when a round taught it
//!    nothing new, or when there is nobody left to ask.
//!
//! Replies are folded in at the `join_next` point, so per-round state needs
//! no locking. Early completion aborts the outstanding queries; whatever
//! they would have returned is discarded.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};

use crate::broker::{BrokerHandle, WireCall};
use crate::config::Config;
use crate::key::{Distance, Key};
use crate::messages::{Operation, RpcResponse};
use crate::peer::PeerInfo;
use crate::routing::RoutingHandle;
use crate::session::SessionError;
use crate::store::StoreHandle;

/// Per-query timeout so one slow peer cannot stall a round.
const PER_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Hard ceiling on rounds; ordinary lookups converge in a handful.
const MAX_LOOKUP_ROUNDS: usize = 20;

/// What a lookup saw: the successful responses (up to `need_successes`) and
/// how many peers were actually queried.
#[derive(Debug, Default)]
pub struct VisitOutcome {
    pub successes: Vec<RpcResponse>,
    pub visited: usize,
}

#[derive(Clone)]
pub struct LookupEngine {
    owner: PeerInfo,
    config: Arc<Config>,
    routing: RoutingHandle,
    broker: BrokerHandle,
    store: StoreHandle,
}

impl LookupEngine {
    pub fn new(
        owner: PeerInfo,
        config: Arc<Config>,
        routing: RoutingHandle,
        broker: BrokerHandle,
        store: StoreHandle,
    ) -> Self {
        Self {
            owner,
            config,
            routing,
            broker,
            store,
        }
    }

    /// Store a value under its content key on the k closest reachable
    /// peers. Returns the key and how many STOREs succeeded.
    pub async fn put(&self, data: Vec<u8>) -> (Key, usize) {
        let key = Key::compute(&data);
        let k = self.config.k;
        let outcome = self
            .visit_closest(key, k, k, Operation::Store, Some(data))
            .await;
        debug!(
            key = %&key.to_hex()[..16],
            stored = outcome.successes.len(),
            visited = outcome.visited,
            "put finished"
        );
        (key, outcome.successes.len())
    }

    /// Fetch a value: local store first, then an iterative FIND_VALUE. A
    /// fetched value is re-inserted locally. Returns the data (if any) and
    /// the number of peers visited.
    pub async fn get(&self, key: Key) -> (Option<Vec<u8>>, usize) {
        if let Some(data) = self.store.get(key).await {
            trace!(key = %&key.to_hex()[..16], "get served locally");
            return (Some(data), 0);
        }

        let outcome = self
            .visit_closest(key, self.config.k, 1, Operation::FindValue, None)
            .await;
        for response in &outcome.successes {
            if let Some(data) = &response.data {
                self.store.put(key, data.clone()).await;
                debug!(
                    key = %&key.to_hex()[..16],
                    visited = outcome.visited,
                    source = %response.sender,
                    "get found a value"
                );
                return (Some(data.clone()), outcome.visited);
            }
        }
        debug!(key = %&key.to_hex()[..16], visited = outcome.visited, "get found nothing");
        (None, outcome.visited)
    }

    /// Walk toward `target` (or our own key) to populate the routing table.
    /// Returns the number of peers visited.
    pub async fn refresh(&self, target: Option<Key>) -> usize {
        let (target, k) = match target {
            Some(target) => (target, 1),
            None => (self.owner.key, self.config.k),
        };
        let outcome = self
            .visit_closest(target, k, 1, Operation::FindPeer, None)
            .await;
        trace!(
            target = %&target.to_hex()[..16],
            visited = outcome.visited,
            "refresh finished"
        );
        outcome.visited
    }

    async fn visit_closest(
        &self,
        target: Key,
        k: usize,
        need_successes: usize,
        op: Operation,
        data: Option<Vec<u8>>,
    ) -> VisitOutcome {
        let alpha = self.config.alpha.max(1);
        let mut candidates = self.routing.nearest(target, k, false).await;
        let mut used: HashSet<Key> = HashSet::new();
        let mut successes: Vec<RpcResponse> = Vec::new();
        let mut new_candidates: Vec<PeerInfo> = Vec::new();
        let mut closest_tried: Option<Distance> = None;
        let mut visited = 0usize;

        'search: for round in 0..MAX_LOOKUP_ROUNDS {
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by(|a, b| a.key.distance(&target).cmp(&b.key.distance(&target)));
            trace!(round, querying = candidates.len(), "lookup round");

            let mut queue = candidates.drain(..).collect::<Vec<_>>().into_iter();
            let mut join: JoinSet<(PeerInfo, Result<RpcResponse, SessionError>)> = JoinSet::new();
            let mut in_flight = 0usize;

            loop {
                // Keep up to α queries in the air.
                while in_flight < alpha {
                    let Some(peer) = queue.next() else { break };
                    if !used.insert(peer.key) {
                        continue;
                    }
                    visited += 1;
                    let broker = self.broker.clone();
                    let data = data.clone();
                    join.spawn(async move {
                        let call = WireCall {
                            peer_key: Some(peer.key),
                            endpoint: peer.addr,
                            op,
                            target,
                            data,
                        };
                        let result = match timeout(PER_QUERY_TIMEOUT, broker.send(call)).await {
                            Ok(result) => result,
                            Err(_) => Err(SessionError::Transport("query timed out".into())),
                        };
                        (peer, result)
                    });
                    in_flight += 1;
                }
                if in_flight == 0 {
                    break;
                }
                let Some(joined) = join.join_next().await else {
                    break;
                };
                in_flight -= 1;
                let Ok((peer, result)) = joined else { continue };

                match result {
                    Ok(response) => {
                        if op == Operation::FindValue {
                            let tried = peer.key.distance(&target);
                            if closest_tried.is_none_or(|current| tried < current) {
                                closest_tried = Some(tried);
                            }
                        }
                        for learned in &response.peers {
                            if !used.contains(&learned.key) {
                                new_candidates.push(learned.clone());
                            }
                        }
                        if response.success {
                            successes.push(response);
                            if successes.len() >= need_successes {
                                // Enough answers: outstanding queries are
                                // cancelled and their results dropped.
                                join.abort_all();
                                break 'search;
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %peer, error = %e, "lookup query failed");
                    }
                }
            }

            // Build the next round from what this one taught us.
            let mut seen_this_merge: HashSet<Key> = HashSet::new();
            for peer in new_candidates.drain(..) {
                if used.contains(&peer.key) || !seen_this_merge.insert(peer.key) {
                    continue;
                }
                // Non-regression: a FIND_VALUE never walks away from the
                // closest peer it has already asked.
                if op == Operation::FindValue
                    && closest_tried
                        .is_some_and(|current| peer.key.distance(&target) > current)
                {
                    continue;
                }
                candidates.push(peer);
            }
            if candidates.is_empty() {
                break;
            }
        }

        VisitOutcome { successes, visited }
    }
}
