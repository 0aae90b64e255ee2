//! # Node Supervisor
//!
//! A [`Node`] wires every component together and owns their lifetimes:
//!
//! - the routing, store, handler and broker actors, bundled in a
//!   [`NodeContext`]; one context per node, so several nodes can share a
//!   process (the console and the integration tests rely on this);
//! - the TCP accept loop, which wraps each inbound socket in a session and
//!   pings it so the remote identifies itself before becoming routable;
//! - discovery: one FIND_PEER toward every seed endpoint at startup, a
//!   periodic self-refresh, and a targeted refresh whenever the routing
//!   table reports a brand-new peer.
//!
//! Local callers drive the node through [`PeerRequest`] messages (the
//! console's channel shape) or the typed wrappers [`Node::put`],
//! [`Node::get`], [`Node::stats`] and [`Node::refresh`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{BrokerHandle, BrokerStats, WireCall};
use crate::config::Config;
use crate::handler::HandlerHandle;
use crate::key::Key;
use crate::lookup::LookupEngine;
use crate::messages::Operation;
use crate::peer::PeerInfo;
use crate::routing::RoutingHandle;
use crate::session::Session;
use crate::store::{StoreHandle, StoreStats};

/// Local API channel capacity.
const API_CHANNEL_SIZE: usize = 64;

/// New-peer event buffer between the routing table and the refresh driver.
const ROUTING_EVENT_CHANNEL_SIZE: usize = 64;

/// Local operations a node accepts from its operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerOp {
    /// Store a value in the network (PUT).
    Add,
    /// Retrieve a value by key (GET).
    Find,
    /// Report node statistics.
    Stats,
    /// Run a lookup to (re)populate the routing table.
    Refresh,
}

/// One operator request; the reply channel always receives exactly one
/// [`PeerResponse`].
pub struct PeerRequest {
    pub op: PeerOp,
    pub key: Option<Key>,
    pub data: Option<Vec<u8>>,
    pub reply: oneshot::Sender<PeerResponse>,
}

/// Why an operator request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    InvalidArgument,
    Terminated,
}

/// Reply to a [`PeerRequest`]: either the operation's payload and count, or
/// a failure with kind and message.
#[derive(Clone, Debug)]
pub enum PeerResponse {
    Success {
        data: Option<Vec<u8>>,
        /// PUT: stores that succeeded. GET/REFRESH: peers visited.
        success_count: usize,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl PeerResponse {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Failure {
            kind: FailureKind::InvalidArgument,
            message: message.into(),
        }
    }

    fn terminated() -> Self {
        Self::Failure {
            kind: FailureKind::Terminated,
            message: "node is stopped".into(),
        }
    }
}

/// Aggregated statistics across a node's components.
#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub routing_peers: usize,
    pub store: StoreStats,
    pub broker: BrokerStats,
}

impl std::fmt::Display for NodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "peers={} sessions={} identified={} cached={} long_term={} bytes={} oldest={}",
            self.routing_peers,
            self.broker.sessions,
            self.broker.identified,
            self.store.cache_entries,
            self.store.long_term_entries,
            self.store.total_bytes,
            self.store
                .oldest_age
                .map(|age| format!("{}s", age.as_secs()))
                .unwrap_or_else(|| "-".into()),
        )
    }
}

/// Handles to every shared component of one node. Created once at start and
/// passed explicitly; there is no process-wide registry.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<Config>,
    pub routing: RoutingHandle,
    pub store: StoreHandle,
    pub broker: BrokerHandle,
    pub handler: HandlerHandle,
}

pub struct Node {
    owner: PeerInfo,
    ctx: NodeContext,
    api_tx: mpsc::Sender<PeerRequest>,
    tasks: Vec<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

impl Node {
    /// Bind a listener, spawn every component, and start discovery against
    /// the given seed endpoints. The node gets a fresh random key.
    pub async fn start(config: Config, bind: SocketAddr, seeds: Vec<SocketAddr>) -> Result<Node> {
        let config = Arc::new(config);
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        let addr = listener.local_addr()?;
        let owner = PeerInfo::new(Key::random(), addr);
        info!(node = %owner, "node starting");

        let (events_tx, events_rx) = mpsc::channel(ROUTING_EVENT_CHANNEL_SIZE);
        let routing = RoutingHandle::spawn(owner.key, config.k, events_tx);
        let store = StoreHandle::spawn(config.clone(), owner.key, routing.clone());
        let handler = HandlerHandle::spawn(
            owner.clone(),
            config.clone(),
            routing.clone(),
            store.clone(),
        );
        let broker = BrokerHandle::spawn(
            owner.clone(),
            config.clone(),
            handler.clone(),
            routing.clone(),
        );
        let ctx = NodeContext {
            config: config.clone(),
            routing: routing.clone(),
            store: store.clone(),
            broker: broker.clone(),
            handler: handler.clone(),
        };
        let engine = LookupEngine::new(
            owner.clone(),
            config.clone(),
            routing,
            broker.clone(),
            store,
        );

        let mut tasks = Vec::new();
        let (api_tx, api_rx) = mpsc::channel(API_CHANNEL_SIZE);
        tasks.push(tokio::spawn(api_loop(api_rx, engine.clone(), ctx.clone())));
        tasks.push(tokio::spawn(accept_loop(listener, owner.clone(), ctx.clone())));
        tasks.push(tokio::spawn(bootstrap(owner.clone(), broker, seeds)));
        tasks.push(tokio::spawn(periodic_refresh(
            engine.clone(),
            config.refresh_interval,
        )));
        tasks.push(tokio::spawn(new_peer_refresh(engine, events_rx)));

        Ok(Node {
            owner,
            ctx,
            api_tx,
            tasks,
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn key(&self) -> Key {
        self.owner.key
    }

    pub fn addr(&self) -> SocketAddr {
        self.owner.addr
    }

    pub fn peer(&self) -> PeerInfo {
        self.owner.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// The node's component handles. Exposed so embedders and tests can
    /// drive individual components directly.
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Submit one operator request and wait for its reply.
    pub async fn submit(
        &self,
        op: PeerOp,
        key: Option<Key>,
        data: Option<Vec<u8>>,
    ) -> PeerResponse {
        let (tx, rx) = oneshot::channel();
        let request = PeerRequest {
            op,
            key,
            data,
            reply: tx,
        };
        if self.api_tx.send(request).await.is_err() {
            return PeerResponse::terminated();
        }
        rx.await.unwrap_or_else(|_| PeerResponse::terminated())
    }

    /// Store a value; reports the number of successful STOREs.
    pub async fn put(&self, data: Vec<u8>) -> PeerResponse {
        self.submit(PeerOp::Add, None, Some(data)).await
    }

    /// Retrieve a value by key.
    pub async fn get(&self, key: Key) -> PeerResponse {
        self.submit(PeerOp::Find, Some(key), None).await
    }

    /// Refresh toward `target`, or toward our own key.
    pub async fn refresh(&self, target: Option<Key>) -> PeerResponse {
        self.submit(PeerOp::Refresh, target, None).await
    }

    /// Contact a seed endpoint directly: one FIND_PEER toward our own key.
    /// Returns how many peers the seed reported.
    pub async fn connect(&self, seed: SocketAddr) -> Result<usize> {
        let call = WireCall {
            peer_key: None,
            endpoint: seed,
            op: Operation::FindPeer,
            target: self.owner.key,
            data: None,
        };
        let response = self.ctx.broker.send(call).await?;
        Ok(response.peers.len())
    }

    /// Typed statistics snapshot.
    pub async fn stats(&self) -> NodeStats {
        gather_stats(&self.ctx).await
    }

    /// Stop every component. Pending operator requests fail with
    /// `Terminated`; sessions close and peers are forgotten.
    pub async fn stop(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.owner, "node stopping");
        for task in &self.tasks {
            task.abort();
        }
        self.ctx.broker.quit().await;
        self.ctx.handler.quit().await;
        self.ctx.store.quit().await;
        self.ctx.routing.quit().await;
    }
}

async fn gather_stats(ctx: &NodeContext) -> NodeStats {
    NodeStats {
        routing_peers: ctx.routing.count().await,
        store: ctx.store.stats().await,
        broker: ctx.broker.stats().await,
    }
}

async fn api_loop(
    mut api_rx: mpsc::Receiver<PeerRequest>,
    engine: LookupEngine,
    ctx: NodeContext,
) {
    while let Some(request) = api_rx.recv().await {
        let engine = engine.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let response = match request.op {
                PeerOp::Add => match request.data {
                    Some(data) if !data.is_empty() => {
                        let (_key, stored) = engine.put(data).await;
                        PeerResponse::Success {
                            data: None,
                            success_count: stored,
                        }
                    }
                    _ => PeerResponse::invalid("add requires a non-empty value"),
                },
                PeerOp::Find => match request.key {
                    Some(key) => {
                        let (data, visited) = engine.get(key).await;
                        PeerResponse::Success {
                            data,
                            success_count: visited,
                        }
                    }
                    None => PeerResponse::invalid("find requires a key"),
                },
                PeerOp::Stats => {
                    let stats = gather_stats(&ctx).await;
                    PeerResponse::Success {
                        data: Some(stats.to_string().into_bytes()),
                        success_count: 0,
                    }
                }
                PeerOp::Refresh => {
                    let visited = engine.refresh(request.key).await;
                    PeerResponse::Success {
                        data: None,
                        success_count: visited,
                    }
                }
            };
            let _ = request.reply.send(response);
        });
    }
}

async fn accept_loop(listener: TcpListener, owner: PeerInfo, ctx: NodeContext) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                debug!(remote = %remote_addr, "accepted connection");
                let session = Session::spawn(
                    stream,
                    remote_addr,
                    owner.clone(),
                    ctx.config.req_buffer,
                    ctx.handler.clone(),
                    ctx.routing.clone(),
                    ctx.broker.clone(),
                );
                ctx.broker.adopt(remote_addr, session.clone()).await;

                // Ping the newcomer; its response carries its identity, and
                // only then does it become routable.
                let owner_key = owner.key;
                tokio::spawn(async move {
                    if let Err(e) = session.call(Operation::Ping, owner_key, None).await {
                        debug!(remote = %remote_addr, error = %e, "initial ping failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn bootstrap(owner: PeerInfo, broker: BrokerHandle, seeds: Vec<SocketAddr>) {
    for seed in seeds {
        if seed == owner.addr {
            continue;
        }
        info!(seed = %seed, "bootstrapping");
        let call = WireCall {
            peer_key: None,
            endpoint: seed,
            op: Operation::FindPeer,
            target: owner.key,
            data: None,
        };
        match broker.send(call).await {
            Ok(response) => {
                debug!(seed = %seed, peers = response.peers.len(), "bootstrap reply");
            }
            Err(e) => {
                warn!(seed = %seed, error = %e, "bootstrap failed");
            }
        }
    }
}

async fn periodic_refresh(engine: LookupEngine, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let visited = engine.refresh(None).await;
        debug!(visited, "periodic self-refresh");
    }
}

async fn new_peer_refresh(engine: LookupEngine, mut events_rx: mpsc::Receiver<PeerInfo>) {
    while let Some(peer) = events_rx.recv().await {
        let visited = engine.refresh(Some(peer.key)).await;
        debug!(peer = %peer, visited, "refreshed toward new peer");
    }
}
