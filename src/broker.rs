//! # Connection Broker
//!
//! The broker owns every live peer session and is the single place outbound
//! requests go through. It keeps:
//!
//! - `peers_by_addr`: address → [`SessionHandle`] (inbound sessions start
//!   under their socket address and gain an alias under the peer's
//!   advertised address once identified);
//! - `peers_by_key`: key → address for identified peers;
//! - an [`MruCache`] of addresses sized by `max_connections`, touched on
//!   every send, so the coldest session is retired when the pool overflows.
//!
//! Requests addressed to the node itself (by key or by address) never
//! touch a socket: they short-circuit straight into the local
//! [`HandlerHandle`]. Everything else lazily opens a TCP connection the
//! first time the endpoint is used.
//!
//! Retiring a session (eviction, failure, shutdown) closes it, drops every
//! alias, and removes the peer from the routing table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};

use crate::config::Config;
use crate::handler::HandlerHandle;
use crate::key::Key;
use crate::messages::{Operation, RpcRequest, RpcResponse};
use crate::mru::MruCache;
use crate::peer::PeerInfo;
use crate::routing::RoutingHandle;
use crate::session::{Session, SessionError, SessionHandle};

/// Command channel capacity for the broker actor.
const BROKER_COMMAND_CHANNEL_SIZE: usize = 256;

/// Time allowed for establishing a new TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An outbound request routed by peer key and endpoint.
#[derive(Clone, Debug)]
pub struct WireCall {
    /// Destination peer's key, when known.
    pub peer_key: Option<Key>,
    /// Destination endpoint.
    pub endpoint: SocketAddr,
    pub op: Operation,
    pub target: Key,
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default)]
pub struct BrokerStats {
    /// Live sessions, aliases included.
    pub sessions: usize,
    /// Peers whose key is known.
    pub identified: usize,
}

enum BrokerCommand {
    Send {
        call: WireCall,
        reply: oneshot::Sender<Result<RpcResponse, SessionError>>,
    },
    Register {
        peer: PeerInfo,
        session: SessionHandle,
        update_routing: bool,
    },
    /// Track an accepted inbound session before its peer is identified.
    Adopt {
        addr: SocketAddr,
        session: SessionHandle,
    },
    Deregister {
        addr: SocketAddr,
        session: Option<SessionHandle>,
        update_routing: bool,
    },
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
    Quit,
}

/// Cloneable handle to the broker actor.
#[derive(Clone)]
pub struct BrokerHandle {
    cmd_tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn spawn(
        owner: PeerInfo,
        config: Arc<Config>,
        handler: HandlerHandle,
        routing: RoutingHandle,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(BROKER_COMMAND_CHANNEL_SIZE);
        let handle = Self { cmd_tx };
        let actor = BrokerActor {
            owner,
            config: config.clone(),
            handler,
            routing,
            self_handle: handle.clone(),
            peers_by_addr: HashMap::new(),
            peers_by_key: HashMap::new(),
            mru: MruCache::new(config.max_connections),
        };
        tokio::spawn(actor.run(cmd_rx));
        handle
    }

    /// Route one request: to the local handler when it addresses the owner,
    /// over a (possibly new) session otherwise.
    pub async fn send(&self, call: WireCall) -> Result<RpcResponse, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::Send { call, reply: tx })
            .await
            .map_err(|_| SessionError::Closed("broker shut down".into()))?;
        rx.await
            .unwrap_or_else(|_| Err(SessionError::Closed("broker dropped the reply".into())))
    }

    pub async fn register(&self, peer: PeerInfo, session: SessionHandle, update_routing: bool) {
        let _ = self
            .cmd_tx
            .send(BrokerCommand::Register {
                peer,
                session,
                update_routing,
            })
            .await;
    }

    pub async fn adopt(&self, addr: SocketAddr, session: SessionHandle) {
        let _ = self.cmd_tx.send(BrokerCommand::Adopt { addr, session }).await;
    }

    pub async fn deregister(
        &self,
        addr: SocketAddr,
        session: Option<SessionHandle>,
        update_routing: bool,
    ) {
        let _ = self
            .cmd_tx
            .send(BrokerCommand::Deregister {
                addr,
                session,
                update_routing,
            })
            .await;
    }

    pub async fn stats(&self) -> BrokerStats {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(BrokerCommand::Stats { reply: tx })
            .await
            .is_err()
        {
            return BrokerStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(BrokerCommand::Quit).await;
    }
}

struct BrokerActor {
    owner: PeerInfo,
    config: Arc<Config>,
    handler: HandlerHandle,
    routing: RoutingHandle,
    self_handle: BrokerHandle,
    peers_by_addr: HashMap<SocketAddr, SessionHandle>,
    peers_by_key: HashMap<Key, SocketAddr>,
    mru: MruCache<SocketAddr, Option<Key>>,
}

impl BrokerActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<BrokerCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                BrokerCommand::Send { call, reply } => {
                    self.handle_send(call, reply).await;
                }
                BrokerCommand::Register {
                    peer,
                    session,
                    update_routing,
                } => {
                    self.handle_register(peer, session, update_routing).await;
                }
                BrokerCommand::Adopt { addr, session } => {
                    self.handle_adopt(addr, session).await;
                }
                BrokerCommand::Deregister {
                    addr,
                    session,
                    update_routing,
                } => {
                    self.handle_deregister(addr, session, update_routing).await;
                }
                BrokerCommand::Stats { reply } => {
                    let _ = reply.send(BrokerStats {
                        sessions: self.peers_by_addr.len(),
                        identified: self.peers_by_key.len(),
                    });
                }
                BrokerCommand::Quit => break,
            }
        }
        for session in self.peers_by_addr.values() {
            session.close();
        }
        debug!("broker actor shut down");
    }

    async fn handle_send(
        &mut self,
        call: WireCall,
        reply: oneshot::Sender<Result<RpcResponse, SessionError>>,
    ) {
        // Requests addressed to ourselves never touch the network.
        if call.peer_key == Some(self.owner.key) || call.endpoint == self.owner.addr {
            trace!(op = ?call.op, "self-dispatch short-circuit");
            let handler = self.handler.clone();
            let request = RpcRequest {
                request_id: 0,
                op: call.op,
                sender: self.owner.clone(),
                target: call.target,
                data: call.data,
            };
            tokio::spawn(async move {
                let response = handler.dispatch(request).await;
                let _ = reply.send(Ok(response));
            });
            return;
        }

        if let Some(evicted) = self.mru.add(call.endpoint, call.peer_key) {
            debug!(evicted = %evicted, "session pool full, retiring coldest session");
            self.retire(evicted, true).await;
        }

        let session = match self.peers_by_addr.get(&call.endpoint) {
            Some(session) => session.clone(),
            None => match self.connect(call.endpoint).await {
                Ok(session) => session,
                Err(e) => {
                    self.mru.remove(&call.endpoint);
                    let _ = reply.send(Err(SessionError::Transport(e.to_string())));
                    return;
                }
            },
        };

        // The actual exchange happens off the actor loop; the session
        // enforces its own in-flight bound.
        tokio::spawn(async move {
            let result = session.call(call.op, call.target, call.data).await;
            let _ = reply.send(result);
        });
    }

    async fn connect(&mut self, endpoint: SocketAddr) -> anyhow::Result<SessionHandle> {
        debug!(endpoint = %endpoint, "opening connection");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {endpoint} timed out"))??;
        let session = Session::spawn(
            stream,
            endpoint,
            self.owner.clone(),
            self.config.req_buffer,
            self.handler.clone(),
            self.routing.clone(),
            self.self_handle.clone(),
        );
        self.peers_by_addr.insert(endpoint, session.clone());
        Ok(session)
    }

    async fn handle_register(
        &mut self,
        peer: PeerInfo,
        session: SessionHandle,
        update_routing: bool,
    ) {
        match self.peers_by_addr.get(&peer.addr) {
            Some(existing) if !existing.same_session(&session) => {
                // A different live session already covers this address;
                // leave the mapping alone.
                trace!(peer = %peer, "register skipped: address already mapped");
            }
            _ => {
                self.peers_by_addr.insert(peer.addr, session);
                if let Some(evicted) = self.mru.add(peer.addr, Some(peer.key)) {
                    self.retire(evicted, true).await;
                }
            }
        }
        self.peers_by_key.insert(peer.key, peer.addr);
        if update_routing {
            let _ = self.routing.add(peer.clone()).await;
        }
        debug!(peer = %peer, "registered peer session");
    }

    async fn handle_adopt(&mut self, addr: SocketAddr, session: SessionHandle) {
        self.peers_by_addr.insert(addr, session);
        if let Some(evicted) = self.mru.add(addr, None) {
            self.retire(evicted, true).await;
        }
        debug!(addr = %addr, "adopted inbound session");
    }

    async fn handle_deregister(
        &mut self,
        addr: SocketAddr,
        session: Option<SessionHandle>,
        update_routing: bool,
    ) {
        let Some(current) = self.peers_by_addr.get(&addr) else {
            return;
        };
        if let Some(ref claimed) = session
            && !current.same_session(claimed)
        {
            // A newer session already replaced this address; the stale
            // deregistration must not tear it down.
            trace!(addr = %addr, "stale deregistration ignored");
            return;
        }
        let removed = self
            .peers_by_addr
            .remove(&addr)
            .expect("entry checked above");
        self.drop_session(&removed, addr, update_routing).await;
    }

    /// Retire the session living under `addr` (MRU eviction or shutdown).
    async fn retire(&mut self, addr: SocketAddr, update_routing: bool) {
        if let Some(session) = self.peers_by_addr.remove(&addr) {
            self.drop_session(&session, addr, update_routing).await;
        } else {
            self.mru.remove(&addr);
        }
    }

    /// Close a session and drop every alias and key mapping that points at
    /// it, optionally removing the peer from the routing table.
    async fn drop_session(&mut self, session: &SessionHandle, addr: SocketAddr, update_routing: bool) {
        session.close();
        self.mru.remove(&addr);

        let aliases: Vec<SocketAddr> = self
            .peers_by_addr
            .iter()
            .filter(|(_, s)| s.same_session(session))
            .map(|(a, _)| *a)
            .collect();
        for alias in &aliases {
            self.peers_by_addr.remove(alias);
            self.mru.remove(alias);
        }

        let mut removed_addrs = aliases;
        removed_addrs.push(addr);
        let keys: Vec<Key> = self
            .peers_by_key
            .iter()
            .filter(|(_, a)| removed_addrs.contains(a))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.peers_by_key.remove(&key);
            if update_routing && self.routing.remove(key).await {
                debug!(key = %&key.to_hex()[..16], "removed retired peer from routing");
            }
        }
    }
}
