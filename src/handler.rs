//! # Inbound Request Handler
//!
//! Serves the four primitive operations for remote peers. Every request is
//! handled on its own task, bounded by a semaphore so a burst of inbound
//! traffic cannot exhaust the runtime; the actor loop itself never blocks
//! on a single request.
//!
//! Before dispatch the request's sender is fed into the routing table: a
//! peer that talks to us is a peer worth remembering.
//!
//! | Operation | Reply |
//! |-----------|-------|
//! | PING | success, plus our nearest peers to our own key |
//! | STORE | success after inserting into the value store |
//! | FIND_PEER | the k nearest peers; success iff the set is non-empty |
//! | FIND_VALUE | the value when held locally, else the k nearest peers with success = false |

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};

use crate::config::Config;
use crate::messages::{Operation, RpcRequest, RpcResponse};
use crate::peer::PeerInfo;
use crate::routing::RoutingHandle;
use crate::store::StoreHandle;

/// Command channel capacity for the handler actor.
const HANDLER_COMMAND_CHANNEL_SIZE: usize = 256;

/// Concurrent inbound requests being served at once.
const MAX_CONCURRENT_HANDLINGS: usize = 10;

enum HandlerCommand {
    Dispatch {
        request: RpcRequest,
        reply: oneshot::Sender<RpcResponse>,
    },
    Quit,
}

/// Cloneable handle to the inbound handler actor.
#[derive(Clone)]
pub struct HandlerHandle {
    cmd_tx: mpsc::Sender<HandlerCommand>,
}

impl HandlerHandle {
    pub fn spawn(
        owner: PeerInfo,
        config: Arc<Config>,
        routing: RoutingHandle,
        store: StoreHandle,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(HANDLER_COMMAND_CHANNEL_SIZE);
        tokio::spawn(async move {
            let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLINGS));
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandlerCommand::Dispatch { request, reply } => {
                        let Ok(permit) = limiter.clone().acquire_owned().await else {
                            break;
                        };
                        let owner = owner.clone();
                        let config = config.clone();
                        let routing = routing.clone();
                        let store = store.clone();
                        tokio::spawn(async move {
                            let response =
                                serve(&owner, &config, &routing, &store, request).await;
                            let _ = reply.send(response);
                            drop(permit);
                        });
                    }
                    HandlerCommand::Quit => break,
                }
            }
            debug!("handler actor shut down");
        });
        Self { cmd_tx }
    }

    /// Serve one inbound request. Used both by sessions (remote traffic)
    /// and by the broker's self-short-circuit.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let request_id = request.request_id;
        let sender = request.sender.clone();
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandlerCommand::Dispatch {
                request,
                reply: tx,
            })
            .await
            .is_err()
        {
            return failure(request_id, sender);
        }
        rx.await.unwrap_or_else(|_| failure(request_id, sender))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(HandlerCommand::Quit).await;
    }
}

fn failure(request_id: u64, sender: PeerInfo) -> RpcResponse {
    RpcResponse {
        request_id,
        sender,
        success: false,
        data: None,
        peers: Vec::new(),
    }
}

async fn serve(
    owner: &PeerInfo,
    config: &Config,
    routing: &RoutingHandle,
    store: &StoreHandle,
    request: RpcRequest,
) -> RpcResponse {
    // A request carries the sender's self-description; remember it.
    if request.sender.key != owner.key {
        let _ = routing.add(request.sender.clone()).await;
    }

    let reply = |success, data, peers| RpcResponse {
        request_id: request.request_id,
        sender: owner.clone(),
        success,
        data,
        peers,
    };

    match request.op {
        Operation::Ping => {
            trace!(from = %request.sender, "handling PING");
            // A ping is a self-targeted FIND_PEER: answer with our own
            // neighborhood so the caller learns something useful.
            let peers = routing.nearest(owner.key, config.k, false).await;
            reply(true, None, peers)
        }
        Operation::Store => {
            let Some(data) = request.data else {
                debug!(from = %request.sender, "STORE without payload");
                return reply(false, None, Vec::new());
            };
            debug!(
                from = %request.sender,
                key = %&request.target.to_hex()[..16],
                len = data.len(),
                "handling STORE"
            );
            store.put(request.target, data).await;
            reply(true, None, Vec::new())
        }
        Operation::FindPeer => {
            let peers = routing.nearest(request.target, config.k, false).await;
            trace!(
                from = %request.sender,
                target = %&request.target.to_hex()[..16],
                returned = peers.len(),
                "handling FIND_PEER"
            );
            // Success means "here are candidates", not "the key exists".
            let success = !peers.is_empty();
            reply(success, None, peers)
        }
        Operation::FindValue => {
            if let Some(data) = store.get(request.target).await {
                trace!(
                    from = %request.sender,
                    key = %&request.target.to_hex()[..16],
                    "FIND_VALUE hit"
                );
                return reply(true, Some(data), Vec::new());
            }
            let peers = routing.nearest(request.target, config.k, false).await;
            trace!(
                from = %request.sender,
                key = %&request.target.to_hex()[..16],
                closer = peers.len(),
                "FIND_VALUE miss"
            );
            reply(false, None, peers)
        }
    }
}
