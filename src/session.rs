//! # Per-peer Session
//!
//! One session owns one duplex TCP stream to one remote peer and serializes
//! everything the node says to it. Two tasks split the work:
//!
//! - the **writer** owns the write half, stamps outbound requests with a
//!   monotonically increasing request id, and also flushes responses to
//!   inbound requests;
//! - the **reader** owns the read half, resolves responses against the
//!   pending map, hands inbound requests to the [`HandlerHandle`], learns
//!   the remote's identity from the first frame that names it, and feeds
//!   every returned peer list into the routing table.
//!
//! In-flight outbound requests are bounded by an owned-permit semaphore
//! (`req_buffer`); excess callers wait in [`SessionHandle::call`], never
//! inside the writer loop. Any transport or protocol error fails every
//! pending request with the same [`SessionError`], tears both tasks down,
//! and deregisters the peer through the broker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::broker::BrokerHandle;
use crate::handler::HandlerHandle;
use crate::key::Key;
use crate::messages::{read_frame, write_frame, Frame, Operation, RpcRequest, RpcResponse};
use crate::peer::PeerInfo;
use crate::routing::RoutingHandle;

/// Queued responses from inbound handling waiting for the writer.
const RESPONSE_CHANNEL_SIZE: usize = 32;

/// Failure delivered to callers when a session dies. Cloneable so one
/// transport error can fan out to every pending request.
#[derive(Clone, Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("session closed: {0}")]
    Closed(String),
}

struct OutboundCall {
    op: Operation,
    target: Key,
    data: Option<Vec<u8>>,
    reply: oneshot::Sender<Result<RpcResponse, SessionError>>,
    permit: OwnedSemaphorePermit,
}

struct PendingCall {
    reply: oneshot::Sender<Result<RpcResponse, SessionError>>,
    _permit: OwnedSemaphorePermit,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// Cloneable front door to one peer session.
#[derive(Clone)]
pub struct SessionHandle {
    pub addr: SocketAddr,
    out_tx: mpsc::Sender<OutboundCall>,
    limiter: Arc<Semaphore>,
    closed: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Issue one request and wait for its response. Waits for an in-flight
    /// slot first; the slot is held until the response (or failure) lands.
    pub async fn call(
        &self,
        op: Operation,
        target: Key,
        data: Option<Vec<u8>>,
    ) -> Result<RpcResponse, SessionError> {
        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SessionError::Closed("session retired".into()))?;
        let (tx, rx) = oneshot::channel();
        self.out_tx
            .send(OutboundCall {
                op,
                target,
                data,
                reply: tx,
                permit,
            })
            .await
            .map_err(|_| SessionError::Closed("session retired".into()))?;
        rx.await
            .unwrap_or_else(|_| Err(SessionError::Closed("session dropped the reply".into())))
    }

    /// Tear the session down. Pending and future calls fail with `Closed`.
    pub fn close(&self) {
        self.limiter.close();
        let _ = self.closed.send(true);
    }

    /// Whether two handles refer to the same underlying session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.out_tx.same_channel(&other.out_tx)
    }
}

pub struct Session;

impl Session {
    /// Wrap an established stream in a session and spawn its two tasks.
    ///
    /// `addr` is the map key the broker knows this session by: the remote's
    /// listening address for outbound connections, the socket's ephemeral
    /// address for inbound ones (re-keyed once the peer identifies itself).
    pub fn spawn(
        stream: TcpStream,
        addr: SocketAddr,
        local: PeerInfo,
        req_buffer: usize,
        handler: HandlerHandle,
        routing: RoutingHandle,
        broker: BrokerHandle,
    ) -> SessionHandle {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(req_buffer.max(1) * 2);
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let limiter = Arc::new(Semaphore::new(req_buffer.max(1)));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let handle = SessionHandle {
            addr,
            out_tx,
            limiter: limiter.clone(),
            closed: closed_tx.clone(),
        };

        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);

        tokio::spawn(write_loop(
            write_half,
            out_rx,
            response_rx,
            local.clone(),
            pending.clone(),
            closed_tx.clone(),
            closed_rx.clone(),
        ));

        tokio::spawn(read_loop(
            read_half,
            handle.clone(),
            local,
            pending,
            response_tx,
            closed_tx,
            closed_rx,
            handler,
            routing,
            broker,
        ));

        handle
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<OutboundCall>,
    mut response_rx: mpsc::Receiver<RpcResponse>,
    local: PeerInfo,
    pending: PendingMap,
    closed_tx: Arc<watch::Sender<bool>>,
    mut closed_rx: watch::Receiver<bool>,
) {
    let mut next_id: u64 = 1;
    loop {
        tokio::select! {
            _ = closed_rx.changed() => break,
            call = out_rx.recv() => {
                let Some(call) = call else { break };
                let request_id = next_id;
                next_id += 1;
                let frame = Frame::Request(RpcRequest {
                    request_id,
                    op: call.op,
                    sender: local.clone(),
                    target: call.target,
                    data: call.data,
                });
                pending.lock().await.insert(
                    request_id,
                    PendingCall { reply: call.reply, _permit: call.permit },
                );
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    fail_all(&pending, SessionError::Transport(e.to_string())).await;
                    let _ = closed_tx.send(true);
                    break;
                }
            }
            response = response_rx.recv() => {
                let Some(response) = response else { break };
                let frame = Frame::Response(response);
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    fail_all(&pending, SessionError::Transport(e.to_string())).await;
                    let _ = closed_tx.send(true);
                    break;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut read_half: OwnedReadHalf,
    handle: SessionHandle,
    local: PeerInfo,
    pending: PendingMap,
    response_tx: mpsc::Sender<RpcResponse>,
    closed_tx: Arc<watch::Sender<bool>>,
    mut closed_rx: watch::Receiver<bool>,
    handler: HandlerHandle,
    routing: RoutingHandle,
    broker: BrokerHandle,
) {
    let mut identified = false;
    let error = loop {
        tokio::select! {
            _ = closed_rx.changed() => {
                break SessionError::Closed("session retired".into());
            }
            frame = read_frame(&mut read_half) => match frame {
                Ok(None) => {
                    break SessionError::Closed("peer closed the connection".into());
                }
                Err(e) => break classify_read_error(e),
                Ok(Some(Frame::Response(response))) => {
                    identify(
                        &mut identified,
                        &response.sender,
                        &local,
                        &handle,
                        &broker,
                    )
                    .await;
                    for peer in &response.peers {
                        if peer.key != local.key {
                            let _ = routing.add(peer.clone()).await;
                        }
                    }
                    match pending.lock().await.remove(&response.request_id) {
                        Some(call) => {
                            let _ = call.reply.send(Ok(response));
                        }
                        None => warn!(
                            peer = %handle.addr,
                            request_id = response.request_id,
                            "response for unknown request id"
                        ),
                    }
                }
                Ok(Some(Frame::Request(request))) => {
                    identify(&mut identified, &request.sender, &local, &handle, &broker).await;
                    let handler = handler.clone();
                    let response_tx = response_tx.clone();
                    tokio::spawn(async move {
                        let response = handler.dispatch(request).await;
                        let _ = response_tx.send(response).await;
                    });
                }
            }
        }
    };

    debug!(peer = %handle.addr, error = %error, "session ended");
    fail_all(&pending, error).await;
    handle.limiter.close();
    let _ = closed_tx.send(true);
    broker.deregister(handle.addr, Some(handle.clone()), true).await;
}

/// Register the remote with the broker (and through it, the routing table)
/// the first time a frame names it.
async fn identify(
    identified: &mut bool,
    sender: &PeerInfo,
    local: &PeerInfo,
    handle: &SessionHandle,
    broker: &BrokerHandle,
) {
    if *identified || sender.key == local.key {
        return;
    }
    *identified = true;
    trace!(peer = %sender, "session identified its remote");
    broker.register(sender.clone(), handle.clone(), true).await;
}

async fn fail_all(pending: &PendingMap, error: SessionError) {
    let mut map = pending.lock().await;
    if map.is_empty() {
        return;
    }
    debug!(failed = map.len(), error = %error, "failing pending requests");
    for (_, call) in map.drain() {
        let _ = call.reply.send(Err(error.clone()));
    }
}

fn classify_read_error(e: anyhow::Error) -> SessionError {
    if e.chain().any(|cause| cause.is::<std::io::Error>()) {
        SessionError::Transport(e.to_string())
    } else {
        SessionError::Protocol(e.to_string())
    }
}
