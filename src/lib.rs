//! # Xorbit - Content-addressed DHT over TCP
//!
//! Xorbit is a peer node of a Kademlia-style distributed hash table.
//! Values are indexed by the SHA-256 hash of their bytes, and each node is
//! responsible for the keys nearest its own identifier in XOR distance.
//! Peers speak four primitive operations to each other (PING, STORE,
//! FIND_PEER, FIND_VALUE) and expose PUT, GET, STATS and REFRESH to local
//! callers.
//!
//! ## Architecture
//!
//! The codebase uses the **actor pattern** throughout: each stateful
//! component has a public cloneable handle and a private actor task that
//! owns all mutable state and processes commands sequentially. Handles talk
//! over async channels; replies ride on oneshot channels inside commands.
//! One [`NodeContext`] per node carries every handle, so multiple nodes run
//! cleanly in a single process.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `key` | 256-bit identifiers, SHA-256 content keys, XOR distance |
//! | `peer` | peer descriptors (key, address, last-seen) |
//! | `mru` | recency-ordered bounded cache with age expiry |
//! | `routing` | prefix tree of k-buckets with the Kademlia split rule |
//! | `store` | two-tier local value store (cache + long-term) |
//! | `messages` | wire frames, operations, bounded bincode codec |
//! | `session` | one multiplexed request/response stream per peer |
//! | `broker` | session pool with MRU eviction and self-dispatch |
//! | `handler` | serves inbound PING/STORE/FIND_PEER/FIND_VALUE |
//! | `lookup` | iterative closest-nodes engine; PUT/GET/REFRESH drivers |
//! | `node` | supervisor wiring everything, TCP listener, discovery |
//! | `config` | tunables (k, α, store size, ages, pool bounds) |

mod broker;
mod config;
mod handler;
mod key;
mod lookup;
mod messages;
mod mru;
mod node;
mod peer;
mod routing;
mod session;
mod store;

pub use broker::{BrokerHandle, BrokerStats, WireCall};
pub use config::Config;
pub use handler::HandlerHandle;
pub use key::{distance_cmp, Distance, Key, KEY_BITS};
pub use messages::{Frame, Operation, RpcRequest, RpcResponse};
pub use node::{
    FailureKind, Node, NodeContext, NodeStats, PeerOp, PeerRequest, PeerResponse,
};
pub use mru::MruCache;
pub use peer::PeerInfo;
pub use routing::{RoutingHandle, RoutingTable};
pub use session::{Session, SessionError, SessionHandle};
pub use store::{StoreHandle, StoreStats};
