//! Peer descriptors.
//!
//! A [`PeerInfo`] is everything a node needs to reach another peer: its key,
//! its TCP endpoint, and a local last-seen timestamp. Two descriptors are
//! equal when key and address both match; the timestamp is bookkeeping and
//! never crosses the wire.

use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::key::Key;

#[derive(Clone)]
pub struct PeerInfo {
    pub key: Key,
    pub addr: SocketAddr,
    /// Last time we heard from this peer. Local bookkeeping only.
    pub last_seen: SystemTime,
}

impl PeerInfo {
    pub fn new(key: Key, addr: SocketAddr) -> Self {
        Self {
            key,
            addr,
            last_seen: SystemTime::now(),
        }
    }

    /// Refresh the heartbeat timestamp.
    pub fn touch(&mut self) {
        self.last_seen = SystemTime::now();
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.addr == other.addr
    }
}

impl Eq for PeerInfo {}

impl std::fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerInfo({}, {})", &self.key.to_hex()[..16], self.addr)
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, &self.key.to_hex()[..16])
    }
}

/// Wire shape: (key, ip string, port).
#[derive(Serialize, Deserialize)]
struct PeerInfoWire {
    key: Key,
    ip: String,
    port: u16,
}

impl Serialize for PeerInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PeerInfoWire {
            key: self.key,
            ip: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PeerInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = PeerInfoWire::deserialize(deserializer)?;
        let ip: IpAddr = wire
            .ip
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid peer ip: {}", wire.ip)))?;
        Ok(PeerInfo::new(wire.key, SocketAddr::new(ip, wire.port)))
    }
}
