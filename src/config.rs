//! Node configuration.

use std::time::Duration;

/// Tunables for a single node. `Default` carries the production values;
/// tests shrink them to force splits, evictions and expiry quickly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket size and target replication factor.
    pub k: usize,
    /// Lookup parallelism per round.
    pub alpha: usize,
    /// Cache-tier capacity in entries.
    pub store_size: usize,
    /// Age limit for both store tiers.
    pub max_age: Duration,
    /// Live sessions kept by the connection broker.
    pub max_connections: usize,
    /// Outstanding requests allowed per peer session.
    pub req_buffer: usize,
    /// Period of the self-refresh lookup.
    pub refresh_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 2,
            store_size: 100,
            max_age: Duration::from_secs(24 * 60 * 60),
            max_connections: 50,
            req_buffer: 10,
            refresh_interval: Duration::from_secs(10 * 60),
        }
    }
}
