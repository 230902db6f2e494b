use std::path::PathBuf;
use std::time::Duration;

use crate::identity::Identity;

use super::DEFAULT_REQUEST_TIMEOUT;

/// The width of lookup results and of a full bucket.
pub const DEFAULT_K: usize = 20;

/// Concurrent requests per iterative lookup.
pub const DEFAULT_ALPHA: usize = 3;

/// Default lifetime of a stored value.
pub const DEFAULT_STORAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How often locally published values are pushed back out to the
/// network.
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How often the engine's state is snapshotted to disk.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Probe failures before a node is evicted from the routing table.
pub const DEFAULT_MAX_NODE_FAILURES: u8 = 3;

#[derive(Debug)]
/// Node configuration.
pub struct Config {
    /// Bootstrap nodes, as `ip:port` strings.
    ///
    /// Defaults to an empty list; a node with no bootstrap addresses and
    /// no snapshot starts alone.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where [super::DEFAULT_PORT] is attempted first.
    pub port: Option<u16>,
    /// How long to wait for a response before abandoning an inflight
    /// request.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// The signing identity of this node. The node id is derived from it.
    ///
    /// Defaults to a fresh random identity.
    pub identity: Identity,
    /// Bucket size and lookup width.
    pub k: usize,
    /// Lookup concurrency.
    pub alpha: usize,
    /// TTL applied to values published through this node.
    pub storage_ttl: Duration,
    pub republish_interval: Duration,
    /// Where to persist routing table and storage snapshots.
    ///
    /// Defaults to None, disabling persistence.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    /// Probe failures before eviction.
    pub max_node_failures: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: vec![],
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            identity: Identity::random(),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            storage_ttl: DEFAULT_STORAGE_TTL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            snapshot_path: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            max_node_failures: DEFAULT_MAX_NODE_FAILURES,
        }
    }
}
