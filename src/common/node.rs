//! Node entry in the routing table.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::Id;

/// A node is considered stale if it hasn't been heard from in this long.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);
/// A node should be pinged if it hasn't been heard from in this long.
pub const PING_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
/// Node entry in the routing table: an id, a network address, and the
/// ed25519 public key the id is derived from.
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
    pub public_key: [u8; 32],
    pub last_seen: Instant,
}

impl Node {
    pub fn new(id: Id, address: SocketAddrV4, public_key: [u8; 32]) -> Node {
        Node {
            id,
            address,
            public_key,
            last_seen: Instant::now(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    // === Public Methods ===

    /// Mark this node as heard from just now.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Node didn't respond for a while, and is a candidate for removal.
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_TIME
    }

    /// Node wasn't heard from recently enough, and is worth pinging.
    pub fn should_ping(&self) -> bool {
        self.last_seen.elapsed() > PING_TIME
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.address == other.address
            && self.public_key == other.public_key
    }
}

impl Eq for Node {}

#[cfg(test)]
impl Node {
    /// A node with a random id and a unique loopback address.
    pub(crate) fn random() -> Node {
        let port = rand::random::<u16>().max(1);

        Node::new(
            Id::random(),
            SocketAddrV4::new([127, 0, 0, 1].into(), port),
            rand::random(),
        )
    }

    /// A node with `i` as both its id and its port, for deterministic tests.
    pub(crate) fn unique(i: u64) -> Node {
        Node::new(
            Id::from_u64(i),
            SocketAddrV4::new([127, 0, 0, 1].into(), i as u16 + 1),
            rand::random(),
        )
    }
}
