//! Kademlia routing table with range-split k-buckets.

use std::collections::VecDeque;

use tracing::trace;

use crate::common::{Id, Node};
use crate::rpc::ClosestNodes;

/// K = the default maximum size of a k-bucket, and the width of lookup
/// results.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone)]
/// Kademlia routing table: an ordered list of [KBucket]s whose ranges are
/// pairwise disjoint and together cover the entire id space.
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: Vec<KBucket>,
}

#[derive(Debug, Clone, PartialEq)]
/// The result of [RoutingTable::add].
pub enum AddOutcome {
    /// The node was appended to a bucket.
    Added,
    /// The node was already present; moved to the most-recently-seen end.
    Refreshed,
    /// The node is the table owner, or otherwise not eligible.
    Ignored,
    /// The bucket is full and not splittable. The node went into the
    /// bucket's replacement cache; `stale` is the least-recently-seen
    /// bucket member, which the engine should probe and, on failure,
    /// evict with [RoutingTable::evict_and_replace].
    Full { stale: Node },
}

impl RoutingTable {
    /// Create a new [RoutingTable] centered on `id`, with a single bucket
    /// covering the full id space.
    pub fn new(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k,
            buckets: vec![KBucket::new(Id::ZERO, Id::MAX, k)],
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub(crate) fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    // === Public Methods ===

    /// Attempt to add a node to this routing table.
    ///
    /// Keeps at most one entry per socket address: a new id advertised from
    /// a known address replaces the old entry, so a restarted (or spoofed)
    /// peer can't occupy two slots.
    pub fn add(&mut self, node: Node) -> AddOutcome {
        if node.id == self.id {
            return AddOutcome::Ignored;
        }

        self.remove_other_id_at_address(&node);

        loop {
            let index = self.bucket_index(&node.id);
            let bucket = &mut self.buckets[index];

            if bucket.refresh(&node.id) {
                return AddOutcome::Refreshed;
            }

            if bucket.add(node.clone()) {
                return AddOutcome::Added;
            }

            // Full bucket. Only the bucket covering our own id splits.
            if bucket.covers(&self.id) && bucket.splittable() {
                let bucket = self.buckets.remove(index);
                let (low, high) = bucket.split();

                trace!(low = ?low.range(), high = ?high.range(), "Split bucket");

                self.buckets.insert(index, high);
                self.buckets.insert(index, low);

                continue;
            }

            let stale = bucket
                .least_recently_seen()
                .cloned()
                .unwrap_or_else(|| node.clone());

            bucket.push_replacement(node);

            return AddOutcome::Full { stale };
        }
    }

    /// Remove a node from this routing table without promoting a
    /// replacement.
    pub fn remove(&mut self, node_id: &Id) {
        let index = self.bucket_index(node_id);
        self.buckets[index].remove(node_id);
    }

    /// Remove a node that failed a liveness probe and promote the most
    /// recent entry from its bucket's replacement cache, if any.
    pub fn evict_and_replace(&mut self, node_id: &Id) {
        let index = self.bucket_index(node_id);
        let bucket = &mut self.buckets[index];

        bucket.remove(node_id);

        if let Some(replacement) = bucket.pop_replacement() {
            trace!(id = ?replacement.id, "Promoted replacement cache entry");
            bucket.add(replacement);
        }
    }

    /// Return the `count` nodes closest to `target` across all buckets.
    pub fn closest(&self, target: &Id, count: usize) -> Box<[Node]> {
        let mut closest = ClosestNodes::new(*target);

        for bucket in &self.buckets {
            for node in bucket.iter() {
                closest.add(node.clone());
            }
        }

        closest.nodes()[..count.min(closest.len())].into()
    }

    /// Returns `true` if this routing table has no nodes.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// An iterator over all nodes in the table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Node> {
        self.nodes().cloned().collect()
    }

    /// Turn this routing table into a list of bootstrapping addresses.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.nodes()
            .filter(|node| !node.is_stale())
            .map(|node| node.address().to_string())
            .collect()
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        self.buckets[self.bucket_index(node_id)].position(node_id).is_some()
    }

    // === Private Methods ===

    fn bucket_index(&self, id: &Id) -> usize {
        // Ranges are sorted and cover the space, so exactly one matches.
        self.buckets
            .iter()
            .position(|bucket| bucket.covers(id))
            .expect("bucket ranges cover the id space")
    }

    fn remove_other_id_at_address(&mut self, node: &Node) {
        for bucket in &mut self.buckets {
            if let Some(index) = bucket
                .iter()
                .position(|n| n.address == node.address && n.id != node.id)
            {
                trace!(
                    address = ?node.address,
                    old = ?bucket.nodes[index].id,
                    new = ?node.id,
                    "Replacing routing table entry at same address"
                );
                bucket.nodes.remove(index);
            }
        }
    }
}

/// A fixed-capacity bucket of nodes whose ids fall in a contiguous,
/// inclusive range of the id space, ordered least-recently-seen first,
/// with a bounded FIFO replacement cache.
#[derive(Debug, Clone)]
pub struct KBucket {
    low: Id,
    high: Id,
    k: usize,
    nodes: Vec<Node>,
    replacements: VecDeque<Node>,
}

impl KBucket {
    pub fn new(low: Id, high: Id, k: usize) -> Self {
        KBucket {
            low,
            high,
            k,
            nodes: Vec::with_capacity(k),
            replacements: VecDeque::new(),
        }
    }

    // === Getters ===

    pub fn range(&self) -> (Id, Id) {
        (self.low, self.high)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn covers(&self, id: &Id) -> bool {
        self.low <= *id && *id <= self.high
    }

    pub(crate) fn replacements(&self) -> &VecDeque<Node> {
        &self.replacements
    }

    // === Public Methods ===

    /// Append the node if the bucket has room and the node isn't already
    /// present; returns false when full.
    pub fn add(&mut self, node: Node) -> bool {
        if self.position(&node.id).is_some() {
            return self.refresh(&node.id);
        }

        if self.nodes.len() < self.k {
            self.nodes.push(node);
            return true;
        }

        false
    }

    /// Move an already-present node to the most-recently-seen end and
    /// update its last-seen time.
    pub fn refresh(&mut self, node_id: &Id) -> bool {
        if let Some(index) = self.position(node_id) {
            let mut node = self.nodes.remove(index);
            node.touch();
            self.nodes.push(node);

            return true;
        }

        false
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.nodes.retain(|node| node.id != *node_id);
    }

    /// Split this bucket at the midpoint of its range, redistributing
    /// nodes and cached replacements by range membership.
    pub fn split(self) -> (KBucket, KBucket) {
        let mid = Id::midpoint(&self.low, &self.high);

        let mut low = KBucket::new(self.low, mid, self.k);
        let mut high = KBucket::new(mid.successor(), self.high, self.k);

        for node in self.nodes {
            if low.covers(&node.id) {
                low.nodes.push(node);
            } else {
                high.nodes.push(node);
            }
        }

        for node in self.replacements {
            let half = if low.covers(&node.id) { &mut low } else { &mut high };
            half.push_replacement(node);
        }

        (low, high)
    }

    /// A bucket spanning a single id cannot split further.
    pub fn splittable(&self) -> bool {
        self.low < self.high
    }

    pub fn least_recently_seen(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Push a node into the bounded replacement cache, dropping the oldest
    /// cached entry when full.
    pub fn push_replacement(&mut self, node: Node) {
        self.replacements.retain(|cached| cached.id != node.id);

        if self.replacements.len() >= self.k {
            self.replacements.pop_front();
        }

        self.replacements.push_back(node);
    }

    /// Take the most recently cached replacement.
    pub fn pop_replacement(&mut self) -> Option<Node> {
        self.replacements.pop_back()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    fn position(&self, node_id: &Id) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == *node_id)
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;

    fn assert_ranges_partition_id_space(table: &RoutingTable) {
        let buckets = table.buckets();

        assert_eq!(buckets.first().map(|b| b.range().0), Some(Id::ZERO));
        assert_eq!(buckets.last().map(|b| b.range().1), Some(Id::MAX));

        for pair in buckets.windows(2) {
            let (_, prev_high) = pair[0].range();
            let (next_low, _) = pair[1].range();

            assert_eq!(prev_high.successor(), next_low);
        }
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);
        assert!(table.is_empty());

        table.add(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);
        let node = Node::new(*table.id(), SocketAddrV4::new(0.into(), 1), rand::random());

        assert_eq!(table.add(node), AddOutcome::Ignored);
        assert!(table.is_empty())
    }

    #[test]
    fn split_redistributes_by_range() {
        let mut bucket = KBucket::new(Id::from_u64(0), Id::from_u64(10), 5);
        assert!(bucket.add(Node::unique(5)));
        assert!(bucket.add(Node::unique(6)));

        let (one, two) = bucket.split();

        assert_eq!(one.range(), (Id::from_u64(0), Id::from_u64(5)));
        assert_eq!(one.len(), 1);
        assert_eq!(one.iter().next().map(|n| n.id), Some(Id::from_u64(5)));

        assert_eq!(two.range(), (Id::from_u64(6), Id::from_u64(10)));
        assert_eq!(two.len(), 1);
        assert_eq!(two.iter().next().map(|n| n.id), Some(Id::from_u64(6)));
    }

    #[test]
    fn bucket_never_exceeds_k() {
        let mut bucket = KBucket::new(Id::ZERO, Id::MAX, 2);

        assert!(bucket.add(Node::random()));
        assert!(bucket.add(Node::random()));
        assert!(!bucket.add(Node::random()));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn readd_moves_to_most_recent_without_duplicate() {
        let mut bucket = KBucket::new(Id::ZERO, Id::MAX, 3);

        let first = Node::random();
        bucket.add(first.clone());
        bucket.add(Node::random());
        bucket.add(Node::random());

        assert_eq!(bucket.iter().next().map(|n| n.id), Some(first.id));

        bucket.add(first.clone());

        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.iter().last().map(|n| n.id), Some(first.id));
    }

    #[test]
    fn full_unsplittable_bucket_fills_replacement_cache() {
        let owner = Id::from_u64(0);
        let mut table = RoutingTable::new(owner, 2);

        // High half of the space doesn't cover the owner, so its bucket
        // can't split once the table has split at least once.
        let mut high_ids = vec![];
        for i in 0..20u64 {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = i as u8 + 1;
            high_ids.push(Id(bytes));
        }

        let mut outcomes = vec![];
        for id in &high_ids {
            let node = Node::new(
                *id,
                SocketAddrV4::new([127, 0, 0, 1].into(), 10_000 + id.0[19] as u16),
                rand::random(),
            );
            outcomes.push(table.add(node));
        }

        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, AddOutcome::Full { .. })));

        // Every bucket respects its capacity.
        for bucket in table.buckets() {
            assert!(bucket.len() <= 2);
            assert!(bucket.replacements().len() <= 2);
        }

        assert_ranges_partition_id_space(&table);
    }

    #[test]
    fn splits_bucket_containing_owner() {
        let owner = Id::from_u64(1);
        let mut table = RoutingTable::new(owner, 2);

        for i in 2..30u64 {
            table.add(Node::unique(i));
        }

        assert!(table.buckets().len() > 1);
        assert_ranges_partition_id_space(&table);
    }

    #[test]
    fn evict_and_replace_promotes_cached_node() {
        let mut bucket = KBucket::new(Id::ZERO, Id::MAX, 2);
        let stale = Node::random();

        bucket.add(stale.clone());
        bucket.add(Node::random());

        let replacement = Node::random();
        bucket.push_replacement(replacement.clone());

        let mut table = RoutingTable::new(Id::random(), 2);
        table.buckets = vec![bucket];

        table.evict_and_replace(&stale.id);

        assert!(!table.contains(&stale.id));
        assert!(table.contains(&replacement.id));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn replacement_cache_is_bounded_fifo() {
        let mut bucket = KBucket::new(Id::ZERO, Id::MAX, 2);

        let first = Node::random();
        bucket.push_replacement(first.clone());
        bucket.push_replacement(Node::random());
        bucket.push_replacement(Node::random());

        assert_eq!(bucket.replacements().len(), 2);
        assert!(bucket
            .replacements()
            .iter()
            .all(|cached| cached.id != first.id));
    }

    #[test]
    fn one_entry_per_address() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);

        let first = Node::random();
        table.add(first.clone());

        let second = Node::new(Id::random(), first.address, rand::random());
        table.add(second.clone());

        assert_eq!(table.size(), 1);
        assert!(table.contains(&second.id));
        assert!(!table.contains(&first.id));
    }

    #[test]
    fn closest_k_correctness() {
        let target = Id::random();
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);

        let mut nodes = vec![];
        for _ in 0..200 {
            let node = Node::random();
            table.add(node.clone());
            nodes.push(node);
        }

        let closest = table.closest(&target, MAX_BUCKET_SIZE_K);
        assert!(closest.len() <= MAX_BUCKET_SIZE_K);

        // No returned node is farther than any node the table kept but
        // excluded from the result.
        let in_table: Vec<_> = table.to_owned_nodes();
        let max_returned = closest
            .iter()
            .map(|node| node.id.xor(&target))
            .max()
            .expect("closest is not empty");

        for node in in_table {
            if !closest.iter().any(|c| c.id == node.id) {
                assert!(node.id.xor(&target) >= max_returned);
            }
        }
    }
}
