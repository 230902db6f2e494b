//! Manage iterative lookups and their corresponding request/response.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{Id, Node};
use crate::messages::RequestSpecific;

use super::{protocol::Protocol, ClosestNodes};

/// A sender for the result of a lookup, registered by a caller.
#[derive(Debug, Clone)]
pub(crate) enum LookupSender {
    /// Resolves with the closest responding nodes to the target.
    Nodes(flume::Sender<Box<[Node]>>),
    /// Resolves with every value found under the key.
    Values(flume::Sender<Vec<Bytes>>),
}

/// An iterative process of concurrently sending a request to the closest
/// known nodes to the target, adding closer nodes discovered in the
/// responses as new candidates, and repeating until the closest k nodes
/// have all been visited.
///
/// At most `alpha` requests are kept in flight at a time.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    pub request: RequestSpecific,
    pub senders: Vec<LookupSender>,

    candidates: ClosestNodes,
    responders: ClosestNodes,
    /// Transaction id and node id per visited node.
    inflight_requests: Vec<(u16, Id)>,
    responded: HashSet<u16>,
    visited: HashSet<SocketAddrV4>,
    values: Vec<Bytes>,
    value_refs: HashSet<Id>,

    k: usize,
    alpha: usize,
}

impl IterativeQuery {
    pub fn new(target: Id, request: RequestSpecific, k: usize, alpha: usize) -> Self {
        trace!(?target, ?request, "New query");

        Self {
            request,
            senders: Vec::new(),

            candidates: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),
            inflight_requests: Vec::new(),
            responded: HashSet::new(),
            visited: HashSet::new(),
            values: Vec::new(),
            value_refs: HashSet::new(),

            k,
            alpha,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.candidates.target()
    }

    /// The closest responding nodes seen so far.
    pub fn responders(&self) -> &ClosestNodes {
        &self.responders
    }

    pub fn values(&self) -> &[Bytes] {
        &self.values
    }

    // === Public Methods ===

    /// Force start query traversal by visiting the closest candidates.
    pub fn start(&mut self, protocol: &mut Protocol) {
        self.visit_closest(protocol);
    }

    /// Add a candidate node to visit on the next tick if it is among the
    /// closest unvisited nodes.
    pub fn add_candidate(&mut self, node: Node) {
        self.candidates.add(node);
    }

    /// Visit an explicitly given address, usually a bootstrap node whose
    /// id isn't known yet.
    pub fn visit(&mut self, protocol: &mut Protocol, address: SocketAddrV4) {
        let tid = protocol.request(address, self.request.clone());

        self.inflight_requests.push((tid, Id::ZERO));
        self.visited.insert(address);
    }

    /// Return true if a response (by transaction_id) is expected by this
    /// query.
    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight_requests.iter().any(|(t, _)| *t == tid)
    }

    /// Record a response from a node.
    pub fn add_responding_node(&mut self, tid: u16, node: Node) {
        self.responded.insert(tid);
        self.responders.add(node);
    }

    /// Collect values from a response, deduplicated by their hash.
    pub fn add_values(&mut self, values: Vec<Bytes>) {
        for value in values {
            if self.value_refs.insert(Id::hash_of(&value)) {
                self.values.push(value);
            }
        }
    }

    /// After the query is done, the nodes that were visited but never
    /// responded.
    pub fn unresponsive(&self) -> Vec<Id> {
        self.inflight_requests
            .iter()
            .filter(|(tid, id)| !self.responded.contains(tid) && *id != Id::ZERO)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Visit more candidates and check for termination.
    ///
    /// Returns true if the query is done.
    pub fn tick(&mut self, protocol: &mut Protocol) -> bool {
        // A value-bearing response ends a FIND_VALUE lookup; no more
        // candidates are visited and outstanding requests are abandoned.
        if self.found_value() {
            let responded = &self.responded;
            self.inflight_requests
                .retain(|(tid, _)| responded.contains(tid) || !protocol.inflight(tid));

            debug!(
                target = ?self.target(),
                visited = self.visited.len(),
                values = self.values.len(),
                "Done query (found value)"
            );

            return true;
        }

        self.visit_closest(protocol);

        // Done once nothing is inflight anymore; everything worth
        // visiting has been visited and answered or timed out.
        let done = !self
            .inflight_requests
            .iter()
            .any(|(tid, _)| protocol.inflight(tid));

        if done {
            debug!(
                target = ?self.target(),
                candidates = self.candidates.len(),
                visited = self.visited.len(),
                responders = self.responders.len(),
                values = self.values.len(),
                "Done query"
            );
        }

        done
    }

    // === Private Methods ===

    /// True once a FIND_VALUE lookup holds at least one value.
    fn found_value(&self) -> bool {
        matches!(self.request, RequestSpecific::FindValue { .. }) && !self.values.is_empty()
    }

    /// Visit the closest unvisited candidates, keeping at most `alpha`
    /// requests in flight.
    fn visit_closest(&mut self, protocol: &mut Protocol) {
        let mut active = self
            .inflight_requests
            .iter()
            .filter(|(tid, _)| protocol.inflight(tid))
            .count();

        let to_visit = self
            .candidates
            .take(self.k)
            .iter()
            .filter(|node| !self.visited.contains(&node.address()))
            .map(|node| (node.id, node.address()))
            .collect::<Vec<_>>();

        for (id, address) in to_visit {
            if active >= self.alpha {
                break;
            }

            let tid = protocol.request(address, self.request.clone());

            self.inflight_requests.push((tid, id));
            self.visited.insert(address);
            active += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpc::config::Config;

    fn protocol() -> Protocol {
        Protocol::new(&Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn find_value_stops_after_first_value() {
        let mut protocol = protocol();
        let key = Id::from_u64(1);

        let mut query = IterativeQuery::new(key, RequestSpecific::FindValue { key }, 20, 1);
        query.add_candidate(Node::unique(2));
        query.add_candidate(Node::unique(3));
        query.start(&mut protocol);

        assert_eq!(query.visited.len(), 1);

        query.add_values(vec![Bytes::from_static(b"value")]);

        // Done on the next tick, without visiting the second candidate.
        assert!(query.tick(&mut protocol));
        assert_eq!(query.visited.len(), 1);
        assert_eq!(query.values().len(), 1);
    }

    #[test]
    fn find_node_runs_to_convergence() {
        let mut protocol = protocol();
        let target = Id::from_u64(1);

        let mut query = IterativeQuery::new(target, RequestSpecific::FindNode { target }, 20, 1);
        query.add_candidate(Node::unique(2));
        query.start(&mut protocol);

        // The visit is still inflight, so the lookup is not done.
        assert!(!query.tick(&mut protocol));
    }
}
