use tracing::{debug, trace};

use crate::common::{Id, Node};
use crate::messages::RequestSpecific;

use super::protocol::Protocol;

/// Once an [super::iterative_query::IterativeQuery] is done, the value
/// (or its deletion) is pushed to the closest responding nodes using a
/// StoreQuery, which counts acknowledging nodes.
#[derive(Debug)]
pub(crate) struct StoreQuery {
    pub target: Id,
    pub request: RequestSpecific,
    pub sender: Option<flume::Sender<Result<Id, PutError>>>,
    /// Nodes that confirmed success.
    stored_at: u8,
    inflight_requests: Vec<u16>,
}

impl StoreQuery {
    pub fn new(
        target: Id,
        request: RequestSpecific,
        sender: Option<flume::Sender<Result<Id, PutError>>>,
    ) -> Self {
        Self {
            target,
            request,
            sender,
            stored_at: 0,
            inflight_requests: Vec::new(),
        }
    }

    /// Send the write request to the closest responding nodes from a
    /// finished lookup.
    pub fn start(&mut self, protocol: &mut Protocol, nodes: &[Node]) -> Result<(), PutError> {
        if self.started() {
            return Ok(());
        }

        let target = self.target;
        trace!(?target, nodes = nodes.len(), "StoreQuery start");

        if nodes.is_empty() {
            return Err(PutError::NoClosestNodes);
        }

        for node in nodes.iter().take(u8::MAX as usize) {
            let tid = protocol.request(node.address(), self.request.clone());
            self.inflight_requests.push(tid);
        }

        Ok(())
    }

    pub fn started(&self) -> bool {
        !self.inflight_requests.is_empty()
    }

    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight_requests.contains(&tid)
    }

    pub fn success(&mut self) {
        debug!(target = ?self.target, "StoreQuery got success response");
        self.stored_at = self.stored_at.saturating_add(1);
    }

    /// Check if the query is done.
    ///
    /// An error means no node acknowledged the write.
    pub fn tick(&mut self, protocol: &Protocol) -> Result<bool, PutError> {
        // Didn't start yet.
        if self.inflight_requests.is_empty() {
            return Ok(false);
        }

        // All requests got responses or timed out.
        if self.is_done(protocol) {
            let target = self.target;

            if self.stored_at == 0 {
                debug!(
                    ?target,
                    nodes_count = self.inflight_requests.len(),
                    "StoreQuery failed"
                );

                return Err(PutError::Timeout);
            }

            debug!(?target, stored_at = self.stored_at, "StoreQuery done");

            return Ok(true);
        }

        Ok(false)
    }

    fn is_done(&self, protocol: &Protocol) -> bool {
        !self
            .inflight_requests
            .iter()
            .any(|tid| protocol.inflight(tid))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Errors resolving a write (store or delete) on the network.
pub enum PutError {
    /// Failed to find any nodes close to the target, which usually means
    /// the node failed to bootstrap and the routing table is empty.
    #[error("Failed to find any nodes close to the target")]
    NoClosestNodes,

    /// No node acknowledged the write before the request timeout.
    #[error("Write timed out with no acknowledgements")]
    Timeout,
}
