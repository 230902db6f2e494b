//! The DHT engine: iterative queries, request serving, and table and
//! storage maintenance.

mod closest_nodes;
pub(crate) mod config;
pub(crate) mod iterative_query;
pub(crate) mod protocol;
pub(crate) mod store_query;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::common::{Id, Node};
use crate::error::TransportError;
use crate::messages::{Message, MessageType, RequestSpecific, ResponseSpecific};
use crate::routing_table::{AddOutcome, RoutingTable};
use crate::snapshot;
use crate::storage::{LocalStorage, MAX_STORED_KEYS};

pub use crate::transport::DEFAULT_PORT;
pub use closest_nodes::ClosestNodes;
pub use config::Config;
pub use protocol::DEFAULT_REQUEST_TIMEOUT;
pub use store_query::PutError;

use iterative_query::{IterativeQuery, LookupSender};
use protocol::Protocol;
use store_query::StoreQuery;

const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const REPUBLISH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Rpc {
    protocol: Protocol,
    routing_table: RoutingTable,
    storage: LocalStorage,

    queries: HashMap<Id, IterativeQuery>,
    store_queries: HashMap<Id, StoreQuery>,
    /// Writes waiting for their lookup to finish.
    pending_stores: Vec<StoreQuery>,
    /// Outstanding liveness probes as (transaction_id, node_id).
    probes: Vec<(u16, Id)>,
    failures: HashMap<Id, u8>,

    /// Last time we refreshed the routing table with a find_node query.
    last_table_refresh: Instant,
    /// Last time we pinged nodes in the routing table.
    last_table_ping: Instant,
    last_sweep: Instant,
    last_republish_check: Instant,
    last_snapshot: Instant,

    // Options
    config: Config,
}

impl Rpc {
    pub fn new(config: Config) -> Result<Self, TransportError> {
        let protocol = Protocol::new(&config)?;
        let id = *protocol.id();

        let mut rpc = Rpc {
            protocol,
            routing_table: RoutingTable::new(id, config.k),
            storage: LocalStorage::new(MAX_STORED_KEYS),

            queries: HashMap::new(),
            store_queries: HashMap::new(),
            pending_stores: Vec::new(),
            probes: Vec::new(),
            failures: HashMap::new(),

            last_table_refresh: Instant::now(),
            last_table_ping: Instant::now(),
            last_sweep: Instant::now(),
            last_republish_check: Instant::now(),
            last_snapshot: Instant::now(),

            config,
        };

        rpc.restore_snapshot();
        rpc.populate();

        Ok(rpc)
    }

    // === Getters ===

    /// Returns the address this node is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.protocol.local_addr()
    }

    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    /// Returns a clone of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.routing_table.clone()
    }

    /// Non-stale routing table entries as `ip:port` strings, usable to
    /// bootstrap another node.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.routing_table.to_bootstrap()
    }

    // === Public Methods ===

    /// One turn of the engine's event loop.
    pub fn tick(&mut self) {
        // === Tick lookups ===

        let queries = &mut self.queries;
        let protocol = &mut self.protocol;

        let done_targets: Vec<Id> = queries
            .iter_mut()
            .filter_map(|(target, query)| {
                if query.tick(protocol) {
                    Some(*target)
                } else {
                    None
                }
            })
            .collect();

        for target in done_targets {
            self.finish_query(target);
        }

        // === Tick writes ===

        let mut finished_stores = vec![];
        for (target, query) in self.store_queries.iter_mut() {
            match query.tick(&self.protocol) {
                Ok(false) => {}
                Ok(true) => finished_stores.push((*target, Ok(*target))),
                Err(error) => finished_stores.push((*target, Err(error))),
            }
        }
        for (target, result) in finished_stores {
            if let Some(query) = self.store_queries.remove(&target) {
                if let Some(sender) = query.sender {
                    let _ = sender.send(result);
                }
            }
        }

        self.check_probes();
        self.maintenance();

        self.protocol.tick();

        if let Some((message, from)) = self.protocol.recv_from() {
            // Add the sender to our routing table on any valid message.
            self.add_node(&message, from);

            match &message.message_type {
                MessageType::Request(request) => {
                    self.handle_request(from, &message, request.clone());
                }
                MessageType::Response(_) => {
                    self.handle_response(from, &message);
                }
            }
        }
    }

    /// Start or join a lookup for the values under a key.
    pub fn get(&mut self, key: Id, sender: flume::Sender<Vec<Bytes>>) {
        let local = self.storage.get(&key, SystemTime::now());

        self.query(
            key,
            RequestSpecific::FindValue { key },
            Some(LookupSender::Values(sender)),
        );

        if let Some(query) = self.queries.get_mut(&key) {
            query.add_values(local);
        }
    }

    /// Find the closest responding nodes to a target.
    pub fn resolve(&mut self, target: Id, sender: flume::Sender<Box<[Node]>>) {
        self.query(
            target,
            RequestSpecific::FindNode { target },
            Some(LookupSender::Nodes(sender)),
        );
    }

    /// Store a value under a key on the closest nodes to it, keeping a
    /// local replica that will be republished before it expires.
    pub fn put(
        &mut self,
        key: Id,
        value: Bytes,
        sender: Option<flume::Sender<Result<Id, PutError>>>,
    ) {
        let ttl = self.config.storage_ttl;

        self.storage.put(
            key,
            value.clone(),
            self.config.identity.public_key(),
            ttl,
            true,
            SystemTime::now(),
        );

        self.store(key, RequestSpecific::Store { key, value, ttl }, sender);
    }

    /// Remove a previously published value from the network. Only the
    /// publisher's deletes are honored by remote nodes.
    pub fn delete(
        &mut self,
        key: Id,
        value_ref: Id,
        sender: Option<flume::Sender<Result<Id, PutError>>>,
    ) {
        self.storage
            .delete(&key, &value_ref, &self.config.identity.public_key());

        self.store(key, RequestSpecific::Delete { key, value_ref }, sender);
    }

    /// Snapshot state if configured, and close every connection.
    pub fn shutdown(&mut self) {
        self.save_snapshot();
        self.protocol.shutdown();
    }

    // === Private Methods ===

    /// Send a message to closer and closer nodes until no closer nodes
    /// are found. Concurrent lookups for the same target share one query.
    fn query(&mut self, target: Id, request: RequestSpecific, sender: Option<LookupSender>) {
        // If a lookup for this target is still active, join it.
        if let Some(query) = self.queries.get_mut(&target) {
            if let Some(sender) = sender {
                query.senders.push(sender);
            }

            return;
        }

        let mut query = IterativeQuery::new(target, request, self.config.k, self.config.alpha);

        if let Some(sender) = sender {
            query.senders.push(sender);
        }

        // Seed the query either with the closest nodes from the routing
        // table, or the bootstrapping nodes when the table is empty.
        let closest = self.routing_table.closest(&target, self.config.k);

        if closest.is_empty() {
            for bootstrap_node in self.config.bootstrap.clone() {
                if let Ok(addresses) = bootstrap_node.to_socket_addrs() {
                    for address in addresses {
                        if let SocketAddr::V4(address) = address {
                            query.visit(&mut self.protocol, address);
                        }
                    }
                }
            }
        } else {
            for node in closest.into_vec() {
                query.add_candidate(node)
            }

            query.start(&mut self.protocol);
        }

        self.queries.insert(target, query);
    }

    /// Queue a write behind a lookup for its target.
    fn store(
        &mut self,
        target: Id,
        request: RequestSpecific,
        sender: Option<flume::Sender<Result<Id, PutError>>>,
    ) {
        self.pending_stores
            .push(StoreQuery::new(target, request, sender));

        self.query(target, RequestSpecific::FindNode { target }, None);
    }

    /// Deliver a finished lookup's results and start any writes that were
    /// waiting on it.
    fn finish_query(&mut self, target: Id) {
        let Some(query) = self.queries.remove(&target) else {
            return;
        };

        for id in query.unresponsive() {
            self.note_failure(id);
        }

        if target == *self.id() {
            let table_size = self.routing_table.size();

            if table_size == 0 {
                error!("Could not bootstrap the routing table");
            } else {
                debug!(table_size, "Populated the routing table");
            }
        }

        let closest = query.responders().take(self.config.k).to_vec();

        for sender in &query.senders {
            match sender {
                LookupSender::Nodes(sender) => {
                    let _ = sender.send(closest.clone().into_boxed_slice());
                }
                LookupSender::Values(sender) => {
                    let _ = sender.send(query.values().to_vec());
                }
            }
        }

        let mut waiting = vec![];
        let mut remaining = vec![];
        for pending in self.pending_stores.drain(..) {
            if pending.target == target {
                waiting.push(pending);
            } else {
                remaining.push(pending);
            }
        }
        self.pending_stores = remaining;

        for mut store_query in waiting {
            match store_query.start(&mut self.protocol, &closest) {
                Ok(()) => {
                    self.store_queries.insert(target, store_query);
                }
                Err(error) => {
                    if let Some(sender) = store_query.sender {
                        let _ = sender.send(Err(error));
                    }
                }
            }
        }
    }

    fn handle_request(&mut self, from: SocketAddrV4, message: &Message, request: RequestSpecific) {
        let transaction_id = message.transaction_id;

        match request {
            RequestSpecific::Ping => {
                self.protocol
                    .response(from, transaction_id, ResponseSpecific::Ping);
            }
            RequestSpecific::FindNode { target } => {
                self.protocol.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Nodes {
                        nodes: self.closest_for_response(&target, &message.sender_id),
                    },
                );
            }
            RequestSpecific::FindValue { key } => {
                let values = self.storage.get(&key, SystemTime::now());
                let nodes = self.closest_for_response(&key, &message.sender_id);

                self.protocol.response(
                    from,
                    transaction_id,
                    if values.is_empty() {
                        ResponseSpecific::Nodes { nodes }
                    } else {
                        ResponseSpecific::Values { values, nodes }
                    },
                );
            }
            RequestSpecific::Store { key, value, ttl } => {
                self.storage.put(
                    key,
                    value,
                    message.sender_public_key,
                    ttl,
                    false,
                    SystemTime::now(),
                );

                self.protocol
                    .response(from, transaction_id, ResponseSpecific::Stored);
            }
            RequestSpecific::Delete { key, value_ref } => {
                let removed =
                    self.storage
                        .delete(&key, &value_ref, &message.sender_public_key);

                if !removed {
                    debug!(?key, ?from, "Delete request matched nothing");
                }

                // Deletes are idempotent; ack either way.
                self.protocol
                    .response(from, transaction_id, ResponseSpecific::Deleted);
            }
        }
    }

    fn handle_response(&mut self, from: SocketAddrV4, message: &Message) {
        let tid = message.transaction_id;

        // Liveness probes.
        if let Some(position) = self.probes.iter().position(|(t, _)| *t == tid) {
            let (_, node_id) = self.probes.swap_remove(position);
            self.failures.remove(&node_id);
            return;
        }

        // Writes.
        if let Some(query) = self
            .store_queries
            .values_mut()
            .find(|query| query.inflight(tid))
        {
            if matches!(
                message.message_type,
                MessageType::Response(ResponseSpecific::Stored)
                    | MessageType::Response(ResponseSpecific::Deleted)
            ) {
                query.success();
            }
            return;
        }

        // Lookups.
        if let Some(query) = self.queries.values_mut().find(|query| query.inflight(tid)) {
            let responder = Node::new(message.sender_id, from, message.sender_public_key);
            query.add_responding_node(tid, responder);

            match &message.message_type {
                MessageType::Response(ResponseSpecific::Nodes { nodes }) => {
                    for node in nodes.clone() {
                        query.add_candidate(node);
                    }
                }
                MessageType::Response(ResponseSpecific::Values { values, nodes }) => {
                    for node in nodes.clone() {
                        query.add_candidate(node);
                    }
                    query.add_values(values.clone());
                }
                _ => {}
            }
        }
    }

    /// The k closest nodes to a target, excluding the requester itself.
    fn closest_for_response(&self, target: &Id, requester: &Id) -> Vec<Node> {
        self.routing_table
            .closest(target, self.config.k + 1)
            .iter()
            .filter(|node| node.id != *requester)
            .take(self.config.k)
            .cloned()
            .collect()
    }

    fn add_node(&mut self, message: &Message, from: SocketAddrV4) {
        let node = Node::new(message.sender_id, from, message.sender_public_key);

        match self.routing_table.add(node) {
            AddOutcome::Full { stale } => {
                // Probe the least-recently-seen member; if it fails
                // enough times the cached replacement takes its place.
                if !self.probes.iter().any(|(_, id)| *id == stale.id) {
                    self.probe(&stale);
                }
            }
            AddOutcome::Refreshed => {
                self.failures.remove(&message.sender_id);
            }
            _ => {}
        }
    }

    fn probe(&mut self, node: &Node) {
        let tid = self.protocol.request(node.address(), RequestSpecific::Ping);
        self.probes.push((tid, node.id));
    }

    /// Count probe timeouts and evict nodes that failed too many times.
    fn check_probes(&mut self) {
        let mut timed_out = vec![];
        let protocol = &self.protocol;

        self.probes.retain(|(tid, node_id)| {
            if protocol.inflight(tid) {
                true
            } else {
                timed_out.push(*node_id);
                false
            }
        });

        for node_id in timed_out {
            self.note_failure(node_id);
        }
    }

    fn note_failure(&mut self, node_id: Id) {
        let count = self.failures.entry(node_id).or_insert(0);
        *count += 1;

        if *count >= self.config.max_node_failures {
            debug!(?node_id, failures = *count, "Evicting unresponsive node");

            self.failures.remove(&node_id);
            self.routing_table.evict_and_replace(&node_id);
        }
    }

    fn maintenance(&mut self) {
        if self.routing_table.is_empty()
            && self.last_table_refresh.elapsed() > REFRESH_TABLE_INTERVAL
        {
            self.last_table_refresh = Instant::now();
            self.populate();
        }

        if self.last_table_ping.elapsed() > PING_TABLE_INTERVAL {
            self.last_table_ping = Instant::now();

            for node in self.routing_table.to_owned_nodes() {
                if node.is_stale() {
                    self.routing_table.evict_and_replace(&node.id);
                } else if node.should_ping() && !self.probes.iter().any(|(_, id)| *id == node.id) {
                    self.probe(&node);
                }
            }
        }

        if self.last_sweep.elapsed() > SWEEP_INTERVAL {
            self.last_sweep = Instant::now();
            self.storage.sweep(SystemTime::now());
        }

        if self.last_republish_check.elapsed() > REPUBLISH_CHECK_INTERVAL {
            self.last_republish_check = Instant::now();
            self.republish();
        }

        if self.config.snapshot_path.is_some()
            && self.last_snapshot.elapsed() > self.config.snapshot_interval
        {
            self.last_snapshot = Instant::now();
            self.save_snapshot();
        }
    }

    /// Re-store locally published values that are close to expiry.
    fn republish(&mut self) {
        let due = self
            .storage
            .due_for_republish(SystemTime::now(), self.config.republish_interval);

        for (key, value, _remaining) in due {
            debug!(?key, "Republishing value");
            self.put(key, value, None);
        }
    }

    /// Query our own id to populate the routing table from the
    /// bootstrapping nodes.
    fn populate(&mut self) {
        let id = *self.id();
        self.query(id, RequestSpecific::FindNode { target: id }, None);
    }

    fn restore_snapshot(&mut self) {
        let Some(path) = self.config.snapshot_path.clone() else {
            return;
        };

        if !path.exists() {
            return;
        }

        match snapshot::load(&path) {
            Ok(state) => {
                let nodes = state.nodes.len();
                let records = state.records.len();

                for node in state.nodes {
                    self.routing_table.add(node);
                }
                self.storage.restore(state.records, SystemTime::now());

                info!(nodes, records, ?path, "Restored snapshot");
            }
            Err(error) => {
                warn!(?error, ?path, "Failed to restore snapshot, starting fresh");
            }
        }
    }

    fn save_snapshot(&mut self) {
        let Some(path) = self.config.snapshot_path.clone() else {
            return;
        };

        let state = snapshot::Snapshot {
            nodes: self.routing_table.to_owned_nodes(),
            records: self.storage.export(SystemTime::now()),
        };

        match snapshot::save(&path, &state) {
            Ok(()) => debug!(?path, "Saved snapshot"),
            Err(error) => warn!(?error, ?path, "Failed to save snapshot"),
        }
    }
}
