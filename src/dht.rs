//! The node handle: a cheap-to-clone client for the actor thread that
//! runs the engine.

use std::net::SocketAddrV4;
use std::thread;

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::info;

use crate::common::{Id, Node};
use crate::error::TransportError;
use crate::rpc::{Config, PutError, Rpc};

#[derive(Debug, Clone)]
/// A handle to a running node.
///
/// All clones talk to the same actor thread; the thread shuts down when
/// the last clone is dropped or [Dht::shutdown] is called.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, thiserror::Error)]
#[error("The node's actor thread was shutdown")]
pub struct DhtWasShutdown;

impl Dht {
    /// Create a new node and spawn its actor thread.
    pub fn new(config: Config) -> Result<Dht, TransportError> {
        let rpc = Rpc::new(config)?;

        let address = rpc.local_addr();
        info!(?address, "DHT node listening");

        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("souk-actor".into())
            .spawn(move || run(rpc, receiver))?;

        Ok(Dht(sender))
    }

    /// A node with all defaults: random identity, default port or an
    /// ephemeral fallback, no bootstrap nodes, no persistence.
    pub fn client() -> Result<Dht, TransportError> {
        Dht::new(Config::default())
    }

    // === Getters ===

    /// Returns the address this node is listening on.
    pub fn local_addr(&self) -> Result<SocketAddrV4, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::LocalAddr(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Returns this node's id.
    pub fn id(&self) -> Result<Id, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::NodeId(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Non-stale routing table entries as `ip:port` strings, usable as
    /// the bootstrap list of another node.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Block until the initial self-lookup is done and the routing table
    /// is populated.
    ///
    /// On a node with no bootstrap addresses and an empty routing table
    /// there is nothing to look up, so this returns right away; such a
    /// node learns about peers from their inbound requests instead.
    pub fn bootstrapped(&self) -> Result<(), DhtWasShutdown> {
        let id = self.id()?;
        self.resolve(id)?;

        Ok(())
    }

    /// Look up every value stored under a key, including this node's own
    /// replica.
    pub fn get(&self, key: Id) -> Result<Vec<Bytes>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Get(key, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Store a value under a key on the nodes closest to it.
    ///
    /// Blocks until enough nodes acknowledged the store, and returns the
    /// key.
    pub fn put(&self, key: Id, value: Bytes) -> Result<Result<Id, PutError>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Put(key, value, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Remove a previously published value. `value_ref` is the hash of
    /// the value bytes; see [crate::Id::hash_of]. Remote nodes only honor
    /// deletes signed by the value's publisher.
    pub fn delete(
        &self,
        key: Id,
        value_ref: Id,
    ) -> Result<Result<Id, PutError>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Delete(key, value_ref, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Look up a node by its exact id.
    ///
    /// Runs an iterative lookup for `target` and returns the responding
    /// node whose id matches it, or None if no such node answered.
    pub fn resolve(&self, target: Id) -> Result<Option<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Resolve(target, sender))
            .map_err(|_| DhtWasShutdown)?;

        let closest = receiver.recv().map_err(|_| DhtWasShutdown)?;

        Ok(closest.iter().find(|node| node.id == target).cloned())
    }

    /// Snapshot state (if configured), close connections, and stop the
    /// actor thread.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded(1);

        if self.0.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Shutdown(Sender<()>),
    LocalAddr(Sender<SocketAddrV4>),
    NodeId(Sender<Id>),
    ToBootstrap(Sender<Vec<String>>),
    Get(Id, Sender<Vec<Bytes>>),
    Put(Id, Bytes, Sender<Result<Id, PutError>>),
    Delete(Id, Id, Sender<Result<Id, PutError>>),
    Resolve(Id, Sender<Box<[Node]>>),
}

fn run(mut rpc: Rpc, receiver: Receiver<ActorMessage>) {
    loop {
        match receiver.try_recv() {
            Ok(message) => match message {
                ActorMessage::Shutdown(sender) => {
                    rpc.shutdown();
                    let _ = sender.send(());
                    break;
                }
                ActorMessage::LocalAddr(sender) => {
                    let _ = sender.send(rpc.local_addr());
                }
                ActorMessage::NodeId(sender) => {
                    let _ = sender.send(*rpc.id());
                }
                ActorMessage::ToBootstrap(sender) => {
                    let _ = sender.send(rpc.to_bootstrap());
                }
                ActorMessage::Get(key, sender) => {
                    rpc.get(key, sender);
                }
                ActorMessage::Put(key, value, sender) => {
                    rpc.put(key, value, Some(sender));
                }
                ActorMessage::Delete(key, value_ref, sender) => {
                    rpc.delete(key, value_ref, Some(sender));
                }
                ActorMessage::Resolve(target, sender) => {
                    rpc.resolve(target, sender);
                }
            },
            Err(TryRecvError::Disconnected) => {
                // Every handle was dropped; close connections and stop.
                rpc.shutdown();
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        rpc.tick();
    }
}

/// A local network of nodes over loopback, for tests and demos.
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet, TransportError> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let node = Dht::new(Config {
                bootstrap: bootstrap.clone(),
                port: Some(0),
                ..Default::default()
            })?;

            if i == 0 {
                let address = node.local_addr().map_err(|_| {
                    TransportError::IO(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "first testnet node shut down before it was asked",
                    ))
                })?;

                bootstrap.push(format!("127.0.0.1:{}", address.port()));
            }

            nodes.push(node);
        }

        Ok(Testnet { bootstrap, nodes })
    }
}
