#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod dht;
mod error;
mod identity;
mod messages;
mod routing_table;
mod rpc;
mod snapshot;
mod storage;
mod transport;

// Public structs
pub use crate::common::{Id, Node};
pub use crate::dht::{Dht, DhtWasShutdown, Testnet};
pub use crate::identity::Identity;
pub use crate::rpc::{Config, PutError, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT};

// Public errors
pub use crate::error::{MessageError, SnapshotError, TransportError};

// Re-exports
pub use bytes::Bytes;
pub use ed25519_dalek::SigningKey;
