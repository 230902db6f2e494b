//! Signed request/response envelopes, bencode encoded.

use std::convert::TryInto;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;

use crate::common::{Id, Node, ID_SIZE};
use crate::error::MessageError;

/// Per-node compact encoding: id (20) + ipv4 (4) + port (2) + public key (32).
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + 6 + 32;

/// Smallest possible valid envelope: transaction id, sender id and key,
/// and a ping with its tags and bencode overhead.
pub const MIN_MESSAGE_SIZE: usize = 66;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Two big-endian bytes on the wire.
    pub transaction_id: u16,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub sender_id: Id,

    /// The sender's ed25519 public key. [Message::from_bytes] rejects
    /// envelopes where `sender_id` is not the hash of this key.
    pub sender_public_key: [u8; 32],

    /// Required on store and delete requests, absent elsewhere.
    pub signature: Option<[u8; 64]>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),
    Response(ResponseSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    FindNode {
        target: Id,
    },
    FindValue {
        key: Id,
    },
    Store {
        key: Id,
        value: Bytes,
        ttl: Duration,
    },
    Delete {
        key: Id,
        value_ref: Id,
    },
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping,
    /// The k closest known nodes to the requested target.
    Nodes {
        nodes: Vec<Node>,
    },
    /// Values held under the requested key, plus closest nodes for
    /// lookup convergence.
    Values {
        values: Vec<Bytes>,
        nodes: Vec<Node>,
    },
    Stored,
    Deleted,
}

/// Request kind, used for the dispatch registry and logging.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Command {
    Ping,
    FindNode,
    FindValue,
    Store,
    Delete,
}

impl RequestSpecific {
    pub fn command(&self) -> Command {
        match self {
            RequestSpecific::Ping => Command::Ping,
            RequestSpecific::FindNode { .. } => Command::FindNode,
            RequestSpecific::FindValue { .. } => Command::FindValue,
            RequestSpecific::Store { .. } => Command::Store,
            RequestSpecific::Delete { .. } => Command::Delete,
        }
    }

    /// Store and delete mutate the responder's state and must be signed.
    pub fn requires_signature(&self) -> bool {
        matches!(
            self,
            RequestSpecific::Store { .. } | RequestSpecific::Delete { .. }
        )
    }

    /// The canonical bytes the sender signs, if this request is signed.
    pub fn signable(&self) -> Option<Vec<u8>> {
        match self {
            RequestSpecific::Store { key, value, ttl } => {
                Some(store_signable(key, value, *ttl))
            }
            RequestSpecific::Delete { key, value_ref } => {
                Some(delete_signable(key, value_ref))
            }
            _ => None,
        }
    }
}

/// Canonical signed payload of a store request.
pub fn store_signable(key: &Id, value: &[u8], ttl: Duration) -> Vec<u8> {
    let mut signable = format!("1:k{}:", ID_SIZE).into_bytes();
    signable.extend_from_slice(key.as_bytes());
    signable.extend_from_slice(format!("3:ttli{}e1:v{}:", ttl.as_secs(), value.len()).as_bytes());
    signable.extend_from_slice(value);
    signable
}

/// Canonical signed payload of a delete request.
pub fn delete_signable(key: &Id, value_ref: &Id) -> Vec<u8> {
    let mut signable = format!("1:k{}:", ID_SIZE).into_bytes();
    signable.extend_from_slice(key.as_bytes());
    signable.extend_from_slice(format!("3:ref{}:", ID_SIZE).as_bytes());
    signable.extend_from_slice(value_ref.as_bytes());
    signable
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, MessageError> {
        if bytes.len() < MIN_MESSAGE_SIZE {
            return Err(MessageError::TooSmall(bytes.len()));
        }

        let message = Message::from_serde_message(internal::Envelope::from_bytes(bytes)?)?;

        if Id::hash_of(&message.sender_public_key) != message.sender_id {
            return Err(MessageError::SenderIdMismatch);
        }

        Ok(message)
    }

    fn into_serde_message(self) -> internal::Envelope {
        internal::Envelope {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            sender_id: self.sender_id.to_vec(),
            sender_key: self.sender_public_key.to_vec(),
            signature: self.signature.map(|signature| signature.to_vec()),
            variant: match self.message_type {
                MessageType::Request(request) => {
                    internal::EnvelopeVariant::Request(match request {
                        RequestSpecific::Ping => internal::RequestVariant::Ping {},
                        RequestSpecific::FindNode { target } => {
                            internal::RequestVariant::FindNode {
                                target: target.to_vec(),
                            }
                        }
                        RequestSpecific::FindValue { key } => {
                            internal::RequestVariant::FindValue { key: key.to_vec() }
                        }
                        RequestSpecific::Store { key, value, ttl } => {
                            internal::RequestVariant::Store {
                                key: key.to_vec(),
                                value: value.to_vec(),
                                ttl: ttl.as_secs() as i64,
                            }
                        }
                        RequestSpecific::Delete { key, value_ref } => {
                            internal::RequestVariant::Delete {
                                key: key.to_vec(),
                                value_ref: value_ref.to_vec(),
                            }
                        }
                    })
                }
                MessageType::Response(response) => {
                    internal::EnvelopeVariant::Response(match response {
                        ResponseSpecific::Ping => internal::ResponseVariant::Ping {},
                        ResponseSpecific::Nodes { nodes } => internal::ResponseVariant::Nodes {
                            nodes: nodes_to_bytes(&nodes),
                        },
                        ResponseSpecific::Values { values, nodes } => {
                            internal::ResponseVariant::Values {
                                values: values
                                    .into_iter()
                                    .map(|value| serde_bytes::ByteBuf::from(value.to_vec()))
                                    .collect(),
                                nodes: nodes_to_bytes(&nodes),
                            }
                        }
                        ResponseSpecific::Stored => internal::ResponseVariant::Stored {},
                        ResponseSpecific::Deleted => internal::ResponseVariant::Deleted {},
                    })
                }
            },
        }
    }

    fn from_serde_message(envelope: internal::Envelope) -> Result<Message, MessageError> {
        Ok(Message {
            transaction_id: u16::from_be_bytes(fixed(&envelope.transaction_id, "transaction_id")?),
            version: envelope.version,
            sender_id: id_field(&envelope.sender_id, "sender_id")?,
            sender_public_key: fixed(&envelope.sender_key, "sender_public_key")?,
            signature: match envelope.signature {
                Some(signature) => Some(fixed(&signature, "signature")?),
                None => None,
            },
            message_type: match envelope.variant {
                internal::EnvelopeVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::RequestVariant::Ping {} => RequestSpecific::Ping,
                        internal::RequestVariant::FindNode { target } => {
                            RequestSpecific::FindNode {
                                target: id_field(&target, "target")?,
                            }
                        }
                        internal::RequestVariant::FindValue { key } => {
                            RequestSpecific::FindValue {
                                key: id_field(&key, "key")?,
                            }
                        }
                        internal::RequestVariant::Store { key, value, ttl } => {
                            RequestSpecific::Store {
                                key: id_field(&key, "key")?,
                                value: Bytes::from(value),
                                ttl: Duration::from_secs(ttl.max(0) as u64),
                            }
                        }
                        internal::RequestVariant::Delete { key, value_ref } => {
                            RequestSpecific::Delete {
                                key: id_field(&key, "key")?,
                                value_ref: id_field(&value_ref, "value_ref")?,
                            }
                        }
                    })
                }
                internal::EnvelopeVariant::Response(response) => {
                    MessageType::Response(match response {
                        internal::ResponseVariant::Ping {} => ResponseSpecific::Ping,
                        internal::ResponseVariant::Nodes { nodes } => ResponseSpecific::Nodes {
                            nodes: bytes_to_nodes(&nodes)?,
                        },
                        internal::ResponseVariant::Values { values, nodes } => {
                            ResponseSpecific::Values {
                                values: values
                                    .into_iter()
                                    .map(|value| Bytes::from(value.into_vec()))
                                    .collect(),
                                nodes: bytes_to_nodes(&nodes)?,
                            }
                        }
                        internal::ResponseVariant::Stored {} => ResponseSpecific::Stored,
                        internal::ResponseVariant::Deleted {} => ResponseSpecific::Deleted,
                    })
                }
            },
        })
    }
}

fn fixed<const N: usize>(bytes: &[u8], field: &'static str) -> Result<[u8; N], MessageError> {
    bytes
        .try_into()
        .map_err(|_| MessageError::InvalidFieldLength {
            field,
            got: bytes.len(),
        })
}

fn id_field(bytes: &[u8], field: &'static str) -> Result<Id, MessageError> {
    Id::from_bytes(bytes).ok_or(MessageError::InvalidFieldLength {
        field,
        got: bytes.len(),
    })
}

/// Concatenated compact encoding of a node list. IPv4 only.
pub fn nodes_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * COMPACT_NODE_SIZE);

    for node in nodes {
        bytes.extend_from_slice(node.id.as_bytes());
        bytes.extend_from_slice(&node.address.ip().octets());
        bytes.extend_from_slice(&node.address.port().to_be_bytes());
        bytes.extend_from_slice(&node.public_key);
    }

    bytes
}

pub fn bytes_to_nodes(bytes: &[u8]) -> Result<Vec<Node>, MessageError> {
    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return Err(MessageError::InvalidNodesLength(bytes.len()));
    }

    let mut nodes = Vec::with_capacity(bytes.len() / COMPACT_NODE_SIZE);

    for chunk in bytes.chunks_exact(COMPACT_NODE_SIZE) {
        let id = id_field(&chunk[0..ID_SIZE], "node id")?;
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        let public_key = fixed(&chunk[26..58], "node public key")?;

        nodes.push(Node::new(id, SocketAddrV4::new(ip, port), public_key));
    }

    Ok(nodes)
}

mod internal {
    use serde::{Deserialize, Serialize};

    use crate::error::MessageError;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Envelope {
        #[serde(rename = "t", with = "serde_bytes")]
        pub transaction_id: Vec<u8>,

        #[serde(default)]
        #[serde(rename = "v", with = "serde_bytes")]
        pub version: Option<Vec<u8>>,

        #[serde(rename = "id", with = "serde_bytes")]
        pub sender_id: Vec<u8>,

        #[serde(rename = "k", with = "serde_bytes")]
        pub sender_key: Vec<u8>,

        #[serde(default)]
        #[serde(rename = "sig", with = "serde_bytes")]
        pub signature: Option<Vec<u8>>,

        #[serde(flatten)]
        pub variant: EnvelopeVariant,
    }

    impl Envelope {
        pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, MessageError> {
            Ok(serde_bencode::from_bytes(bytes)?)
        }

        pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
            Ok(serde_bencode::to_bytes(self)?)
        }
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    #[serde(tag = "y")]
    pub enum EnvelopeVariant {
        #[serde(rename = "q")]
        Request(RequestVariant),

        #[serde(rename = "r")]
        Response(ResponseVariant),
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    #[serde(tag = "q")]
    pub enum RequestVariant {
        #[serde(rename = "ping")]
        Ping {},

        #[serde(rename = "find_node")]
        FindNode {
            #[serde(rename = "target", with = "serde_bytes")]
            target: Vec<u8>,
        },

        #[serde(rename = "find_value")]
        FindValue {
            #[serde(rename = "key", with = "serde_bytes")]
            key: Vec<u8>,
        },

        #[serde(rename = "store")]
        Store {
            #[serde(rename = "key", with = "serde_bytes")]
            key: Vec<u8>,

            #[serde(rename = "value", with = "serde_bytes")]
            value: Vec<u8>,

            #[serde(rename = "ttl")]
            ttl: i64,
        },

        #[serde(rename = "delete")]
        Delete {
            #[serde(rename = "key", with = "serde_bytes")]
            key: Vec<u8>,

            #[serde(rename = "ref", with = "serde_bytes")]
            value_ref: Vec<u8>,
        },
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    #[serde(tag = "r")]
    pub enum ResponseVariant {
        #[serde(rename = "ping")]
        Ping {},

        #[serde(rename = "nodes")]
        Nodes {
            #[serde(rename = "n", with = "serde_bytes")]
            nodes: Vec<u8>,
        },

        #[serde(rename = "values")]
        Values {
            #[serde(rename = "vals")]
            values: Vec<serde_bytes::ByteBuf>,

            #[serde(rename = "n", with = "serde_bytes")]
            nodes: Vec<u8>,
        },

        #[serde(rename = "stored")]
        Stored {},

        #[serde(rename = "deleted")]
        Deleted {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn envelope(identity: &Identity, message_type: MessageType) -> Message {
        Message {
            transaction_id: 258,
            version: None,
            sender_id: *identity.id(),
            sender_public_key: identity.public_key(),
            signature: None,
            message_type,
        }
    }

    fn roundtrip(message: Message) {
        let bytes = message.to_bytes().unwrap();
        assert!(bytes.len() >= MIN_MESSAGE_SIZE);

        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn ping_request() {
        let identity = Identity::random();
        roundtrip(envelope(
            &identity,
            MessageType::Request(RequestSpecific::Ping),
        ));
    }

    #[test]
    fn find_node_request() {
        let identity = Identity::random();
        roundtrip(envelope(
            &identity,
            MessageType::Request(RequestSpecific::FindNode {
                target: Id::random(),
            }),
        ));
    }

    #[test]
    fn store_request_with_signature() {
        let identity = Identity::random();
        let key = Id::random();
        let value = Bytes::from_static(b"listing contract");
        let ttl = Duration::from_secs(3600);

        let mut message = envelope(
            &identity,
            MessageType::Request(RequestSpecific::Store {
                key,
                value: value.clone(),
                ttl,
            }),
        );
        message.signature = Some(identity.sign(&store_signable(&key, &value, ttl)));

        roundtrip(message);
    }

    #[test]
    fn values_response() {
        let identity = Identity::random();
        roundtrip(envelope(
            &identity,
            MessageType::Response(ResponseSpecific::Values {
                values: vec![Bytes::from_static(b"a"), Bytes::from_static(b"bb")],
                nodes: vec![Node::random(), Node::random()],
            }),
        ));
    }

    #[test]
    fn nodes_response() {
        let identity = Identity::random();
        roundtrip(envelope(
            &identity,
            MessageType::Response(ResponseSpecific::Nodes {
                nodes: vec![Node::random()],
            }),
        ));
    }

    #[test]
    fn deleted_response() {
        let identity = Identity::random();
        roundtrip(envelope(
            &identity,
            MessageType::Response(ResponseSpecific::Deleted),
        ));
    }

    #[test]
    fn rejects_wrong_sender_id() {
        let identity = Identity::random();
        let mut message = envelope(&identity, MessageType::Request(RequestSpecific::Ping));
        message.sender_id = Id::random();

        let bytes = message.to_bytes().unwrap();

        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(MessageError::SenderIdMismatch)
        ));
    }

    #[test]
    fn rejects_undersized_datagram() {
        assert!(matches!(
            Message::from_bytes(b"d1:t2:xxe"),
            Err(MessageError::TooSmall(_))
        ));
    }

    #[test]
    fn compact_nodes_roundtrip() {
        let nodes = vec![Node::random(), Node::unique(7)];

        let bytes = nodes_to_bytes(&nodes);
        assert_eq!(bytes.len(), nodes.len() * COMPACT_NODE_SIZE);

        let parsed = bytes_to_nodes(&bytes).unwrap();
        assert_eq!(parsed, nodes);

        assert!(bytes_to_nodes(&bytes[1..]).is_err());
    }

    #[test]
    fn signables_are_distinct() {
        let key = Id::random();
        let value = b"v";

        let store = store_signable(&key, value, Duration::from_secs(60));
        let delete = delete_signable(&key, &Id::hash_of(value));

        assert_ne!(store, delete);
    }
}
