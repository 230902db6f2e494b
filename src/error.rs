//! Error types for parsing, transport, and persistence.

/// Errors parsing or validating a wire envelope.
#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    /// The datagram is shorter than the smallest valid envelope.
    #[error("Message too small: {0} bytes")]
    TooSmall(usize),

    #[error("Failed to parse message bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// A fixed-size field (id, key, signature, transaction id) had the
    /// wrong length.
    #[error("Invalid {field} length: {got}")]
    InvalidFieldLength { field: &'static str, got: usize },

    /// Compact node list length is not a multiple of the entry size.
    #[error("Invalid compact nodes length: {0}")]
    InvalidNodesLength(usize),

    /// The sender id is not the hash of the sender public key.
    #[error("Sender id does not match sender public key")]
    SenderIdMismatch,

    /// Store and delete requests must carry a valid signature.
    #[error("Missing or invalid signature")]
    BadSignature,
}

/// Errors from the datagram transport layer.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    /// The handshake did not complete within the retry budget.
    #[error("Handshake with {0} failed")]
    HandshakeFailed(std::net::SocketAddrV4),

    /// The connection was closed before the message was delivered.
    #[error("Connection to {0} closed")]
    ConnectionClosed(std::net::SocketAddrV4),
}

/// Errors reading or writing a state snapshot.
#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Failed to parse snapshot: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u64),

    /// The checksum in the file does not match its contents.
    #[error("Snapshot checksum mismatch")]
    ChecksumMismatch,
}
