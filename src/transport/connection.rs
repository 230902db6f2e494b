//! Per-peer encrypted connection state machine.
//!
//! Each connection negotiates an ephemeral x25519 key with its peer,
//! then carries messages as AES-256-GCM encrypted segments with
//! cumulative acks and bounded retransmission.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use super::Packet;
use crate::error::TransportError;

/// Plaintext bytes carried per data segment.
pub const MAX_SEGMENT_PAYLOAD: usize = 1200;

/// How long to wait before retransmitting an unacked segment or hello.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Retransmissions per segment before the connection is dropped.
pub const MAX_SEGMENT_RETRIES: u8 = 5;

/// Hello retransmissions before the handshake is abandoned.
pub const MAX_HELLO_RETRIES: u8 = 4;

/// Connections with no traffic for this long are reaped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const KEY_DOMAIN_TAG: &[u8] = b"souk-session-v1";

const INITIATOR_NONCE_BYTE: u8 = 0x49;
const RESPONDER_NONCE_BYTE: u8 = 0x52;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionState {
    Handshaking,
    Established,
    ShuttingDown,
    Closed,
}

#[derive(Debug)]
struct OutSegment {
    seq: u64,
    last: bool,
    ciphertext: Vec<u8>,
    sent_at: Instant,
    retries: u8,
}

pub struct Connection {
    address: SocketAddrV4,
    state: ConnectionState,
    initiator: bool,

    secret: StaticSecret,
    ephemeral: [u8; 32],
    cipher: Option<Aes256Gcm>,

    /// Next sequence number to assign to an outgoing segment.
    next_seq: u64,
    window: VecDeque<OutSegment>,
    /// Messages queued while the handshake is still in flight.
    queued: VecDeque<Vec<u8>>,

    /// Next sequence number expected from the peer; doubles as the
    /// cumulative ack value.
    recv_next: u64,
    reassembly: Vec<u8>,
    inbound: VecDeque<Vec<u8>>,

    outgoing: Vec<Packet>,
    hello_sent_at: Instant,
    hello_retries: u8,
    last_activity: Instant,
    /// Why the connection closed, when it closed abnormally.
    error: Option<TransportError>,
}

impl Connection {
    /// Start a connection as the initiating side; queues a hello packet.
    pub fn connect(address: SocketAddrV4) -> Connection {
        let mut connection = Connection::new(address, true);

        connection.outgoing.push(Packet::Hello {
            ephemeral: connection.ephemeral,
        });

        connection
    }

    /// Accept a connection from a peer's hello; derives the session key
    /// and queues the hello ack.
    pub fn accept(address: SocketAddrV4, remote_ephemeral: [u8; 32]) -> Connection {
        let mut connection = Connection::new(address, false);

        connection.derive_cipher(&remote_ephemeral);
        connection.state = ConnectionState::Established;
        connection.outgoing.push(Packet::HelloAck {
            ephemeral: connection.ephemeral,
        });

        connection
    }

    fn new(address: SocketAddrV4, initiator: bool) -> Connection {
        let now = Instant::now();

        Connection {
            address,
            state: if initiator {
                ConnectionState::Handshaking
            } else {
                ConnectionState::Established
            },
            initiator,
            secret: StaticSecret::from(rand::random::<[u8; 32]>()),
            ephemeral: [0; 32],
            cipher: None,
            next_seq: 0,
            window: VecDeque::new(),
            queued: VecDeque::new(),
            recv_next: 0,
            reassembly: Vec::new(),
            inbound: VecDeque::new(),
            outgoing: Vec::new(),
            hello_sent_at: now,
            hello_retries: 0,
            last_activity: now,
            error: None,
        }
        .with_ephemeral()
    }

    fn with_ephemeral(mut self) -> Connection {
        self.ephemeral = PublicKey::from(&self.secret).to_bytes();
        self
    }

    // === Getters ===

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > IDLE_TIMEOUT
    }

    /// The error that closed this connection, if it closed abnormally.
    pub fn close_error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    /// True once all outgoing segments are acked and nothing is queued.
    pub fn is_drained(&self) -> bool {
        self.window.is_empty() && self.queued.is_empty()
    }

    // === Public Methods ===

    /// Queue a message for delivery; segments and encrypts immediately
    /// when the session is established.
    pub fn send_message(&mut self, message: &[u8]) {
        match self.state {
            ConnectionState::Established => self.segment_and_queue(message),
            ConnectionState::Handshaking => self.queued.push_back(message.to_vec()),
            _ => {
                trace!(address = ?self.address, "Dropping message for closing connection");
            }
        }
    }

    /// Feed an inbound packet through the state machine. Completed
    /// messages become available through [Connection::pop_message] and
    /// reply packets through [Connection::take_outgoing].
    pub fn handle_packet(&mut self, packet: Packet) {
        self.last_activity = Instant::now();

        match packet {
            Packet::Hello { ephemeral } => self.on_hello(ephemeral),
            Packet::HelloAck { ephemeral } => self.on_hello_ack(ephemeral),
            Packet::Data {
                seq,
                last,
                ciphertext,
            } => self.on_data(seq, last == 1, &ciphertext),
            Packet::Ack { next } => self.on_ack(next),
            Packet::Fin { seq } => self.on_fin(seq),
        }
    }

    /// Drive retransmissions and handshake retries.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Handshaking => self.retry_hello(now),
            ConnectionState::Established | ConnectionState::ShuttingDown => {
                self.retransmit(now);

                if self.state == ConnectionState::ShuttingDown && self.is_drained() {
                    self.outgoing.push(Packet::Fin { seq: self.next_seq });
                    self.state = ConnectionState::Closed;
                }
            }
            ConnectionState::Closed => {}
        }
    }

    /// Begin an orderly shutdown: flush the send window, then fin.
    pub fn shutdown(&mut self) {
        match self.state {
            ConnectionState::Established => {
                self.state = ConnectionState::ShuttingDown;
            }
            ConnectionState::Handshaking => {
                self.state = ConnectionState::Closed;
            }
            _ => {}
        }
    }

    pub fn take_outgoing(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop_front()
    }

    // === Private Methods ===

    fn on_hello(&mut self, remote_ephemeral: [u8; 32]) {
        match self.state {
            ConnectionState::Handshaking => {
                // Simultaneous open. The side with the smaller ephemeral
                // key yields and answers as responder, reusing its
                // ephemeral so both sides derive the same key.
                if self.ephemeral < remote_ephemeral {
                    debug!(address = ?self.address, "Simultaneous open, yielding to peer");

                    self.initiator = false;
                    self.derive_cipher(&remote_ephemeral);
                    self.state = ConnectionState::Established;
                    self.outgoing.push(Packet::HelloAck {
                        ephemeral: self.ephemeral,
                    });
                    self.flush_queued();
                }
                // Otherwise stay initiator and wait for the peer's ack.
            }
            ConnectionState::Established if !self.initiator => {
                // Duplicate hello, our ack was lost.
                self.outgoing.push(Packet::HelloAck {
                    ephemeral: self.ephemeral,
                });
            }
            _ => {}
        }
    }

    fn on_hello_ack(&mut self, remote_ephemeral: [u8; 32]) {
        if self.state != ConnectionState::Handshaking {
            return;
        }

        self.derive_cipher(&remote_ephemeral);
        self.state = ConnectionState::Established;

        trace!(address = ?self.address, "Connection established");

        self.flush_queued();
    }

    fn on_data(&mut self, seq: u64, last: bool, ciphertext: &[u8]) {
        if self.state != ConnectionState::Established
            && self.state != ConnectionState::ShuttingDown
        {
            return;
        }

        if seq == self.recv_next {
            let Some(plaintext) = self.open(seq, ciphertext) else {
                warn!(address = ?self.address, seq, "Dropping undecryptable segment");
                return;
            };

            self.recv_next += 1;
            self.reassembly.extend_from_slice(&plaintext);

            if last {
                self.inbound.push_back(std::mem::take(&mut self.reassembly));
            }
        }
        // seq > recv_next is dropped; the peer retransmits after our ack.

        self.outgoing.push(Packet::Ack {
            next: self.recv_next,
        });
    }

    fn on_ack(&mut self, next: u64) {
        while self
            .window
            .front()
            .map(|segment| segment.seq < next)
            .unwrap_or(false)
        {
            self.window.pop_front();
        }
    }

    fn on_fin(&mut self, seq: u64) {
        if self.recv_next < seq {
            debug!(
                address = ?self.address,
                expected = seq,
                received = self.recv_next,
                "Peer closed with segments still in flight"
            );
        }

        self.outgoing.push(Packet::Ack {
            next: self.recv_next,
        });
        self.state = ConnectionState::Closed;
    }

    fn flush_queued(&mut self) {
        while let Some(message) = self.queued.pop_front() {
            self.segment_and_queue(&message);
        }
    }

    fn segment_and_queue(&mut self, message: &[u8]) {
        let chunks: Vec<&[u8]> = if message.is_empty() {
            vec![&[]]
        } else {
            message.chunks(MAX_SEGMENT_PAYLOAD).collect()
        };
        let count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let seq = self.next_seq;
            let last = index + 1 == count;

            let Some(ciphertext) = self.seal(seq, chunk) else {
                warn!(address = ?self.address, "Dropping message, no session key");
                return;
            };

            self.next_seq += 1;
            self.window.push_back(OutSegment {
                seq,
                last,
                ciphertext: ciphertext.clone(),
                sent_at: Instant::now(),
                retries: 0,
            });
            self.outgoing.push(Packet::Data {
                seq,
                last: last as u8,
                ciphertext,
            });
        }
    }

    fn retry_hello(&mut self, now: Instant) {
        if now.duration_since(self.hello_sent_at) < RESEND_INTERVAL {
            return;
        }

        if self.hello_retries >= MAX_HELLO_RETRIES {
            warn!(address = ?self.address, "Handshake timed out");
            self.error = Some(TransportError::HandshakeFailed(self.address));
            self.state = ConnectionState::Closed;
            return;
        }

        self.hello_retries += 1;
        self.hello_sent_at = now;
        self.outgoing.push(Packet::Hello {
            ephemeral: self.ephemeral,
        });
    }

    fn retransmit(&mut self, now: Instant) {
        let mut expired = false;

        for segment in &mut self.window {
            if now.duration_since(segment.sent_at) < RESEND_INTERVAL {
                continue;
            }

            if segment.retries >= MAX_SEGMENT_RETRIES {
                expired = true;
                break;
            }

            segment.retries += 1;
            segment.sent_at = now;
            self.outgoing.push(Packet::Data {
                seq: segment.seq,
                last: segment.last as u8,
                ciphertext: segment.ciphertext.clone(),
            });
        }

        if expired {
            warn!(address = ?self.address, "Peer unresponsive, dropping connection");
            self.error = Some(TransportError::ConnectionClosed(self.address));
            self.state = ConnectionState::Closed;
        }
    }

    fn derive_cipher(&mut self, remote_ephemeral: &[u8; 32]) {
        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(*remote_ephemeral));

        let (initiator_eph, responder_eph) = if self.initiator {
            (&self.ephemeral, remote_ephemeral)
        } else {
            (remote_ephemeral, &self.ephemeral)
        };

        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN_TAG);
        hasher.update(shared.as_bytes());
        hasher.update(initiator_eph);
        hasher.update(responder_eph);
        let key: [u8; 32] = hasher.finalize().into();

        // A 32 byte key slice is always valid for Aes256Gcm.
        self.cipher = Aes256Gcm::new_from_slice(&key).ok();
    }

    /// Nonces never repeat within a session: each direction has its own
    /// role byte and its own sequence counter.
    fn nonce(&self, role: u8, seq: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = role;
        nonce[4..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    fn send_role_byte(&self) -> u8 {
        if self.initiator {
            INITIATOR_NONCE_BYTE
        } else {
            RESPONDER_NONCE_BYTE
        }
    }

    fn recv_role_byte(&self) -> u8 {
        if self.initiator {
            RESPONDER_NONCE_BYTE
        } else {
            INITIATOR_NONCE_BYTE
        }
    }

    fn seal(&self, seq: u64, plaintext: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.nonce(self.send_role_byte(), seq);

        self.cipher
            .as_ref()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .ok()
    }

    fn open(&self, seq: u64, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.nonce(self.recv_role_byte(), seq);

        self.cipher
            .as_ref()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .ok()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &self.state)
            .field("initiator", &self.initiator)
            .field("next_seq", &self.next_seq)
            .field("recv_next", &self.recv_next)
            .finish_non_exhaustive()
    }
}
