//! Encrypted datagram transport.
//!
//! A [Multiplexer] owns one [UdpSocket] and one [Connection] per peer
//! address, routing every inbound datagram to its connection's state
//! machine and flushing the packets those machines emit.

mod connection;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::TransportError;

use connection::Connection;

pub const DEFAULT_PORT: u16 = 8889;

/// Datagrams smaller than this can't be a valid packet and are dropped
/// before parsing.
pub const MIN_DATAGRAM_SIZE: usize = 12;

/// The maximum duration to backoff checking the [UdpSocket] buffer after
/// it is empty. Lower values increase CPU usage but drain the buffer
/// faster, reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

const MTU: usize = 2048;

/// A single datagram on the wire, bencode encoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum Packet {
    #[serde(rename = "h")]
    Hello {
        #[serde(rename = "e", with = "serde_bytes")]
        ephemeral: [u8; 32],
    },

    #[serde(rename = "a")]
    HelloAck {
        #[serde(rename = "e", with = "serde_bytes")]
        ephemeral: [u8; 32],
    },

    #[serde(rename = "d")]
    Data {
        #[serde(rename = "s")]
        seq: u64,

        /// 1 when this segment completes a message.
        #[serde(rename = "l")]
        last: u8,

        #[serde(rename = "c", with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },

    /// Cumulative ack: every segment below `next` has been received.
    #[serde(rename = "k")]
    Ack {
        #[serde(rename = "n")]
        next: u64,
    },

    #[serde(rename = "f")]
    Fin {
        #[serde(rename = "s")]
        seq: u64,
    },
}

/// One encrypted connection per peer over a shared [UdpSocket].
#[derive(Debug)]
pub struct Multiplexer {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    connections: HashMap<SocketAddrV4, Connection>,
    ready: VecDeque<(Vec<u8>, SocketAddrV4)>,
}

impl Multiplexer {
    pub fn new(port: Option<u16>) -> Result<Self, TransportError> {
        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(TransportError::IO(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "IPv6 is not supported",
                )))
            }
        };

        socket.set_nonblocking(true)?;

        Ok(Multiplexer {
            socket,
            local_addr,
            connections: HashMap::new(),
            ready: VecDeque::new(),
        })
    }

    // === Getters ===

    /// Returns the address this node is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // === Public Methods ===

    /// Queue a message to a peer, opening a connection if none exists,
    /// and flush whatever packets are ready to go.
    pub fn send_message(&mut self, address: SocketAddrV4, message: &[u8]) {
        let connection = self
            .connections
            .entry(address)
            .or_insert_with(|| Connection::connect(address));

        connection.send_message(message);

        self.flush(address);
    }

    /// Receive at most one datagram from the socket and run it through
    /// its connection. Returns the next fully reassembled message, if
    /// any.
    pub fn recv_from(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        if let Some(ready) = self.ready.pop_front() {
            return Some(ready);
        }

        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                if from.port() == 0 {
                    trace!("Dropping datagram from port 0");
                    return None;
                }

                self.handle_datagram(&buf[..amt], from);
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!("Dropping IPv6 datagram");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(?e, "recv_from failed unexpectedly");
            }
        }

        self.ready.pop_front()
    }

    /// Drive retransmissions and reap finished or idle connections.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let addresses: Vec<_> = self.connections.keys().copied().collect();

        for address in addresses {
            if let Some(connection) = self.connections.get_mut(&address) {
                connection.tick(now);
            }
            self.flush(address);
        }

        self.connections
            .retain(|address, connection| {
                let keep = !connection.is_closed() && !connection.is_idle(now);

                if !keep {
                    match connection.close_error() {
                        Some(error) => debug!(?address, %error, "Reaping failed connection"),
                        None => trace!(?address, "Reaping connection"),
                    }
                }

                keep
            });
    }

    /// Orderly shutdown: fin every established connection and flush.
    pub fn shutdown(&mut self) {
        let addresses: Vec<_> = self.connections.keys().copied().collect();

        for address in addresses {
            if let Some(connection) = self.connections.get_mut(&address) {
                connection.shutdown();
                connection.tick(Instant::now());
            }
            self.flush(address);
        }

        self.connections.clear();
    }

    // === Private Methods ===

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddrV4) {
        if bytes.len() < MIN_DATAGRAM_SIZE {
            trace!(?from, len = bytes.len(), "Dropping undersized datagram");
            return;
        }

        let packet: Packet = match serde_bencode::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(?error, ?from, "Dropping unparsable datagram");
                return;
            }
        };

        let connection = match self.connections.get_mut(&from) {
            Some(connection) => connection,
            None => match packet {
                Packet::Hello { ephemeral } => {
                    debug!(?from, "Accepting connection");

                    self.connections
                        .entry(from)
                        .or_insert_with(|| Connection::accept(from, ephemeral))
                }
                _ => {
                    trace!(?from, "Dropping packet for unknown connection");
                    return;
                }
            },
        };

        connection.handle_packet(packet);

        while let Some(message) = self.connections.get_mut(&from).and_then(|c| c.pop_message())
        {
            self.ready.push_back((message, from));
        }

        self.flush(from);
    }

    fn flush(&mut self, address: SocketAddrV4) {
        let Some(connection) = self.connections.get_mut(&address) else {
            return;
        };

        for packet in connection.take_outgoing() {
            match serde_bencode::to_bytes(&packet) {
                Ok(bytes) => {
                    if let Err(error) = self.socket.send_to(&bytes, address) {
                        debug!(?error, ?address, "Error sending packet");
                    }
                }
                Err(error) => {
                    debug!(?error, "Error encoding packet");
                }
            }
        }
    }
}
