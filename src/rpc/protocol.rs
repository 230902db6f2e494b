//! Request/response layer over the encrypted transport.
//!
//! Formats and signs envelopes, correlates responses to inflight
//! requests by transaction id and source address, and filters inbound
//! requests through the registered command set.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::Id;
use crate::error::{MessageError, TransportError};
use crate::identity::{verify, Identity};
use crate::messages::{Command, Message, MessageType, RequestSpecific, ResponseSpecific};
use crate::transport::Multiplexer;

use super::config::Config;

pub const VERSION: [u8; 4] = [83, 75, 0, 1]; // "SK" version 01

/// Default request timeout before abandoning an inflight request to a
/// non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug)]
pub struct Protocol {
    multiplexer: Multiplexer,
    identity: Identity,
    next_tid: u16,
    request_timeout: Duration,
    inflight_requests: InflightRequestsMap,
    registered: HashSet<Command>,
}

#[derive(Debug, Clone)]
pub struct InflightRequest {
    to: SocketAddrV4,
    sent_at: Instant,
}

impl Protocol {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let multiplexer = Multiplexer::new(config.port)?;

        Ok(Self {
            multiplexer,
            identity: config.identity.clone(),
            next_tid: 0,
            request_timeout: config.request_timeout,
            inflight_requests: InflightRequestsMap::new(config.request_timeout),
            registered: [
                Command::Ping,
                Command::FindNode,
                Command::FindValue,
                Command::Store,
                Command::Delete,
            ]
            .iter()
            .copied()
            .collect(),
        })
    }

    // === Getters ===

    /// Returns the address this node is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.multiplexer.local_addr()
    }

    pub fn id(&self) -> &Id {
        self.identity.id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // === Public Methods ===

    /// Returns true if this transaction_id is still inflight.
    pub fn inflight(&self, transaction_id: &u16) -> bool {
        self.inflight_requests.contains_key(transaction_id)
    }

    /// Remove a request kind from the set this node will answer.
    pub fn unregister(&mut self, command: Command) {
        self.registered.remove(&command);
    }

    /// Send a request to the given address and return the transaction_id.
    pub fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u16 {
        let message = self.request_message(request);
        trace!(?message, ?address, "Sending request message");

        let tid = message.transaction_id;
        self.inflight_requests.insert(
            tid,
            InflightRequest {
                to: address,
                sent_at: Instant::now(),
            },
        );

        self.send(address, &message);
        tid
    }

    /// Send a response to the given address.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        let message = self.response_message(transaction_id, response);
        trace!(?message, ?address, "Sending response message");

        self.send(address, &message);
    }

    /// Receives a single message from the transport.
    /// On success, returns the validated message and its origin.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        self.inflight_requests.cleanup();

        let (bytes, from) = self.multiplexer.recv_from()?;

        let message = match Message::from_bytes(&bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(?error, ?from, "Received invalid message");
                return None;
            }
        };

        match &message.message_type {
            MessageType::Request(request) => {
                if !self.registered.contains(&request.command()) {
                    trace!(command = ?request.command(), ?from, "Dropping unregistered request");
                    return None;
                }

                if let Err(error) = self.verify_request_signature(&message, request) {
                    debug!(%error, ?from, "Dropping unauthenticated request");
                    return None;
                }

                Some((message, from))
            }
            MessageType::Response(_) => {
                if self.is_expected_response(&message, &from) {
                    Some((message, from))
                } else {
                    None
                }
            }
        }
    }

    /// Drive transport retransmissions and reap expired inflight entries.
    pub fn tick(&mut self) {
        self.inflight_requests.cleanup();
        self.multiplexer.tick();
    }

    pub fn shutdown(&mut self) {
        self.multiplexer.shutdown();
    }

    // === Private Methods ===

    fn verify_request_signature(
        &self,
        message: &Message,
        request: &RequestSpecific,
    ) -> Result<(), MessageError> {
        if !request.requires_signature() {
            return Ok(());
        }

        let signable = request.signable().ok_or(MessageError::BadSignature)?;

        match &message.signature {
            Some(signature) if verify(&message.sender_public_key, &signable, signature) => Ok(()),
            _ => Err(MessageError::BadSignature),
        }
    }

    fn is_expected_response(&mut self, message: &Message, from: &SocketAddrV4) -> bool {
        if let Some(request) = self.inflight_requests.remove(&message.transaction_id) {
            if request.to == *from {
                return true;
            }

            trace!(?from, expected = ?request.to, "Response from wrong address");
        } else {
            trace!(tid = message.transaction_id, ?from, "Unexpected response id");
        }

        false
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn request_message(&mut self, request: RequestSpecific) -> Message {
        let transaction_id = self.tid();

        let signature = request
            .signable()
            .map(|signable| self.identity.sign(&signable));

        Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            sender_id: *self.identity.id(),
            sender_public_key: self.identity.public_key(),
            signature,
            message_type: MessageType::Request(request),
        }
    }

    fn response_message(&mut self, request_tid: u16, response: ResponseSpecific) -> Message {
        Message {
            transaction_id: request_tid,
            version: Some(VERSION.to_vec()),
            sender_id: *self.identity.id(),
            sender_public_key: self.identity.public_key(),
            signature: None,
            message_type: MessageType::Response(response),
        }
    }

    fn send(&mut self, address: SocketAddrV4, message: &Message) {
        match message.to_bytes() {
            Ok(bytes) => self.multiplexer.send_message(address, &bytes),
            Err(error) => {
                debug!(?error, "Error encoding message");
            }
        }
    }
}

#[derive(Debug)]
struct InflightRequestsMap {
    request_timeout: Duration,
    requests: Vec<(u16, InflightRequest)>,
}

impl InflightRequestsMap {
    fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            requests: vec![],
        }
    }

    fn contains_key(&self, key: &u16) -> bool {
        match self.find_index(key) {
            Ok(index) => self
                .requests
                .get(index)
                .map(|(_, request)| request.sent_at.elapsed() < self.request_timeout)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn insert(&mut self, key: u16, inflight_request: InflightRequest) {
        match self.find_index(&key) {
            // A tid can wrap around onto a stuck entry; replace it.
            Ok(index) => self.requests[index] = (key, inflight_request),
            Err(index) => self.requests.insert(index, (key, inflight_request)),
        }
    }

    fn remove(&mut self, key: &u16) -> Option<InflightRequest> {
        match self.find_index(key) {
            Ok(index) => Some(self.requests.remove(index).1),
            Err(_) => None,
        }
    }

    fn find_index(&self, key: &u16) -> Result<usize, usize> {
        self.requests.binary_search_by(|(tid, _)| tid.cmp(key))
    }

    fn cleanup(&mut self) {
        let request_timeout = self.request_timeout;

        self.requests
            .retain(|(_, request)| request.sent_at.elapsed() < request_timeout);
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::messages::store_signable;
    use bytes::Bytes;

    fn protocol() -> Protocol {
        Protocol::new(&Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap()
    }

    fn loopback(protocol: &Protocol) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), protocol.local_addr().port())
    }

    #[test]
    fn tid_wraps() {
        let mut protocol = protocol();

        assert_eq!(protocol.tid(), 0);
        assert_eq!(protocol.tid(), 1);

        protocol.next_tid = u16::MAX;

        assert_eq!(protocol.tid(), 65535);
        assert_eq!(protocol.tid(), 0);
    }

    #[test]
    fn request_response_roundtrip() {
        let mut server = protocol();
        let server_address = loopback(&server);
        let server_id = *server.id();

        let mut client = protocol();
        let client_id = *client.id();

        let server_thread = thread::spawn(move || loop {
            server.tick();
            if let Some((message, from)) = server.recv_from() {
                assert_eq!(message.sender_id, client_id);
                assert_eq!(
                    message.message_type,
                    MessageType::Request(RequestSpecific::Ping)
                );

                server.response(from, message.transaction_id, ResponseSpecific::Ping);

                // Flush retransmissions until the ack comes back.
                for _ in 0..50 {
                    server.tick();
                    let _ = server.recv_from();
                }
                break;
            }
        });

        let tid = client.request(server_address, RequestSpecific::Ping);
        assert!(client.inflight(&tid));

        let start = Instant::now();
        loop {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");

            client.tick();
            if let Some((message, _)) = client.recv_from() {
                assert_eq!(message.transaction_id, tid);
                assert_eq!(message.sender_id, server_id);
                assert_eq!(
                    message.message_type,
                    MessageType::Response(ResponseSpecific::Ping)
                );
                break;
            }
        }

        assert!(!client.inflight(&tid));

        server_thread.join().unwrap();
    }

    #[test]
    fn signed_store_request_is_accepted() {
        let mut server = protocol();
        let server_address = loopback(&server);

        let mut client = protocol();

        let server_thread = thread::spawn(move || loop {
            server.tick();
            if let Some((message, _)) = server.recv_from() {
                assert!(matches!(
                    message.message_type,
                    MessageType::Request(RequestSpecific::Store { .. })
                ));
                break;
            }
        });

        client.request(
            server_address,
            RequestSpecific::Store {
                key: Id::random(),
                value: Bytes::from_static(b"listing"),
                ttl: Duration::from_secs(3600),
            },
        );

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            client.tick();
            let _ = client.recv_from();
            if server_thread.is_finished() {
                break;
            }
        }

        server_thread.join().unwrap();
    }

    #[test]
    fn store_with_bad_signature_is_dropped() {
        let mut server = protocol();
        let server_address = loopback(&server);

        let mut client = protocol();

        let key = Id::random();
        let value = Bytes::from_static(b"listing");
        let ttl = Duration::from_secs(60);

        // Signature over different bytes than the request carries.
        let bogus = client
            .identity()
            .sign(&store_signable(&key, b"other", ttl));

        let message = Message {
            transaction_id: 7,
            version: None,
            sender_id: *client.identity().id(),
            sender_public_key: client.identity().public_key(),
            signature: Some(bogus),
            message_type: MessageType::Request(RequestSpecific::Store { key, value, ttl }),
        };

        let bytes = message.to_bytes().unwrap();
        client.multiplexer.send_message(server_address, &bytes);

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            client.tick();
            server.tick();
            assert!(server.recv_from().is_none());
        }
    }

    #[test]
    fn unexpected_response_is_dropped() {
        let mut server = protocol();
        let server_address = loopback(&server);

        let mut client = protocol();

        // A response to a tid the server never sent.
        client.response(server_address, 42, ResponseSpecific::Ping);

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            client.tick();
            server.tick();
            assert!(server.recv_from().is_none());
        }
    }

    #[test]
    fn unregistered_command_is_dropped() {
        let mut server = protocol();
        server.unregister(Command::Ping);
        let server_address = loopback(&server);

        let mut client = protocol();
        client.request(server_address, RequestSpecific::Ping);

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            client.tick();
            server.tick();
            assert!(server.recv_from().is_none());
        }
    }

    #[test]
    fn unsigned_store_is_a_bad_signature_error() {
        let protocol = protocol();
        let identity = protocol.identity().clone();

        let request = RequestSpecific::Store {
            key: Id::random(),
            value: Bytes::from_static(b"listing"),
            ttl: Duration::from_secs(60),
        };
        let message = Message {
            transaction_id: 0,
            version: None,
            sender_id: *identity.id(),
            sender_public_key: identity.public_key(),
            signature: None,
            message_type: MessageType::Request(request.clone()),
        };

        assert!(matches!(
            protocol.verify_request_signature(&message, &request),
            Err(MessageError::BadSignature)
        ));

        // Pings carry no signature and pass.
        assert!(protocol
            .verify_request_signature(&message, &RequestSpecific::Ping)
            .is_ok());
    }

    #[test]
    fn inflight_request_timeout() {
        let mut protocol = Protocol::new(&Config {
            port: Some(0),
            request_timeout: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap();

        let tid = protocol.request(
            SocketAddrV4::new([127, 0, 0, 1].into(), 1),
            RequestSpecific::Ping,
        );

        thread::sleep(Duration::from_millis(20));

        assert!(!protocol.inflight(&tid));
    }
}
