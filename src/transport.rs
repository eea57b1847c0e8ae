//! CoAP Transport
//!
//! The scheduler reaches the network only through [`Transport`]. [`UdpTransport`]
//! is the production implementation: one UDP socket, confirmable requests with
//! RFC 7252 exponential retransmission, piggybacked and separate responses.

use crate::coap::{self, CodecError, ContentFormat, MessageClass, MessageType, Packet};
use crate::om2m::{Endpoint, Request};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};

/// Initial confirmable retransmission timeout
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Retransmissions before a confirmable message is abandoned
pub const MAX_RETRANSMIT: u32 = 4;
/// How long a request token stays matchable
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

const MAX_DATAGRAM: usize = 1500;

/// Transport errors. Fatal to a single send attempt only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("transport closed")]
    Closed,
}

/// Identifies one transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub message_id: u16,
}

/// Response from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: MessageClass,
    pub token: Bytes,
    pub payload: Bytes,
}

impl Response {
    pub fn new(code: MessageClass, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            token: Bytes::new(),
            payload: payload.into(),
        }
    }

    /// Body, if any
    pub fn body(&self) -> Option<&[u8]> {
        (!self.payload.is_empty()).then_some(&self.payload[..])
    }
}

/// Request pushed by the broker, typically a notification
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub method: MessageClass,
    pub confirmable: bool,
    pub message_id: u16,
    pub token: Bytes,
    pub payload: Bytes,
    pub peer: SocketAddr,
}

impl InboundRequest {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Anything the scheduler has to dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Request(InboundRequest),
}

/// Transport contract used by the scheduler
#[async_trait]
pub trait Transport: Send {
    /// Transmit a request to the broker
    async fn send(&mut self, request: &Request) -> Result<RequestHandle, TransportError>;

    /// Wait for the next inbound datagram.
    ///
    /// Returns `Ok(None)` when the datagram was consumed by the transport itself
    /// (empty acks, resets, responses to no outstanding request, undecodable
    /// input). Must be cancel safe.
    async fn receive(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Answer an inbound request
    async fn respond(&mut self, request: &InboundRequest, code: MessageClass) -> Result<(), TransportError>;

    /// Earliest transport-level retransmission, if any
    fn peek_next_scheduled(&self) -> Option<Instant>;

    /// Fire every retransmission due at `now`
    async fn dispatch_scheduled(&mut self, now: Instant) -> Result<(), TransportError>;
}

struct Retransmission {
    wire: Bytes,
    token: Bytes,
    deadline: Instant,
    timeout: Duration,
    attempts: u32,
}

/// UDP CoAP transport bound to a single broker
pub struct UdpTransport {
    socket: UdpSocket,
    broker: SocketAddr,
    next_message_id: u16,
    pending: HashMap<u16, Retransmission>,
    /// Tokens still expecting a response, with their expiry
    exchanges: HashMap<Bytes, Instant>,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind the local socket
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(endpoint.bind).await?;
        tracing::info!("CoAP socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            broker: endpoint.broker,
            next_message_id: rand::random(),
            pending: HashMap::new(),
            exchanges: HashMap::new(),
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Address the broker can reach us on. A wildcard bind is resolved to the
    /// interface that routes to the broker.
    pub fn advertised_addr(&self) -> std::io::Result<SocketAddr> {
        let local = self.socket.local_addr()?;
        if !local.ip().is_unspecified() {
            return Ok(local);
        }

        let route = std::net::UdpSocket::bind(SocketAddr::new(local.ip(), 0))?;
        route.connect(self.broker)?;
        Ok(SocketAddr::new(route.local_addr()?.ip(), local.port()))
    }

    /// Confirmable messages still awaiting an acknowledgement
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Requests still awaiting a response
    pub fn outstanding(&self) -> usize {
        self.exchanges.len()
    }

    fn allocate_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn frame(&mut self, request: &Request) -> Packet {
        let message_id = self.allocate_message_id();

        let mut packet = coap::packet(MessageType::Confirmable, MessageClass::Request(request.method), message_id);
        packet.set_token(rand::random::<u32>().to_be_bytes().to_vec());
        coap::set_uri_path(&mut packet, &request.path);
        packet.set_content_format(ContentFormat::ApplicationJSON);
        packet.add_option(coap::option::ONEM2M_FR, request.origin.as_bytes().to_vec());
        packet.add_option(coap::option::ONEM2M_RQI, request.request_id.as_bytes().to_vec());
        if let Some(ty) = request.resource_type {
            coap::add_uint_option(&mut packet, coap::option::ONEM2M_TY, ty.code());
        }
        packet.payload = request.payload.to_vec();
        packet
    }

    fn reply(&self, packet: &Packet, peer: SocketAddr) {
        let sent = coap::encode(packet)
            .map_err(TransportError::from)
            .and_then(|wire| Ok(self.socket.try_send_to(&wire, peer)?));
        if let Err(e) = sent {
            tracing::debug!("Failed to send {:?} to {}: {}", packet.header.get_type(), peer, e);
        }
    }

    /// Claim the exchange a response belongs to
    fn complete(&mut self, token: &Bytes) -> bool {
        match self.exchanges.remove(token) {
            Some(expiry) => expiry > Instant::now(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, request: &Request) -> Result<RequestHandle, TransportError> {
        let now = Instant::now();
        self.exchanges.retain(|_, expiry| *expiry > now);

        let packet = self.frame(request);
        let wire = coap::encode(&packet)?;
        let message_id = packet.header.message_id;
        let token = Bytes::copy_from_slice(packet.get_token());

        self.socket.send_to(&wire, self.broker).await?;
        self.exchanges.insert(token.clone(), now + EXCHANGE_LIFETIME);
        self.pending.insert(
            message_id,
            Retransmission {
                wire,
                token,
                deadline: now + ACK_TIMEOUT,
                timeout: ACK_TIMEOUT,
                attempts: 0,
            },
        );

        Ok(RequestHandle { message_id })
    }

    async fn receive(&mut self) -> Result<Option<Inbound>, TransportError> {
        let (len, peer) = self.socket.recv_from(&mut self.buf).await?;

        let packet = match coap::decode(&self.buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Dropping undecodable datagram from {}: {}", peer, e);
                return Ok(None);
            }
        };
        let message_id = packet.header.message_id;
        let code = packet.header.code;

        match packet.header.get_type() {
            MessageType::Reset => {
                if let Some(entry) = self.pending.remove(&message_id) {
                    self.exchanges.remove(&entry.token);
                    tracing::debug!("Message {} reset by peer", message_id);
                }
                return Ok(None);
            }
            MessageType::Acknowledgement => {
                self.pending.remove(&message_id);
                if code == MessageClass::Empty {
                    // separate response follows
                    return Ok(None);
                }
            }
            MessageType::Confirmable => {
                if code == MessageClass::Empty {
                    // CoAP ping
                    self.reply(&coap::reset(message_id), peer);
                    return Ok(None);
                }
                if coap::is_response(code) {
                    self.reply(&coap::empty_ack(message_id), peer);
                }
            }
            MessageType::NonConfirmable => {}
        }

        let token = Bytes::copy_from_slice(packet.get_token());
        if coap::is_response(code) {
            if !self.complete(&token) {
                tracing::debug!(
                    "Dropping {} in message {}: no outstanding request for token {:02x?}",
                    coap::code_string(code),
                    message_id,
                    &token[..]
                );
                return Ok(None);
            }
            Ok(Some(Inbound::Response(Response {
                code,
                token,
                payload: Bytes::from(packet.payload),
            })))
        } else if coap::is_request(code) {
            Ok(Some(Inbound::Request(InboundRequest {
                method: code,
                confirmable: packet.header.get_type() == MessageType::Confirmable,
                message_id,
                token,
                payload: Bytes::from(packet.payload),
                peer,
            })))
        } else {
            Ok(None)
        }
    }

    async fn respond(&mut self, request: &InboundRequest, code: MessageClass) -> Result<(), TransportError> {
        let reply = if request.confirmable {
            coap::piggybacked(code, request.message_id, &request.token)
        } else {
            let message_id = self.allocate_message_id();
            let mut reply = coap::packet(MessageType::NonConfirmable, code, message_id);
            reply.set_token(request.token.to_vec());
            reply
        };

        self.socket.send_to(&coap::encode(&reply)?, request.peer).await?;
        Ok(())
    }

    fn peek_next_scheduled(&self) -> Option<Instant> {
        self.pending.values().map(|r| r.deadline).min()
    }

    async fn dispatch_scheduled(&mut self, now: Instant) -> Result<(), TransportError> {
        let due: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let Some(entry) = self.pending.get_mut(&id) else {
                continue;
            };

            if entry.attempts >= MAX_RETRANSMIT {
                tracing::debug!("Giving up on message {} after {} retransmissions", id, entry.attempts);
                if let Some(entry) = self.pending.remove(&id) {
                    self.exchanges.remove(&entry.token);
                }
                continue;
            }

            entry.attempts += 1;
            entry.timeout *= 2;
            entry.deadline = now + entry.timeout;
            let wire = entry.wire.clone();

            if let Err(e) = self.socket.send_to(&wire, self.broker).await {
                tracing::warn!("Retransmission of message {} failed: {}", id, e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::coap::RequestType;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// In-memory transport recording every send
    pub(crate) struct MockTransport {
        sent: Arc<Mutex<Vec<(Instant, Request)>>>,
        replies: Arc<Mutex<Vec<MessageClass>>>,
        dispatched: Arc<Mutex<Vec<Instant>>>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        next_message_id: u16,
        /// Retransmission delay scheduled by every send
        retransmit_after: Option<Duration>,
        scheduled: Option<Instant>,
    }

    /// Test-side handle to a [`MockTransport`]
    #[derive(Clone)]
    pub(crate) struct MockHandle {
        sent: Arc<Mutex<Vec<(Instant, Request)>>>,
        replies: Arc<Mutex<Vec<MessageClass>>>,
        dispatched: Arc<Mutex<Vec<Instant>>>,
        inbound: mpsc::UnboundedSender<Inbound>,
    }

    pub(crate) fn pair() -> (MockTransport, MockHandle) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(Vec::new()));
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MockTransport {
                sent: sent.clone(),
                replies: replies.clone(),
                dispatched: dispatched.clone(),
                inbound: rx,
                next_message_id: 0,
                retransmit_after: None,
                scheduled: None,
            },
            MockHandle {
                sent,
                replies,
                dispatched,
                inbound: tx,
            },
        )
    }

    /// Like [`pair`], but every send schedules one retransmission `after` later
    pub(crate) fn pair_with_retransmission(after: Duration) -> (MockTransport, MockHandle) {
        let (mut transport, handle) = pair();
        transport.retransmit_after = Some(after);
        (transport, handle)
    }

    impl MockHandle {
        pub(crate) fn respond(&self, code: MessageClass, body: &str) {
            let _ = self.inbound.send(Inbound::Response(Response::new(code, body.to_string())));
        }

        pub(crate) fn notify(&self, body: &str) {
            let _ = self.inbound.send(Inbound::Request(InboundRequest {
                method: MessageClass::Request(RequestType::Post),
                confirmable: true,
                message_id: 1,
                token: Bytes::from_static(&[1]),
                payload: Bytes::from(body.to_string()),
                peer: "127.0.0.1:5683".parse().unwrap(),
            }));
        }

        pub(crate) fn sent(&self) -> Vec<Request> {
            self.sent.lock().iter().map(|(_, r)| r.clone()).collect()
        }

        pub(crate) fn sent_at(&self) -> Vec<Instant> {
            self.sent.lock().iter().map(|(t, _)| *t).collect()
        }

        pub(crate) fn replies(&self) -> Vec<MessageClass> {
            self.replies.lock().clone()
        }

        /// Instants at which a scheduled retransmission was fired
        pub(crate) fn dispatched(&self) -> Vec<Instant> {
            self.dispatched.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, request: &Request) -> Result<RequestHandle, TransportError> {
            let now = Instant::now();
            self.sent.lock().push((now, request.clone()));
            if let Some(after) = self.retransmit_after {
                self.scheduled = Some(now + after);
            }
            self.next_message_id = self.next_message_id.wrapping_add(1);
            Ok(RequestHandle {
                message_id: self.next_message_id,
            })
        }

        async fn receive(&mut self) -> Result<Option<Inbound>, TransportError> {
            match self.inbound.recv().await {
                Some(inbound) => Ok(Some(inbound)),
                None => std::future::pending().await,
            }
        }

        async fn respond(&mut self, _request: &InboundRequest, code: MessageClass) -> Result<(), TransportError> {
            self.replies.lock().push(code);
            Ok(())
        }

        fn peek_next_scheduled(&self) -> Option<Instant> {
            self.scheduled
        }

        async fn dispatch_scheduled(&mut self, now: Instant) -> Result<(), TransportError> {
            if self.scheduled.is_some_and(|at| at <= now) {
                self.scheduled = None;
                self.dispatched.lock().push(now);
            }
            Ok(())
        }
    }
}
