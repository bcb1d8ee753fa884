//! CoAP Transport for the Weighing Station
//!
//! Implements the client side of the Constrained Application Protocol
//! (RFC 7252) over UDP. The station only ever initiates exchanges; the
//! collection server answers with piggybacked responses.
//!
//! # Features
//! - Confirmable (CON) requests with retransmission
//! - Non-confirmable (NON) fire-and-forget sends
//! - Block-wise transfer for payloads over one datagram (RFC 7959)
//!
//! # Resources
//! - `/lifecycle` - Lifecycle notices
//! - `/transfer` - Payload transfers and confirmations
//! - `/schedule` - Transmission schedule requests
//! - `/ping` - Liveness checks
//! - `/plate` - Reference plate weight requests
//! - `/identity` - Identity assignment
//! - `/time` - Clock drift checks
//! - `/directive` - Queued server directives

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};

use crate::error::{NetworkError, Result};
use crate::network::{LinkStats, Message, ServerLink};
use async_io::Async;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum CoAP message size before block-wise transfer kicks in
pub const COAP_MAX_MESSAGE_SIZE: usize = 1024;

/// Default CoAP port
pub const COAP_DEFAULT_PORT: u16 = 5683;

/// Block size for block-wise transfers (256 bytes = SZX 2)
pub const BLOCK_SIZE: usize = 256;

/// Maximum retransmissions for CON requests
pub const MAX_RETRANSMIT: u8 = 4;

/// Retransmission interval in milliseconds
pub const ACK_TIMEOUT_MS: u64 = 2000;

/// CoAP link to the collection server and the time server.
pub struct CoapLink {
    socket: Async<UdpSocket>,
    server_addr: SocketAddr,
    time_server_addr: SocketAddr,
    message_id: AtomicU16,
    sent_count: AtomicU64,
    received_count: AtomicU64,
    timeout_count: AtomicU64,
    send_failure_count: AtomicU64,
}

impl CoapLink {
    /// Bind a local UDP socket and point the link at its servers.
    pub fn open(server_addr: &str, time_server_addr: &str, bind_addr: &str) -> Result<Self> {
        let server_addr = parse_addr(server_addr)?;
        let time_server_addr = parse_addr(time_server_addr)?;

        let socket = UdpSocket::bind(bind_addr).map_err(|e| {
            NetworkError::Other(format!("failed to bind CoAP socket on {}: {}", bind_addr, e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| NetworkError::Other(format!("failed to set non-blocking: {}", e)))?;
        let socket = Async::new(socket)
            .map_err(|e| NetworkError::Other(format!("failed to create async socket: {}", e)))?;

        log::info!(
            "coap link open, server {}, time server {}",
            server_addr,
            time_server_addr
        );

        Ok(Self {
            socket,
            server_addr,
            time_server_addr,
            message_id: AtomicU16::new(rand::random()),
            sent_count: AtomicU64::new(0),
            received_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            send_failure_count: AtomicU64::new(0),
        })
    }

    /// Local address the link is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .get_ref()
            .local_addr()
            .map_err(|e| NetworkError::Other(format!("no local address: {}", e)).into())
    }

    /// Map message type to CoAP path
    fn message_to_path(message: &Message) -> &'static str {
        match message {
            Message::LifecycleNotice { .. } | Message::Ack => "/lifecycle",
            Message::TransferRequest { .. }
            | Message::TransferReply { .. }
            | Message::TransferConfirm { .. } => "/transfer",
            Message::ScheduleRequest { .. } | Message::ScheduleReply { .. } => "/schedule",
            Message::Ping { .. } | Message::Pong { .. } => "/ping",
            Message::PlateWeightRequest { .. }
            | Message::PlateWeightReply { .. }
            | Message::PlateWeightReport { .. } => "/plate",
            Message::IdentityRequest | Message::IdentityReply { .. } => "/identity",
            Message::TimeRequest | Message::TimeReply { .. } => "/time",
            Message::DirectiveRequest { .. } | Message::DirectiveReply { .. } => "/directive",
        }
    }

    fn next_message_id(&self) -> u16 {
        self.message_id
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1)
    }

    fn generate_token() -> Vec<u8> {
        let token: [u8; 4] = rand::random();
        token.to_vec()
    }

    /// Create a CoAP request packet
    fn build_packet(&self, path: &str, payload: &[u8], confirmable: bool, token: &[u8]) -> Packet {
        let mut packet = Packet::new();

        packet.header.set_version(1);
        packet.header.set_type(if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.header.message_id = self.next_message_id();
        packet.set_token(token.to_vec());

        for segment in path.trim_start_matches('/').split('/') {
            if !segment.is_empty() {
                packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
            }
        }

        // Content format: application/json = 50
        packet.add_option(CoapOption::ContentFormat, vec![50]);

        packet.payload = payload.to_vec();
        packet
    }

    async fn send_bytes(&self, addr: SocketAddr, bytes: &[u8], what: &str) -> Result<()> {
        self.socket
            .send_to(bytes, addr)
            .await
            .map(|_| ())
            .map_err(|e| {
                NetworkError::SendFailed {
                    what: what.to_string(),
                    reason: e.to_string(),
                }
                .into()
            })
    }

    /// Send a payload as a sequence of Block1 blocks sharing one token.
    async fn send_blocks(
        &self,
        addr: SocketAddr,
        path: &str,
        data: &[u8],
        token: &[u8],
        what: &str,
    ) -> Result<()> {
        let total_blocks = data.len().div_ceil(BLOCK_SIZE);

        for block_num in 0..total_blocks {
            let start = block_num * BLOCK_SIZE;
            let end = std::cmp::min(start + BLOCK_SIZE, data.len());
            let more = block_num < total_blocks - 1;

            let mut packet = self.build_packet(path, &data[start..end], true, token);

            // Block1 format: NUM (4+ bits) | M (1 bit) | SZX (3 bits)
            let block1_value = ((block_num as u32) << 4) | (if more { 0x08 } else { 0x00 }) | 0x02;
            let block1_bytes = if block1_value <= 0xFF {
                vec![block1_value as u8]
            } else if block1_value <= 0xFFFF {
                block1_value.to_be_bytes()[2..].to_vec()
            } else {
                block1_value.to_be_bytes().to_vec()
            };
            packet.add_option(CoapOption::Block1, block1_bytes);

            let bytes = packet
                .to_bytes()
                .map_err(|e| NetworkError::Other(format!("failed to serialize block: {:?}", e)))?;
            self.send_bytes(addr, &bytes, what).await?;

            log::trace!("sent block {}/{} to {}", block_num + 1, total_blocks, addr);
        }

        Ok(())
    }

    /// Wait for one packet, or `None` once the deadline passes.
    async fn recv_until(&self, until: Instant) -> Result<Option<(SocketAddr, Packet)>> {
        let recv = async {
            let mut buf = [0u8; 2048];
            loop {
                let (len, addr) = self.socket.recv_from(&mut buf).await.map_err(|e| {
                    crate::error::Error::from(NetworkError::Other(format!("receive error: {}", e)))
                })?;
                match Packet::from_bytes(&buf[..len]) {
                    Ok(packet) => return Ok(Some((addr, packet))),
                    Err(e) => log::warn!("dropping malformed coap packet from {}: {:?}", addr, e),
                }
            }
        };
        let timer = async {
            smol::Timer::at(until).await;
            Ok(None)
        };
        smol::future::race(recv, timer).await
    }

    /// Confirmable exchange: send, await the token-matched reply, retransmit
    /// on silence. Block-wise sends get a single wait window instead of
    /// per-packet retransmission.
    async fn exchange(
        &self,
        addr: SocketAddr,
        message: &Message,
        timeout: Duration,
    ) -> Result<Message> {
        let payload = serde_json::to_vec(message)?;
        let path = Self::message_to_path(message);
        let token = Self::generate_token();

        let single = if payload.len() <= COAP_MAX_MESSAGE_SIZE {
            let packet = self.build_packet(path, &payload, true, &token);
            let bytes = packet
                .to_bytes()
                .map_err(|e| NetworkError::Other(format!("failed to serialize packet: {:?}", e)))?;
            self.send_bytes(addr, &bytes, message.name()).await?;
            Some(bytes)
        } else {
            self.send_blocks(addr, path, &payload, &token, message.name())
                .await?;
            None
        };
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        log::debug!("coap sent to {}: {} ({} bytes)", addr, path, payload.len());

        let deadline = Instant::now() + timeout;
        let mut retransmits = 0u8;
        let mut next_retransmit = Instant::now() + Duration::from_millis(ACK_TIMEOUT_MS);

        loop {
            let wait_until = if single.is_some() {
                deadline.min(next_retransmit)
            } else {
                deadline
            };

            match self.recv_until(wait_until).await? {
                Some((_, reply)) => {
                    if reply.get_token() != token.as_slice() {
                        continue;
                    }
                    // A code-0.00 ACK is transport-level, the reply follows.
                    if matches!(reply.header.code, MessageClass::Empty) {
                        continue;
                    }
                    self.received_count.fetch_add(1, Ordering::SeqCst);
                    if reply.payload.is_empty() {
                        return Ok(Message::Ack);
                    }
                    return Ok(serde_json::from_slice(&reply.payload)?);
                }
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.timeout_count.fetch_add(1, Ordering::SeqCst);
                        return Err(NetworkError::Timeout {
                            what: format!("reply to {}", message.name()),
                            timeout_ms: timeout.as_millis() as u64,
                        }
                        .into());
                    }
                    if let Some(bytes) = &single {
                        if retransmits < MAX_RETRANSMIT {
                            self.send_bytes(addr, bytes, message.name()).await?;
                            retransmits += 1;
                            log::debug!(
                                "retransmitted {} to {} (attempt {})",
                                message.name(),
                                addr,
                                retransmits
                            );
                        }
                        next_retransmit = now + Duration::from_millis(ACK_TIMEOUT_MS);
                    }
                }
            }
        }
    }
}

impl ServerLink for CoapLink {
    async fn send(&self, message: &Message) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let path = Self::message_to_path(message);
        let packet = self.build_packet(path, &payload, false, &Self::generate_token());
        let bytes = packet
            .to_bytes()
            .map_err(|e| NetworkError::Other(format!("failed to serialize packet: {:?}", e)))?;

        match self.send_bytes(self.server_addr, &bytes, message.name()).await {
            Ok(()) => {
                self.sent_count.fetch_add(1, Ordering::SeqCst);
                log::debug!("coap sent to {}: {}", self.server_addr, path);
                Ok(())
            }
            Err(e) => {
                self.send_failure_count.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn request(&self, message: &Message, timeout: Duration) -> Result<Message> {
        self.exchange(self.server_addr, message, timeout).await
    }

    async fn time_request(&self, message: &Message, timeout: Duration) -> Result<Message> {
        self.exchange(self.time_server_addr, message, timeout).await
    }

    fn stats(&self) -> LinkStats {
        LinkStats {
            sent: self.sent_count.load(Ordering::SeqCst),
            received: self.received_count.load(Ordering::SeqCst),
            timeouts: self.timeout_count.load(Ordering::SeqCst),
            send_failures: self.send_failure_count.load(Ordering::SeqCst),
        }
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse().map_err(|_| {
        NetworkError::InvalidAddress {
            addr: addr.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Digest, PayloadKind};
    use coap_lite::ResponseType;

    fn test_link(server_addr: SocketAddr) -> CoapLink {
        CoapLink::open(
            &server_addr.to_string(),
            &server_addr.to_string(),
            "127.0.0.1:0",
        )
        .unwrap()
    }

    fn bound_server() -> (Async<UdpSocket>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr = socket.local_addr().unwrap();
        (Async::new(socket).unwrap(), addr)
    }

    fn reply_packet(request: &Packet, payload: &[u8]) -> Vec<u8> {
        let mut response = Packet::new();
        response.header.set_version(1);
        response.header.set_type(MessageType::Acknowledgement);
        response.header.code = MessageClass::Response(ResponseType::Content);
        response.header.message_id = request.header.message_id;
        response.set_token(request.get_token().to_vec());
        response.add_option(CoapOption::ContentFormat, vec![50]);
        response.payload = payload.to_vec();
        response.to_bytes().unwrap()
    }

    fn answer(message: &Message) -> Message {
        match message {
            Message::Ping { .. } => Message::Pong {
                device_id: "server".to_string(),
            },
            Message::TransferRequest { digest, .. } => Message::TransferReply { digest: *digest },
            _ => Message::Ack,
        }
    }

    /// Answer one request, reassembling blocks when Block1 options appear.
    async fn serve_one(socket: &Async<UdpSocket>) {
        let mut assembled: Vec<u8> = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            let (len, addr) = socket.recv_from(&mut buf).await.unwrap();
            let packet = Packet::from_bytes(&buf[..len]).unwrap();
            assembled.extend_from_slice(&packet.payload);

            let more = packet
                .get_option(CoapOption::Block1)
                .and_then(|opts| opts.back())
                .map(|bytes| {
                    let mut value = 0u32;
                    for b in bytes {
                        value = (value << 8) | *b as u32;
                    }
                    value & 0x08 != 0
                })
                .unwrap_or(false);
            if more {
                continue;
            }

            let message: Message = serde_json::from_slice(&assembled).unwrap();
            let bytes = reply_packet(&packet, &serde_json::to_vec(&answer(&message)).unwrap());
            socket.send_to(&bytes, addr).await.unwrap();
            return;
        }
    }

    #[test]
    fn test_open_rejects_bad_address() {
        let result = CoapLink::open("not-an-address", "127.0.0.1:5683", "127.0.0.1:0");
        assert!(result.is_err());
    }

    #[test]
    fn test_message_to_path() {
        assert_eq!(
            CoapLink::message_to_path(&Message::Ping {
                device_id: "wp-1".to_string()
            }),
            "/ping"
        );
        assert_eq!(
            CoapLink::message_to_path(&Message::IdentityRequest),
            "/identity"
        );
        assert_eq!(CoapLink::message_to_path(&Message::TimeRequest), "/time");
        assert_eq!(
            CoapLink::message_to_path(&Message::TransferConfirm {
                status: "ok".to_string()
            }),
            "/transfer"
        );
        assert_eq!(
            CoapLink::message_to_path(&Message::DirectiveRequest {
                device_id: "wp-1".to_string()
            }),
            "/directive"
        );
    }

    #[test]
    fn test_build_packet_confirmable() {
        let (_server, addr) = bound_server();
        let link = test_link(addr);

        let token = CoapLink::generate_token();
        let packet = link.build_packet("/transfer", b"data", true, &token);

        assert_eq!(packet.header.get_type(), MessageType::Confirmable);
        assert_eq!(packet.header.code, MessageClass::Request(RequestType::Post));
        assert_eq!(packet.get_token(), token.as_slice());
        assert_eq!(packet.payload, b"data");

        let uri_paths = packet.get_option(CoapOption::UriPath).unwrap();
        assert_eq!(uri_paths.len(), 1);
        assert_eq!(uri_paths.front().unwrap().as_slice(), b"transfer");
    }

    #[test]
    fn test_build_packet_non_confirmable() {
        let (_server, addr) = bound_server();
        let link = test_link(addr);
        let packet = link.build_packet("/ping", b"", false, &CoapLink::generate_token());
        assert_eq!(packet.header.get_type(), MessageType::NonConfirmable);
        assert!(packet.get_option(CoapOption::ContentFormat).is_some());
    }

    #[test]
    fn test_message_id_increments() {
        let (_server, addr) = bound_server();
        let link = test_link(addr);
        let id1 = link.next_message_id();
        let id2 = link.next_message_id();
        assert_eq!(id2, id1.wrapping_add(1));
    }

    #[test]
    fn test_generate_token_length() {
        assert_eq!(CoapLink::generate_token().len(), 4);
    }

    #[test]
    fn test_request_roundtrip() {
        smol::block_on(async {
            let (server, addr) = bound_server();
            let link = test_link(addr);

            let server_task = smol::spawn(async move { serve_one(&server).await });

            let reply = link
                .request(
                    &Message::Ping {
                        device_id: "wp-1".to_string(),
                    },
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            assert!(matches!(reply, Message::Pong { .. }));

            server_task.await;
            let stats = link.stats();
            assert_eq!(stats.sent, 1);
            assert_eq!(stats.received, 1);
        });
    }

    #[test]
    fn test_request_times_out_when_server_silent() {
        smol::block_on(async {
            let (_server, addr) = bound_server();
            let link = test_link(addr);

            let err = link
                .request(
                    &Message::Ping {
                        device_id: "wp-1".to_string(),
                    },
                    Duration::from_millis(50),
                )
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                crate::error::Error::Network(NetworkError::Timeout { .. })
            ));
            assert_eq!(link.stats().timeouts, 1);
        });
    }

    #[test]
    fn test_large_payload_goes_block_wise() {
        smol::block_on(async {
            let (server, addr) = bound_server();
            let link = test_link(addr);

            let payload = "w".repeat(COAP_MAX_MESSAGE_SIZE * 3);
            let digest = Digest::from_bytes(payload.as_bytes());
            let request = Message::TransferRequest {
                kind: PayloadKind::Log,
                payload,
                digest,
            };

            let server_task = smol::spawn(async move { serve_one(&server).await });

            let reply = link.request(&request, Duration::from_secs(2)).await.unwrap();
            if let Message::TransferReply { digest: echoed } = reply {
                assert_eq!(echoed, digest);
            } else {
                panic!("Expected TransferReply");
            }
            server_task.await;
        });
    }

    #[test]
    fn test_send_non_confirmable() {
        smol::block_on(async {
            let (server, addr) = bound_server();
            let link = test_link(addr);

            link.send(&Message::Ping {
                device_id: "wp-1".to_string(),
            })
            .await
            .unwrap();

            let mut buf = [0u8; 2048];
            let (len, _) = server.recv_from(&mut buf).await.unwrap();
            let packet = Packet::from_bytes(&buf[..len]).unwrap();
            assert_eq!(packet.header.get_type(), MessageType::NonConfirmable);

            let message: Message = serde_json::from_slice(&packet.payload).unwrap();
            assert!(matches!(message, Message::Ping { .. }));
        });
    }
}
