//! Server Link for the Weighing Station
//!
//! The station talks to exactly two remote parties: its collection server
//! and a time server. All traffic is request/response JSON over whichever
//! transport the deployment configures.
//!
//! # Transport Options
//! - **CoAP** (default): Lightweight UDP-based protocol for battery devices
//! - **Memory**: In-memory transport for testing

use crate::error::{NetworkError, Result};
use crate::types::{Digest, EventKind, PayloadKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Confirmation payload sent after a transfer digest matched.
pub const CONFIRM_OK: &str = "ok";

/// What a lifecycle notice announces about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// Setup finished, device holds identity and calibration
    Provisioned,
    /// Device entered active duty
    Activated,
    /// Device left active duty
    Deactivated,
}

impl std::fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoticeKind::Provisioned => write!(f, "provisioned"),
            NoticeKind::Activated => write!(f, "activated"),
            NoticeKind::Deactivated => write!(f, "deactivated"),
        }
    }
}

/// Wire message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Device announces a lifecycle change
    LifecycleNotice {
        device_id: String,
        timestamp: Timestamp,
        notice: NoticeKind,
    },
    /// Server acknowledges a notice
    Ack,
    /// Device offers a payload and its digest
    TransferRequest {
        kind: PayloadKind,
        payload: String,
        digest: Digest,
    },
    /// Server echoes the digest it computed over the received payload
    TransferReply { digest: Digest },
    /// Device confirms the echoed digest matched
    TransferConfirm { status: String },
    /// Device asks for its transmission schedule
    ScheduleRequest { device_id: String },
    /// Transmission minutes, counted from midnight
    ScheduleReply { morning: u16, evening: u16 },
    /// Ping for liveness
    Ping { device_id: String },
    /// Pong response
    Pong { device_id: String },
    /// Device asks what its reference plate weighs
    PlateWeightRequest { device_id: String },
    /// Reference plate weight in grams
    PlateWeightReply { grams: u32 },
    /// Device reports the plate weight it is configured with
    PlateWeightReport { device_id: String, grams: u32 },
    /// Unprovisioned device asks to be assigned an identity
    IdentityRequest,
    /// Assigned identity
    IdentityReply { device_id: String },
    /// Current time, for clock drift checks
    TimeRequest,
    /// Time server's clock
    TimeReply { timestamp: Timestamp },
    /// Device asks whether the server queued work for it
    DirectiveRequest { device_id: String },
    /// Work the server wants run, oldest first
    DirectiveReply { directives: Vec<EventKind> },
}

impl Message {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::LifecycleNotice { .. } => "lifecycle-notice",
            Message::Ack => "ack",
            Message::TransferRequest { .. } => "transfer-request",
            Message::TransferReply { .. } => "transfer-reply",
            Message::TransferConfirm { .. } => "transfer-confirm",
            Message::ScheduleRequest { .. } => "schedule-request",
            Message::ScheduleReply { .. } => "schedule-reply",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::PlateWeightRequest { .. } => "plate-weight-request",
            Message::PlateWeightReply { .. } => "plate-weight-reply",
            Message::PlateWeightReport { .. } => "plate-weight-report",
            Message::IdentityRequest => "identity-request",
            Message::IdentityReply { .. } => "identity-reply",
            Message::TimeRequest => "time-request",
            Message::TimeReply { .. } => "time-reply",
            Message::DirectiveRequest { .. } => "directive-request",
            Message::DirectiveReply { .. } => "directive-reply",
        }
    }
}

/// Link statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkStats {
    /// Messages sent
    pub sent: u64,
    /// Replies received
    pub received: u64,
    /// Requests that timed out
    pub timeouts: u64,
    /// Sends that failed outright
    pub send_failures: u64,
}

/// Transport to the collection server and the time server.
///
/// Implementations are driven from a single control task, but the trait is
/// `Send + Sync` so a link can be shared with the status monitor.
#[allow(async_fn_in_trait)]
pub trait ServerLink: Send + Sync {
    /// Fire-and-forget send to the collection server.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Send to the collection server and wait for one reply.
    async fn request(&self, message: &Message, timeout: Duration) -> Result<Message>;

    /// Send to the time server and wait for one reply.
    ///
    /// Deployments without a dedicated time server route this to the
    /// collection server.
    async fn time_request(&self, message: &Message, timeout: Duration) -> Result<Message> {
        self.request(message, timeout).await
    }

    /// Counters since the link was created.
    fn stats(&self) -> LinkStats;
}

// ============================================================================
// Memory link
// ============================================================================

/// In-memory link for testing.
///
/// Records everything sent and answers requests like a minimal server:
/// transfer requests get their digest echoed back, pings get pongs, and so
/// on. Tests script deviations - queued replies take precedence over the
/// built-in answers, and failure counters make the next N operations fail.
pub struct MemoryLink {
    sent: Mutex<Vec<Message>>,
    scripted: Mutex<VecDeque<Message>>,
    directives: Mutex<VecDeque<EventKind>>,
    fail_requests: AtomicU32,
    fail_sends: AtomicU32,
    corrupt_echoes: AtomicU32,
    fail_time_requests: AtomicBool,
    sent_count: AtomicU64,
    received_count: AtomicU64,
    timeout_count: AtomicU64,
    send_failure_count: AtomicU64,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            directives: Mutex::new(VecDeque::new()),
            fail_requests: AtomicU32::new(0),
            fail_sends: AtomicU32::new(0),
            corrupt_echoes: AtomicU32::new(0),
            fail_time_requests: AtomicBool::new(false),
            sent_count: AtomicU64::new(0),
            received_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            send_failure_count: AtomicU64::new(0),
        }
    }

    /// Queue a reply; served before the built-in answers, oldest first.
    pub fn push_reply(&self, reply: Message) {
        self.lock(&self.scripted).push_back(reply);
    }

    /// Queue a directive handed out on the next `DirectiveRequest`.
    pub fn push_directive(&self, directive: EventKind) {
        self.lock(&self.directives).push_back(directive);
    }

    /// Make the next `n` requests time out.
    pub fn fail_next_requests(&self, n: u32) {
        self.fail_requests.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Corrupt the digest echo on the next `n` transfer requests.
    pub fn corrupt_next_echoes(&self, n: u32) {
        self.corrupt_echoes.store(n, Ordering::SeqCst);
    }

    /// Make the time server unreachable.
    pub fn set_time_server_down(&self, down: bool) {
        self.fail_time_requests.store(down, Ordering::SeqCst);
    }

    /// Everything sent so far, sends and requests alike.
    pub fn sent(&self) -> Vec<Message> {
        self.lock(&self.sent).clone()
    }

    /// Drain the sent list.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.lock(&self.sent))
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn consume(&self, counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn answer(&self, message: &Message) -> Result<Message> {
        if let Some(reply) = self.lock(&self.scripted).pop_front() {
            return Ok(reply);
        }
        match message {
            Message::TransferRequest { digest, .. } => {
                let digest = if self.consume(&self.corrupt_echoes) {
                    let mut bytes = digest.0;
                    bytes[0] ^= 0xff;
                    Digest(bytes)
                } else {
                    *digest
                };
                Ok(Message::TransferReply { digest })
            }
            Message::LifecycleNotice { .. }
            | Message::TransferConfirm { .. }
            | Message::PlateWeightReport { .. } => Ok(Message::Ack),
            Message::ScheduleRequest { .. } => Ok(Message::ScheduleReply {
                morning: 7 * 60,
                evening: 19 * 60,
            }),
            Message::Ping { .. } => Ok(Message::Pong {
                device_id: "server".to_string(),
            }),
            Message::PlateWeightRequest { .. } => Ok(Message::PlateWeightReply { grams: 1000 }),
            Message::IdentityRequest => Ok(Message::IdentityReply {
                device_id: "wp-0001".to_string(),
            }),
            Message::TimeRequest => Ok(Message::TimeReply {
                timestamp: Timestamp::now(),
            }),
            Message::DirectiveRequest { .. } => {
                let directives: Vec<EventKind> = self.lock(&self.directives).drain(..).collect();
                Ok(Message::DirectiveReply { directives })
            }
            other => Err(NetworkError::Other(format!(
                "memory link cannot answer {}",
                other.name()
            ))
            .into()),
        }
    }
}

impl Default for MemoryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerLink for MemoryLink {
    async fn send(&self, message: &Message) -> Result<()> {
        if self.consume(&self.fail_sends) {
            self.send_failure_count.fetch_add(1, Ordering::SeqCst);
            return Err(NetworkError::SendFailed {
                what: message.name().to_string(),
                reason: "scripted send failure".to_string(),
            }
            .into());
        }
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        self.lock(&self.sent).push(message.clone());
        Ok(())
    }

    async fn request(&self, message: &Message, timeout: Duration) -> Result<Message> {
        if self.consume(&self.fail_requests) {
            self.timeout_count.fetch_add(1, Ordering::SeqCst);
            return Err(NetworkError::Timeout {
                what: format!("reply to {}", message.name()),
                timeout_ms: timeout.as_millis() as u64,
            }
            .into());
        }
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        self.lock(&self.sent).push(message.clone());
        let reply = self.answer(message)?;
        self.received_count.fetch_add(1, Ordering::SeqCst);
        Ok(reply)
    }

    async fn time_request(&self, message: &Message, timeout: Duration) -> Result<Message> {
        if self.fail_time_requests.load(Ordering::SeqCst) {
            self.timeout_count.fetch_add(1, Ordering::SeqCst);
            return Err(NetworkError::Timeout {
                what: format!("time server reply to {}", message.name()),
                timeout_ms: timeout.as_millis() as u64,
            }
            .into());
        }
        self.request(message, timeout).await
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
