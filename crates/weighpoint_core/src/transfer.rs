//! Checksummed Transfer Protocol
//!
//! Ships the log file and the data table to the collection server with an
//! end-to-end integrity check. The device computes a Blake3 digest over the
//! payload, the server echoes the digest it computed over what it received,
//! and the session closes with a confirmation once the two match.
//!
//! A mismatched echo and a reply timeout are the same failure: one consumed
//! attempt. After `max_attempts` the session fails with
//! [`TransferError::IntegrityFailure`] and the local source is left intact
//! for a later retry. At most one session per [`PayloadKind`] is in flight
//! at any time.

use crate::config::TransferConfig;
use crate::error::{Error, NetworkError, Result, TransferError};
use crate::network::{Message, ServerLink, CONFIRM_OK};
use crate::types::{Digest, PayloadKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One transfer session in flight.
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Which payload is being shipped.
    pub kind: PayloadKind,
    /// Digest over the payload being shipped.
    pub digest: Digest,
    /// Attempts consumed so far.
    pub attempt: u32,
    /// Attempt budget for this session.
    pub max_attempts: u32,
}

/// Proof of a completed transfer.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    /// Which payload was shipped.
    pub kind: PayloadKind,
    /// Digest the server confirmed.
    pub digest: Digest,
    /// Attempts it took, 1-based.
    pub attempts: u32,
    /// Payload size in bytes.
    pub payload_bytes: usize,
}

/// Transfer statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStats {
    /// Sessions started
    pub sessions: u64,
    /// Sessions that closed confirmed
    pub successes: u64,
    /// Sessions that exhausted their attempts
    pub failures: u64,
    /// Individual attempts made
    pub attempts: u64,
    /// Attempts that ended in a digest mismatch
    pub mismatches: u64,
    /// Attempts that ended in a link error or timeout
    pub comm_errors: u64,
    /// Sessions rejected because one was already in flight
    pub busy_rejections: u64,
}

/// Why one attempt failed. Both reasons consume the attempt.
enum AttemptFailure {
    Mismatch { echoed: Digest },
    Comm(Error),
}

/// Runs checksummed transfer sessions over a server link.
pub struct TransferManager<L> {
    link: Arc<L>,
    config: TransferConfig,
    log_busy: AtomicBool,
    data_busy: AtomicBool,
    stats: Mutex<TransferStats>,
}

/// Releases the per-kind session slot when the session ends, however it
/// ends.
#[derive(Debug)]
struct SessionSlot<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl<L: ServerLink> TransferManager<L> {
    pub fn new(link: Arc<L>, config: TransferConfig) -> Self {
        Self {
            link,
            config,
            log_busy: AtomicBool::new(false),
            data_busy: AtomicBool::new(false),
            stats: Mutex::new(TransferStats::default()),
        }
    }

    /// `true` while a session for `kind` is in flight.
    pub fn is_busy(&self, kind: PayloadKind) -> bool {
        self.flag_for(kind).load(Ordering::SeqCst)
    }

    /// Counters since the manager was created.
    pub fn stats(&self) -> TransferStats {
        self.lock_stats().clone()
    }

    /// Ship `payload` to the server with integrity confirmation.
    ///
    /// Returns a [`TransferReceipt`] once the server confirmed a matching
    /// digest. Fails with [`TransferError::SessionBusy`] when a session for
    /// the same kind is in flight, and with
    /// [`TransferError::IntegrityFailure`] once every attempt ended in a
    /// mismatch or a link failure. The caller owns the payload source; this
    /// never deletes anything.
    pub async fn send(&self, kind: PayloadKind, payload: &str) -> Result<TransferReceipt> {
        let _slot = self.claim(kind)?;
        self.lock_stats().sessions += 1;

        let mut session = TransferSession {
            kind,
            digest: Digest::from_bytes(payload.as_bytes()),
            attempt: 0,
            max_attempts: self.config.max_attempts,
        };
        log::info!(
            "{} transfer started: {} bytes, digest {}",
            kind,
            payload.len(),
            session.digest
        );

        while session.attempt < session.max_attempts {
            session.attempt += 1;
            self.lock_stats().attempts += 1;

            match self.attempt_once(&session, payload).await {
                Ok(()) => {
                    self.lock_stats().successes += 1;
                    log::info!(
                        "{} transfer confirmed on attempt {}/{}",
                        kind,
                        session.attempt,
                        session.max_attempts
                    );
                    return Ok(TransferReceipt {
                        kind,
                        digest: session.digest,
                        attempts: session.attempt,
                        payload_bytes: payload.len(),
                    });
                }
                Err(AttemptFailure::Mismatch { echoed }) => {
                    self.lock_stats().mismatches += 1;
                    log::warn!(
                        "{} transfer attempt {}/{}: digest mismatch, sent {} got {}",
                        kind,
                        session.attempt,
                        session.max_attempts,
                        session.digest,
                        echoed
                    );
                }
                Err(AttemptFailure::Comm(e)) => {
                    self.lock_stats().comm_errors += 1;
                    log::warn!(
                        "{} transfer attempt {}/{}: {}",
                        kind,
                        session.attempt,
                        session.max_attempts,
                        e
                    );
                }
            }

            if session.attempt < session.max_attempts {
                // Jittered pause so retransmissions do not hammer a server
                // that is already struggling.
                let jitter = Duration::from_millis(10 + rand::random_range(0..40));
                smol::Timer::after(jitter).await;
            }
        }

        self.lock_stats().failures += 1;
        Err(TransferError::IntegrityFailure {
            kind,
            attempts: session.max_attempts,
        }
        .into())
    }

    /// One transmit/echo/confirm round.
    async fn attempt_once(
        &self,
        session: &TransferSession,
        payload: &str,
    ) -> std::result::Result<(), AttemptFailure> {
        let request = Message::TransferRequest {
            kind: session.kind,
            payload: payload.to_string(),
            digest: session.digest,
        };
        let reply = self
            .link
            .request(&request, self.config.ack_timeout)
            .await
            .map_err(AttemptFailure::Comm)?;

        match reply {
            Message::TransferReply { digest } if digest == session.digest => {}
            Message::TransferReply { digest } => {
                return Err(AttemptFailure::Mismatch { echoed: digest });
            }
            other => {
                return Err(AttemptFailure::Comm(
                    NetworkError::UnexpectedReply {
                        expected: "transfer-reply".to_string(),
                        got: other.name().to_string(),
                    }
                    .into(),
                ));
            }
        }

        // The session only closes once the server acknowledges the
        // confirmation; losing the ack costs the attempt like a mismatch.
        let confirm = Message::TransferConfirm {
            status: CONFIRM_OK.to_string(),
        };
        match self
            .link
            .request(&confirm, self.config.ack_timeout)
            .await
            .map_err(AttemptFailure::Comm)?
        {
            Message::Ack => Ok(()),
            other => Err(AttemptFailure::Comm(
                NetworkError::UnexpectedReply {
                    expected: "ack".to_string(),
                    got: other.name().to_string(),
                }
                .into(),
            )),
        }
    }

    fn claim(&self, kind: PayloadKind) -> Result<SessionSlot<'_>> {
        let flag = self.flag_for(kind);
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.lock_stats().busy_rejections += 1;
            return Err(TransferError::SessionBusy { kind }.into());
        }
        Ok(SessionSlot { flag })
    }

    fn flag_for(&self, kind: PayloadKind) -> &AtomicBool {
        match kind {
            PayloadKind::Log => &self.log_busy,
            PayloadKind::Data => &self.data_busy,
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, TransferStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
