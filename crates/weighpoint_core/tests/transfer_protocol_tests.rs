//! Integration tests for the checksummed transfer protocol
//!
//! Exercises the full request / digest-echo / confirm exchange over the
//! in-memory server link, including the failure modes a field radio
//! actually produces: corrupted payloads, dropped replies, and lost
//! acknowledgements.
//!
//! Run with: `cargo test -p weighpoint_core --test transfer_protocol_tests`

use std::sync::Arc;
use std::time::Duration;
use weighpoint_core::{
    Digest, Error, MemoryLink, Message, PayloadKind, TransferConfig, TransferError,
    TransferManager,
};

fn manager(link: &Arc<MemoryLink>) -> TransferManager<MemoryLink> {
    TransferManager::new(
        Arc::clone(link),
        TransferConfig {
            max_attempts: 3,
            ack_timeout: Duration::from_millis(50),
        },
    )
}

#[test]
fn test_clean_transfer_single_attempt() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);

        let payload = "device wp-0001\n0930 event send-log";
        let receipt = mgr.send(PayloadKind::Log, payload).await.unwrap();

        assert_eq!(receipt.attempts, 1);
        assert_eq!(receipt.payload_bytes, payload.len());
        assert_eq!(receipt.digest, Digest::from_bytes(payload.as_bytes()));

        // Exactly one request and one confirmation went out.
        let sent = link.sent();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            Message::TransferRequest {
                kind,
                payload: sent_payload,
                digest,
            } => {
                assert_eq!(*kind, PayloadKind::Log);
                assert_eq!(sent_payload, payload);
                assert_eq!(*digest, Digest::from_bytes(payload.as_bytes()));
            }
            other => panic!("expected transfer request, got {}", other.name()),
        }
        assert!(matches!(&sent[1], Message::TransferConfirm { status } if status == "ok"));
    });
}

#[test]
fn test_corrupted_echo_retries_until_clean() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);
        link.corrupt_next_echoes(2);

        let receipt = mgr.send(PayloadKind::Data, "[]").await.unwrap();
        assert_eq!(receipt.attempts, 3);

        let stats = mgr.stats();
        assert_eq!(stats.mismatches, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 0);
    });
}

#[test]
fn test_every_attempt_corrupted_fails_with_integrity_error() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);
        link.corrupt_next_echoes(3);

        let err = mgr.send(PayloadKind::Log, "rows").await.unwrap_err();
        match err {
            Error::Transfer(TransferError::IntegrityFailure { kind, attempts }) => {
                assert_eq!(kind, PayloadKind::Log);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected integrity failure, got {}", other),
        }

        let stats = mgr.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.attempts, 3);
    });
}

#[test]
fn test_timeouts_consume_attempts() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);
        // Each attempt is two exchanges; six failures exhaust the session.
        link.fail_next_requests(6);

        let err = mgr.send(PayloadKind::Data, "[]").await.unwrap_err();
        assert!(err.is_comm());
        assert_eq!(mgr.stats().comm_errors, 3);
    });
}

#[test]
fn test_recovery_after_transient_timeouts() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);
        link.fail_next_requests(2);

        let receipt = mgr.send(PayloadKind::Log, "rows").await.unwrap();
        assert_eq!(receipt.attempts, 3);
        assert_eq!(mgr.stats().comm_errors, 2);
        assert_eq!(mgr.stats().successes, 1);
    });
}

/// A lost confirmation acknowledgement is indistinguishable from a lost
/// payload and costs a full attempt.
#[test]
fn test_lost_confirmation_ack_costs_an_attempt() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);

        // Attempt 1: the echo is correct but the confirmation is answered
        // with the wrong message.
        link.push_reply(Message::TransferReply {
            digest: Digest::from_bytes(b"rows"),
        });
        link.push_reply(Message::Pong {
            device_id: "server".to_string(),
        });

        let receipt = mgr.send(PayloadKind::Log, "rows").await.unwrap();
        assert_eq!(receipt.attempts, 2);
        assert_eq!(mgr.stats().comm_errors, 1);
    });
}

#[test]
fn test_sessions_and_stats_accumulate_across_payload_kinds() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);

        mgr.send(PayloadKind::Log, "device wp-0001").await.unwrap();
        mgr.send(PayloadKind::Data, "[{\"minute\":540,\"grams\":1500}]")
            .await
            .unwrap();

        let stats = mgr.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.attempts, 2);
        assert!(!mgr.is_busy(PayloadKind::Log));
        assert!(!mgr.is_busy(PayloadKind::Data));
    });
}

#[test]
fn test_empty_payload_is_a_valid_transfer() {
    smol::block_on(async {
        let link = Arc::new(MemoryLink::new());
        let mgr = manager(&link);

        let receipt = mgr.send(PayloadKind::Data, "").await.unwrap();
        assert_eq!(receipt.payload_bytes, 0);
        assert_eq!(receipt.digest, Digest::from_bytes(b""));
    });
}
