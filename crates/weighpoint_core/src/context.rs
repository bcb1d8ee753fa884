//! Shared device status flags.
//!
//! `DeviceContext` holds the four boolean facts every part of the control
//! core may consult: whether the device is active, whether provisioning
//! completed, whether an identity is assigned, and whether the last
//! communication attempt failed. Each flag is an independent atomic; readers
//! get the current value of that one flag, with no cross-flag snapshot.

use std::sync::atomic::{AtomicBool, Ordering};

/// The device's shared status flags.
///
/// Producers and handlers on different tasks read and write these flags
/// concurrently, so every access is a `SeqCst` atomic operation on a single
/// flag.
#[derive(Debug, Default)]
pub struct DeviceContext {
    is_active: AtomicBool,
    is_setup_complete: AtomicBool,
    has_identity: AtomicBool,
    has_comm_problem: AtomicBool,
}

impl DeviceContext {
    /// Create a context with all flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while the device is measuring and transmitting.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, value: bool) {
        self.is_active.store(value, Ordering::SeqCst);
    }

    /// `true` once provisioning has completed.
    pub fn is_setup_complete(&self) -> bool {
        self.is_setup_complete.load(Ordering::SeqCst)
    }

    pub fn set_setup_complete(&self, value: bool) {
        self.is_setup_complete.store(value, Ordering::SeqCst);
    }

    /// `true` once the device has a server-assigned identity.
    pub fn has_identity(&self) -> bool {
        self.has_identity.load(Ordering::SeqCst)
    }

    pub fn set_has_identity(&self, value: bool) {
        self.has_identity.store(value, Ordering::SeqCst);
    }

    /// `true` after a communication failure, until a transmission succeeds.
    pub fn has_comm_problem(&self) -> bool {
        self.has_comm_problem.load(Ordering::SeqCst)
    }

    pub fn set_comm_problem(&self, value: bool) {
        self.has_comm_problem.store(value, Ordering::SeqCst);
    }

    /// Render the flags for a log line. Each flag is read independently.
    pub fn describe(&self) -> String {
        format!(
            "active={} setup={} identity={} comm_problem={}",
            self.is_active(),
            self.is_setup_complete(),
            self.has_identity(),
            self.has_comm_problem()
        )
    }
}
