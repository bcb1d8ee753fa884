//! Core data types for the Weighpoint control core.
//!
//! This module defines the fundamental types used throughout the
//! weighpoint_core crate: the event vocabulary of the control loop, the
//! integrity digest used by the transfer protocol, and the small domain
//! scalars (minutes of day, weight records, transmission schedules).
//!
//! # Core Types
//!
//! - [`Event`] / [`EventKind`] - prioritized units of work routed through the control loop
//! - [`Digest`] - Blake3 integrity code over transfer payloads
//! - [`MinuteOfDay`] - validated time-of-day with minute resolution
//! - [`TxSchedule`] - the two configured daily transmission times
//! - [`Record`] - one load-cell reading (minute of day + integer grams)
//! - [`Timestamp`] - microsecond UTC timestamps for log rows and notices

use serde::{Deserialize, Serialize};

/// Most urgent tier, reserved for lifecycle resequencing
/// (the Deactivate/Setup/Activate chain).
pub const PRIORITY_IMMEDIATE: u8 = 0;

/// Urgent follow-up work: post-activation ChangeTxTimes/Calibrate and
/// SendLog escalations.
pub const PRIORITY_URGENT: u8 = 1;

/// Routine work produced by the scheduler (status checks, transmissions,
/// clock sync).
pub const PRIORITY_ROUTINE: u8 = 2;

/// The kinds of work the control loop knows how to dispatch.
///
/// Every external stimulus (button press, server directive, scheduler
/// deadline) is mapped onto exactly one of these kinds before it enters the
/// event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Provision the device: identity, endpoints, clock, plate weight.
    Setup,
    /// Announce the device to the server and begin measuring/transmitting.
    Activate,
    /// Announce shutdown of measurement, flush log and data to the server.
    Deactivate,
    /// Run the critical/non-critical status checks.
    CheckStatus,
    /// Calibrate the load cell against the server-provided plate weight.
    Calibrate,
    /// Fetch the two daily transmission times and reschedule.
    ChangeTxTimes,
    /// Ship the log file to the server.
    SendLog,
    /// Ship the measurement table to the server.
    SendData,
    /// Synchronize the device clock against the time server.
    CalibrateClock,
}

impl EventKind {
    /// Human-readable name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Setup => "setup",
            EventKind::Activate => "activate",
            EventKind::Deactivate => "deactivate",
            EventKind::CheckStatus => "check-status",
            EventKind::Calibrate => "calibrate",
            EventKind::ChangeTxTimes => "change-tx-times",
            EventKind::SendLog => "send-log",
            EventKind::SendData => "send-data",
            EventKind::CalibrateClock => "calibrate-clock",
        }
    }

    /// All event kinds, in dispatch-table order.
    pub fn all() -> [EventKind; 9] {
        [
            EventKind::Setup,
            EventKind::Activate,
            EventKind::Deactivate,
            EventKind::CheckStatus,
            EventKind::Calibrate,
            EventKind::ChangeTxTimes,
            EventKind::SendLog,
            EventKind::SendData,
            EventKind::CalibrateClock,
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A typed, prioritized unit of work.
///
/// Events are immutable once created: a producer builds one, the queue owns
/// it until dequeued, and the handler invocation owns it for its duration.
/// Lower `priority` values dequeue first; ties preserve insertion order.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::{Event, EventKind, PRIORITY_URGENT};
/// let ev = Event::urgent(EventKind::SendLog);
/// assert_eq!(ev.priority, PRIORITY_URGENT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// What should be done.
    pub kind: EventKind,
    /// Urgency tier; 0 is most urgent.
    pub priority: u8,
}

impl Event {
    /// Create an event with an explicit priority.
    pub fn new(kind: EventKind, priority: u8) -> Self {
        Self { kind, priority }
    }

    /// Create an event at [`PRIORITY_IMMEDIATE`].
    pub fn immediate(kind: EventKind) -> Self {
        Self::new(kind, PRIORITY_IMMEDIATE)
    }

    /// Create an event at [`PRIORITY_URGENT`].
    pub fn urgent(kind: EventKind) -> Self {
        Self::new(kind, PRIORITY_URGENT)
    }

    /// Create an event at [`PRIORITY_ROUTINE`].
    pub fn routine(kind: EventKind) -> Self {
        Self::new(kind, PRIORITY_ROUTINE)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(p{})", self.kind, self.priority)
    }
}

/// A 32-byte Blake3 digest used as the transfer integrity code.
///
/// The device computes a digest over each outgoing payload; the server
/// echoes the digest it computed over what it received, and the two are
/// compared to detect corruption in transit.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::Digest;
/// let digest = Digest::from_bytes(b"log file contents");
/// let hex = digest.to_hex();
/// assert_eq!(hex.len(), 64);
/// assert_eq!(Digest::from_hex(&hex).unwrap(), digest);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Computes the Blake3 digest of the given payload.
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let hash = blake3::hash(bytes);
        Self(*hash.as_bytes())
    }

    /// Wraps existing digest bytes without hashing. Short input is
    /// zero-padded.
    #[inline]
    pub fn from_raw(bytes: &[u8]) -> Self {
        let mut arr = [0u8; 32];
        let len = std::cmp::min(bytes.len(), 32);
        arr[..len].copy_from_slice(&bytes[..len]);
        Self(arr)
    }

    /// Returns the raw byte representation.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the full hexadecimal representation (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a digest from its hexadecimal representation.
    ///
    /// # Errors
    ///
    /// Fails if the string is not valid hex or does not decode to exactly
    /// 32 bytes.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

/// A time of day with minute resolution, `0` (= 00:00) to `1439` (= 23:59).
///
/// Used for the two configured daily transmission times and for the `HHmm`
/// stamps on log rows and records. Always UTC+0, no daylight saving; the
/// server adjusts times for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinuteOfDay(u16);

/// Minutes in a full day; one past the largest valid [`MinuteOfDay`].
pub const MINUTES_PER_DAY: u16 = 1440;

impl MinuteOfDay {
    /// The first minute of the day, 00:00.
    pub const MIDNIGHT: MinuteOfDay = MinuteOfDay(0);

    /// Creates a validated minute-of-day. Returns `None` for values over
    /// 1439.
    pub fn new(minute: u16) -> Option<Self> {
        if minute < MINUTES_PER_DAY {
            Some(Self(minute))
        } else {
            None
        }
    }

    /// Creates a minute-of-day from an hour/minute pair.
    pub fn from_hm(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour as u16 * 60 + minute as u16))
        } else {
            None
        }
    }

    /// The raw minute count since midnight.
    #[inline]
    pub fn get(&self) -> u16 {
        self.0
    }

    /// The hour component, 0-23.
    pub fn hour(&self) -> u8 {
        (self.0 / 60) as u8
    }

    /// The minute component, 0-59.
    pub fn minute(&self) -> u8 {
        (self.0 % 60) as u8
    }

    /// Compact `HHmm` form used for log stamps, e.g. `0930`.
    pub fn hhmm(&self) -> String {
        format!("{:02}{:02}", self.hour(), self.minute())
    }

    /// Minutes from `now` until the next occurrence of this time of day.
    ///
    /// Never returns zero: if `now` equals the target, the next occurrence
    /// is a full day away. This is what keeps a fired transmission deadline
    /// strictly in the future after recomputation.
    pub fn minutes_until(&self, now: MinuteOfDay) -> u16 {
        if self.0 > now.0 {
            self.0 - now.0
        } else {
            MINUTES_PER_DAY - now.0 + self.0
        }
    }
}

impl std::fmt::Display for MinuteOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// The two configured daily transmission times.
///
/// Mutated only by the ChangeTxTimes handler and persisted under the
/// `tx-morning` / `tx-evening` keys; the scheduler reads it when recomputing
/// transmission deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSchedule {
    /// First transmission of the day.
    pub morning: MinuteOfDay,
    /// Second transmission of the day.
    pub evening: MinuteOfDay,
}

impl TxSchedule {
    /// Builds a schedule from two validated times.
    pub fn new(morning: MinuteOfDay, evening: MinuteOfDay) -> Self {
        Self { morning, evening }
    }
}

impl Default for TxSchedule {
    fn default() -> Self {
        // 07:00 and 19:00 until the server assigns real slots.
        Self {
            morning: MinuteOfDay::from_hm(7, 0).unwrap(),
            evening: MinuteOfDay::from_hm(19, 0).unwrap(),
        }
    }
}

impl std::fmt::Display for TxSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.morning, self.evening)
    }
}

/// One load-cell reading: when it was taken and what it weighed.
///
/// Weight is integer grams in `u16` (0 to 65,535 g); time is minute-of-day
/// resolution. The data table holds these between transmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Minute of day the reading was taken.
    pub minute: MinuteOfDay,
    /// Measured weight in integer grams.
    pub grams: u16,
}

impl Record {
    /// Creates a record.
    pub fn new(minute: MinuteOfDay, grams: u16) -> Self {
        Self { minute, grams }
    }
}

/// The two payload kinds the transfer protocol ships to the server.
///
/// At most one transfer session may be in flight per kind at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// The device log file.
    Log,
    /// The measurement data table.
    Data,
}

impl PayloadKind {
    /// Human-readable name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            PayloadKind::Log => "log",
            PayloadKind::Data => "data",
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A microsecond-precision UTC timestamp.
///
/// Used for lifecycle notices on the wire and for ordering log entries.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::Timestamp;
/// let ts = Timestamp::from_millis(1_000_000);
/// assert_eq!(ts.as_millis(), 1_000_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The current UTC time with microsecond precision.
    #[inline]
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        let micros = (now.timestamp() as u64) * 1_000_000 + (now.timestamp_subsec_micros() as u64);
        Self(micros)
    }

    /// Creates a `Timestamp` from milliseconds since the Unix epoch.
    #[inline]
    pub fn from_millis(ms: u64) -> Self {
        Self(ms * 1000)
    }

    /// The timestamp as milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// RFC 3339 rendering for wire messages and operator output.
    pub fn to_rfc3339(&self) -> String {
        let secs = (self.0 / 1_000_000) as i64;
        let micros = (self.0 % 1_000_000) as u32;
        match chrono::DateTime::from_timestamp(secs, micros * 1000) {
            Some(dt) => dt.to_rfc3339(),
            None => format!("{}us", self.0),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_names_unique() {
        let kinds = EventKind::all();
        for (i, a) in kinds.iter().enumerate() {
            for b in kinds.iter().skip(i + 1) {
                assert_ne!(a.name(), b.name());
            }
        }
    }

    #[test]
    fn test_event_constructors() {
        assert_eq!(Event::immediate(EventKind::Setup).priority, 0);
        assert_eq!(Event::urgent(EventKind::SendLog).priority, 1);
        assert_eq!(Event::routine(EventKind::CheckStatus).priority, 2);
        let ev = Event::new(EventKind::SendData, 7);
        assert_eq!(ev.kind, EventKind::SendData);
        assert_eq!(ev.priority, 7);
    }

    #[test]
    fn test_event_display() {
        let ev = Event::urgent(EventKind::SendLog);
        assert_eq!(format!("{}", ev), "send-log(p1)");
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let ev = Event::routine(EventKind::CalibrateClock);
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn test_digest_deterministic() {
        let a = Digest::from_bytes(b"payload");
        let b = Digest::from_bytes(b"payload");
        let c = Digest::from_bytes(b"payload!");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let digest = Digest::from_bytes(b"some data");
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Digest::from_hex(&hex).unwrap(), digest);
    }

    #[test]
    fn test_digest_from_hex_rejects_bad_length() {
        assert!(Digest::from_hex("abcd").is_err());
        assert!(Digest::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_digest_from_raw_pads() {
        let digest = Digest::from_raw(&[1, 2, 3]);
        assert_eq!(digest.as_bytes()[0], 1);
        assert_eq!(digest.as_bytes()[3], 0);
        assert_eq!(digest.as_bytes()[31], 0);
    }

    #[test]
    fn test_digest_serializes_as_hex_string() {
        let digest = Digest::from_bytes(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert!(json.starts_with('"'));
        assert_eq!(json.len(), 66); // 64 hex chars + quotes
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn test_digest_display_is_short() {
        let digest = Digest::from_bytes(b"x");
        assert_eq!(format!("{}", digest).len(), 8);
    }

    #[test]
    fn test_minute_of_day_bounds() {
        assert!(MinuteOfDay::new(0).is_some());
        assert!(MinuteOfDay::new(1439).is_some());
        assert!(MinuteOfDay::new(1440).is_none());
        assert!(MinuteOfDay::from_hm(23, 59).is_some());
        assert!(MinuteOfDay::from_hm(24, 0).is_none());
        assert!(MinuteOfDay::from_hm(12, 60).is_none());
    }

    #[test]
    fn test_minute_of_day_components() {
        let m = MinuteOfDay::from_hm(9, 30).unwrap();
        assert_eq!(m.get(), 570);
        assert_eq!(m.hour(), 9);
        assert_eq!(m.minute(), 30);
        assert_eq!(m.hhmm(), "0930");
        assert_eq!(format!("{}", m), "09:30");
    }

    #[test]
    fn test_minutes_until_future_today() {
        let now = MinuteOfDay::from_hm(8, 0).unwrap();
        let target = MinuteOfDay::from_hm(19, 0).unwrap();
        assert_eq!(target.minutes_until(now), 11 * 60);
    }

    #[test]
    fn test_minutes_until_wraps_to_tomorrow() {
        let now = MinuteOfDay::from_hm(20, 0).unwrap();
        let target = MinuteOfDay::from_hm(7, 0).unwrap();
        assert_eq!(target.minutes_until(now), 11 * 60);
    }

    #[test]
    fn test_minutes_until_same_minute_is_full_day() {
        let now = MinuteOfDay::from_hm(12, 0).unwrap();
        assert_eq!(now.minutes_until(now), MINUTES_PER_DAY);
    }

    #[test]
    fn test_tx_schedule_default() {
        let s = TxSchedule::default();
        assert_eq!(s.morning.hhmm(), "0700");
        assert_eq!(s.evening.hhmm(), "1900");
    }

    #[test]
    fn test_tx_schedule_serde_roundtrip() {
        let s = TxSchedule::new(
            MinuteOfDay::from_hm(6, 15).unwrap(),
            MinuteOfDay::from_hm(21, 45).unwrap(),
        );
        let json = serde_json::to_string(&s).unwrap();
        let back: TxSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let r = Record::new(MinuteOfDay::from_hm(14, 7).unwrap(), 2430);
        let json = serde_json::to_string(&r).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }

    #[test]
    fn test_timestamp_now_advances() {
        let a = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Timestamp::now();
        assert!(b > a);
    }

    #[test]
    fn test_timestamp_millis_roundtrip() {
        let ts = Timestamp::from_millis(1_609_459_200_000);
        assert_eq!(ts.as_millis(), 1_609_459_200_000);
    }

    #[test]
    fn test_timestamp_rfc3339() {
        let ts = Timestamp::from_millis(0);
        assert!(ts.to_rfc3339().starts_with("1970-01-01"));
    }
}
