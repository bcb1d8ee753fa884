//! Device Status Checks
//!
//! Probes the battery, the load cell, and both remote parties, and reports
//! what it found. The monitor only observes: acting on a finding (shipping
//! the log, flagging a communication problem) is the control loop's job.

use crate::error::Result;
use crate::network::{Message, ServerLink};
use crate::sensors::{reading_plausible, BatteryGauge, LoadCell};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// What a status probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Battery voltage below the operating floor
    LowBattery,
    /// Battery gauge would not produce a reading
    BatteryReadingProblem,
    /// Load cell absent, railed, or failing
    LoadCellReadingProblem,
    /// Collection server unreachable
    NetworkingProblem,
    /// Time server unreachable
    TimeServerProblem,
}

impl StatusCode {
    /// Critical findings get the log shipped without waiting for the next
    /// transmission slot. A drifting clock can wait; a dying battery cannot.
    pub fn is_critical(&self) -> bool {
        !matches!(self, StatusCode::TimeServerProblem)
    }

    /// Human-readable description used in log rows.
    pub fn describe(&self) -> &'static str {
        match self {
            StatusCode::LowBattery => "battery low",
            StatusCode::BatteryReadingProblem => "battery reading failed",
            StatusCode::LoadCellReadingProblem => "load cell reading failed",
            StatusCode::NetworkingProblem => "server unreachable",
            StatusCode::TimeServerProblem => "time server unreachable",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Outcome of one full status sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Problems found, in probe order
    pub findings: Vec<StatusCode>,
    /// Battery voltage, when the gauge answered
    pub battery_volts: Option<f32>,
    /// When the sweep ran
    pub checked_at: Timestamp,
}

impl StatusReport {
    pub fn all_clear(&self) -> bool {
        self.findings.is_empty()
    }

    /// `true` when any finding warrants shipping the log promptly.
    pub fn has_critical(&self) -> bool {
        self.findings.iter().any(|f| f.is_critical())
    }

    pub fn has(&self, code: StatusCode) -> bool {
        self.findings.contains(&code)
    }

    /// One-line summary for the device log.
    pub fn summary(&self) -> String {
        if self.findings.is_empty() {
            match self.battery_volts {
                Some(volts) => format!("status ok, battery {:.2}V", volts),
                None => "status ok".to_string(),
            }
        } else {
            let found: Vec<&str> = self.findings.iter().map(|f| f.describe()).collect();
            format!("status problems: {}", found.join(", "))
        }
    }
}

/// Runs the status probes.
pub struct StatusMonitor<L> {
    gauge: Arc<dyn BatteryGauge>,
    cell: Arc<dyn LoadCell>,
    link: Arc<L>,
    device_id: String,
    min_battery_volts: f32,
    probe_timeout: Duration,
}

impl<L: ServerLink> StatusMonitor<L> {
    pub fn new(
        gauge: Arc<dyn BatteryGauge>,
        cell: Arc<dyn LoadCell>,
        link: Arc<L>,
        device_id: String,
        min_battery_volts: f32,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            gauge,
            cell,
            link,
            device_id,
            min_battery_volts,
            probe_timeout,
        }
    }

    /// Run every probe and collect the findings. Never fails: a probe that
    /// errors becomes a finding instead.
    pub async fn run_checks(&self) -> StatusReport {
        let mut findings = Vec::new();

        let battery_volts = self.check_battery(&mut findings);
        self.check_load_cell(&mut findings);
        self.check_server(&mut findings).await;
        self.check_time_server(&mut findings).await;

        let report = StatusReport {
            findings,
            battery_volts,
            checked_at: Timestamp::now(),
        };
        if report.all_clear() {
            log::info!("{}", report.summary());
        } else {
            log::warn!("{}", report.summary());
        }
        report
    }

    /// Current battery voltage, straight from the gauge.
    pub fn read_battery_voltage(&self) -> Result<f32> {
        self.gauge.read_volts()
    }

    fn check_battery(&self, findings: &mut Vec<StatusCode>) -> Option<f32> {
        match self.read_battery_voltage() {
            Ok(volts) => {
                if volts < self.min_battery_volts {
                    log::warn!(
                        "battery at {:.2}V, floor is {:.2}V",
                        volts,
                        self.min_battery_volts
                    );
                    findings.push(StatusCode::LowBattery);
                }
                Some(volts)
            }
            Err(e) => {
                log::warn!("battery probe failed: {}", e);
                findings.push(StatusCode::BatteryReadingProblem);
                None
            }
        }
    }

    /// Probe the load cell and judge the reading.
    pub fn sensors_plausible(&self) -> Result<()> {
        if !self.cell.is_ready() {
            return Err(crate::error::StatusError::ProbeFailed {
                probe: "load-cell".to_string(),
                reason: "not ready".to_string(),
            }
            .into());
        }
        let raw = self.cell.read_raw()?;
        if !reading_plausible(raw) {
            return Err(crate::error::StatusError::SensorImplausible {
                reason: format!("load cell railed at {}", raw),
            }
            .into());
        }
        Ok(())
    }

    fn check_load_cell(&self, findings: &mut Vec<StatusCode>) {
        if let Err(e) = self.sensors_plausible() {
            log::warn!("load cell probe failed: {}", e);
            findings.push(StatusCode::LoadCellReadingProblem);
        }
    }

    async fn check_server(&self, findings: &mut Vec<StatusCode>) {
        match self.ping_server().await {
            Ok(()) => {}
            Err(e) => {
                log::warn!("server probe failed: {}", e);
                findings.push(StatusCode::NetworkingProblem);
            }
        }
    }

    async fn check_time_server(&self, findings: &mut Vec<StatusCode>) {
        if let Err(e) = self.ping_time_server().await {
            log::warn!("time server probe failed: {}", e);
            findings.push(StatusCode::TimeServerProblem);
        }
    }

    /// Ask the time server for the time and discard the answer.
    pub async fn ping_time_server(&self) -> Result<()> {
        match self
            .link
            .time_request(&Message::TimeRequest, self.probe_timeout)
            .await?
        {
            Message::TimeReply { .. } => Ok(()),
            other => Err(crate::error::NetworkError::UnexpectedReply {
                expected: "time-reply".to_string(),
                got: other.name().to_string(),
            }
            .into()),
        }
    }

    /// Round-trip a ping to the collection server.
    pub async fn ping_server(&self) -> Result<()> {
        let ping = Message::Ping {
            device_id: self.device_id.clone(),
        };
        match self.link.request(&ping, self.probe_timeout).await? {
            Message::Pong { .. } => Ok(()),
            other => Err(crate::error::NetworkError::UnexpectedReply {
                expected: "pong".to_string(),
                got: other.name().to_string(),
            }
            .into()),
        }
    }
}
