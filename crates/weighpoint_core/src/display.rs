//! Operator indications.
//!
//! The control core never drives an LED or a serial port directly. It emits
//! [`PatternId`] values and message strings through a [`DisplaySink`]; the
//! sink decides how to render them based on the configured [`DisplayMode`].
//! Patterns are Morse-derived blink sequences defined in a data table, so a
//! hardware sink can replay them without knowing what they mean.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A short blink, in milliseconds.
const DOT_MS: u64 = 200;
/// A long blink, in milliseconds.
const DASH_MS: u64 = 600;
/// Dark time between blinks of one pattern, in milliseconds.
const GAP_MS: u64 = 200;

/// One LED pulse: on for `on_ms`, then dark for `off_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub on_ms: u64,
    pub off_ms: u64,
}

const fn dot() -> Pulse {
    Pulse {
        on_ms: DOT_MS,
        off_ms: GAP_MS,
    }
}

const fn dash() -> Pulse {
    Pulse {
        on_ms: DASH_MS,
        off_ms: GAP_MS,
    }
}

/// Identifies an operator indication.
///
/// Each identifier maps to a fixed pulse sequence; the sequences are distinct
/// enough to tell apart on a single LED from across a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternId {
    /// Slow lighthouse blink while provisioning runs.
    RunningSetup,
    /// Dot-dash, three times.
    RunningActivation,
    /// A single dash.
    CheckingDeviceStatus,
    /// Dash-dot-dash.
    RunningCalibration,
    /// Two quick dots acknowledging a button press.
    ButtonPressed,
    /// Three spaced dashes while a transmission is in flight.
    ProcessOut,
    /// Three quick dots: the last operation succeeded.
    Good,
    /// Three seconds of constant light: operator attention required.
    MajorError,
}

impl PatternId {
    /// The pulse sequence for this pattern.
    pub fn pulses(&self) -> &'static [Pulse] {
        const RUNNING_SETUP: &[Pulse] = &[Pulse {
            on_ms: 500,
            off_ms: 2500,
        }];
        const RUNNING_ACTIVATION: &[Pulse] = &[dot(), dash(), dot(), dash(), dot(), dash()];
        const CHECKING_STATUS: &[Pulse] = &[dash()];
        const RUNNING_CALIBRATION: &[Pulse] = &[dash(), dot(), dash()];
        const BUTTON_PRESSED: &[Pulse] = &[dot(), dot()];
        const PROCESS_OUT: &[Pulse] = &[
            Pulse {
                on_ms: DASH_MS,
                off_ms: 600,
            },
            Pulse {
                on_ms: DASH_MS,
                off_ms: 600,
            },
            Pulse {
                on_ms: DASH_MS,
                off_ms: 600,
            },
        ];
        const GOOD: &[Pulse] = &[dot(), dot(), dot()];
        const MAJOR_ERROR: &[Pulse] = &[Pulse {
            on_ms: 3000,
            off_ms: 0,
        }];

        match self {
            PatternId::RunningSetup => RUNNING_SETUP,
            PatternId::RunningActivation => RUNNING_ACTIVATION,
            PatternId::CheckingDeviceStatus => CHECKING_STATUS,
            PatternId::RunningCalibration => RUNNING_CALIBRATION,
            PatternId::ButtonPressed => BUTTON_PRESSED,
            PatternId::ProcessOut => PROCESS_OUT,
            PatternId::Good => GOOD,
            PatternId::MajorError => MAJOR_ERROR,
        }
    }

    /// Time to replay the full sequence once.
    pub fn total_duration(&self) -> Duration {
        let ms: u64 = self.pulses().iter().map(|p| p.on_ms + p.off_ms).sum();
        Duration::from_millis(ms)
    }

    /// Human-readable name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            PatternId::RunningSetup => "running-setup",
            PatternId::RunningActivation => "running-activation",
            PatternId::CheckingDeviceStatus => "checking-device-status",
            PatternId::RunningCalibration => "running-calibration",
            PatternId::ButtonPressed => "button-pressed",
            PatternId::ProcessOut => "process-out",
            PatternId::Good => "good",
            PatternId::MajorError => "major-error",
        }
    }
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where operator indications are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Messages to the attached host only; the LED stays dark.
    ComputerOnly,
    /// LED patterns only; nothing is written to the host.
    LedOnly,
    /// Both channels.
    Both,
}

impl DisplayMode {
    /// `true` if messages go to the attached host.
    pub fn uses_computer(&self) -> bool {
        matches!(self, DisplayMode::ComputerOnly | DisplayMode::Both)
    }

    /// `true` if patterns go to the LED.
    pub fn uses_led(&self) -> bool {
        matches!(self, DisplayMode::LedOnly | DisplayMode::Both)
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayMode::ComputerOnly => write!(f, "computer-only"),
            DisplayMode::LedOnly => write!(f, "led-only"),
            DisplayMode::Both => write!(f, "both"),
        }
    }
}

/// Renders operator indications.
///
/// Implementations must not block the dispatch loop; rendering a pattern
/// means handing it to whatever drives the LED, not replaying it inline.
pub trait DisplaySink: Send + Sync {
    /// Show a blink pattern.
    fn show_pattern(&self, pattern: PatternId);

    /// Show a message on the host channel.
    fn show_message(&self, message: &str);
}

/// A sink that renders through the logging facade.
///
/// Patterns become debug lines, messages become info lines; the configured
/// [`DisplayMode`] decides which channel is live.
pub struct LogDisplay {
    mode: DisplayMode,
}

impl LogDisplay {
    pub fn new(mode: DisplayMode) -> Self {
        Self { mode }
    }
}

impl DisplaySink for LogDisplay {
    fn show_pattern(&self, pattern: PatternId) {
        if self.mode.uses_led() {
            log::debug!("[led] {} ({:?})", pattern, pattern.total_duration());
        }
    }

    fn show_message(&self, message: &str) {
        if self.mode.uses_computer() {
            log::info!("[display] {}", message);
        }
    }
}

/// A sink that records everything it is shown. For tests.
#[derive(Default)]
pub struct RecordingDisplay {
    patterns: std::sync::Mutex<Vec<PatternId>>,
    messages: std::sync::Mutex<Vec<String>>,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patterns shown so far, oldest first.
    pub fn patterns(&self) -> Vec<PatternId> {
        self.patterns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Messages shown so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl DisplaySink for RecordingDisplay {
    fn show_pattern(&self, pattern: PatternId) {
        self.patterns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(pattern);
    }

    fn show_message(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.to_string());
    }
}
