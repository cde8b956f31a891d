use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration, time::SystemTime};

use crate::error::{Result, RigError};

/// Lower bound of the actuator speed interval in km/h
pub const ACTUATOR_MIN_KMH: f64 = 0.0;

/// Upper bound of the actuator speed interval in km/h
pub const ACTUATOR_MAX_KMH: f64 = 80.0;

/// Highest value accepted by [`ControlCommand::Percentage`]
pub const PERCENTAGE_MAX: u8 = 200;

/// Longest delay a sequence step may declare, in seconds (one day)
pub const MAX_STEP_DELAY_SECS: i64 = 86_400;

/// Peripherals at or above this RSSI are reported as having a strong signal.
///
/// RSSI is negative dBm: values closer to zero are stronger.
pub const STRONG_SIGNAL_RSSI_DBM: i16 = -50;

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Platform address of the peripheral
    pub address: String,
    /// Advertised local name
    pub name: String,
    /// Signal strength when last seen, if the adapter reported one
    pub rssi: Option<i16>,
}

impl DeviceHandle {
    /// Create a new device handle
    #[must_use]
    pub fn new(address: impl Into<String>, name: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            rssi,
        }
    }

    /// Whether the last-seen RSSI is at or above [`STRONG_SIGNAL_RSSI_DBM`]
    #[must_use]
    pub fn has_strong_signal(&self) -> bool {
        self.rssi.is_some_and(|rssi| rssi >= STRONG_SIGNAL_RSSI_DBM)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rssi {
            Some(rssi) => write!(f, "{} - {} - RSSI: {rssi}", self.name, self.address),
            None => write!(f, "{} - {}", self.name, self.address),
        }
    }
}

/// Connection lifecycle of the device session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link (initial state)
    Disconnected,
    /// Scan in progress
    Scanning,
    /// Link establishment in progress
    Connecting,
    /// Link established, no telemetry subscription
    Connected,
    /// Link established and telemetry notifications flowing
    Streaming,
    /// Teardown in progress
    Disconnecting,
    /// The last connect attempt or the link failed
    Failed(String),
}

impl SessionState {
    /// Whether a link to the peripheral is up
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }

    /// Whether a new scan or connect may start from this state
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed(reason) => write!(f, "Failed ({reason})"),
        }
    }
}

/// Named numeric fields a telemetry notification may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TelemetryField {
    /// Instantaneous speed in km/h
    Speed,
    /// Instantaneous cadence in rpm
    Cadence,
    /// Instantaneous power in watts
    Power,
    /// Resistance level (unitless)
    Resistance,
    /// Total distance in metres
    TotalDistance,
    /// Elapsed time in seconds
    ElapsedTime,
    /// Heart rate in bpm
    HeartRate,
    /// Total expended energy in kcal
    TotalEnergy,
}

impl TelemetryField {
    /// All fields, in display order
    pub const ALL: [Self; 8] = [
        Self::Speed,
        Self::Cadence,
        Self::Power,
        Self::Resistance,
        Self::TotalDistance,
        Self::ElapsedTime,
        Self::HeartRate,
        Self::TotalEnergy,
    ];

    /// Snake-case name used in logs and recorded files
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Cadence => "cadence",
            Self::Power => "power",
            Self::Resistance => "resistance",
            Self::TotalDistance => "total_distance",
            Self::ElapsedTime => "elapsed_time",
            Self::HeartRate => "heart_rate",
            Self::TotalEnergy => "total_energy",
        }
    }
}

impl fmt::Display for TelemetryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded notification.
///
/// A field that is absent was not reported in this update; it is not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    fields: BTreeMap<TelemetryField, f64>,
    /// When the notification was decoded
    pub received_at: SystemTime,
}

impl TelemetrySample {
    /// Create an empty sample stamped with the current time
    #[must_use]
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            received_at: SystemTime::now(),
        }
    }

    /// Builder-style setter
    #[must_use]
    pub fn with(mut self, field: TelemetryField, value: f64) -> Self {
        self.set(field, value);
        self
    }

    /// Record a reported value
    pub fn set(&mut self, field: TelemetryField, value: f64) {
        self.fields.insert(field, value);
    }

    /// Reported value, or `None` if the field was not part of this update
    #[must_use]
    pub fn get(&self, field: TelemetryField) -> Option<f64> {
        self.fields.get(&field).copied()
    }

    /// Whether no field was reported
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reported fields in [`TelemetryField`] order
    pub fn iter(&self) -> impl Iterator<Item = (TelemetryField, f64)> + '_ {
        self.fields.iter().map(|(field, value)| (*field, *value))
    }
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self::new()
    }
}

/// Resistance-control command written to the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Resistance level, 0 to [`PERCENTAGE_MAX`]
    Percentage(u8),
    /// Target power in watts
    PowerWatts(i32),
    /// Simulated grade in percent
    SimulationGrade(i32),
}

impl ControlCommand {
    /// Check the command's value against its permitted range
    ///
    /// # Errors
    ///
    /// Returns [`RigError::OutOfRange`] if the value cannot be sent.
    #[allow(clippy::cast_precision_loss)]
    pub fn validate(&self) -> Result<()> {
        let (value, min, max) = match *self {
            Self::Percentage(level) => (i64::from(level), 0, i64::from(PERCENTAGE_MAX)),
            Self::PowerWatts(watts) => (i64::from(watts), i64::from(i16::MIN), i64::from(i16::MAX)),
            // grade is sent in hundredths of a percent as a signed 16-bit value
            Self::SimulationGrade(grade) => (i64::from(grade), -327, 327),
        };

        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(RigError::OutOfRange {
                value: value as f64,
                min: min as f64,
                max: max as f64,
            })
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percentage(level) => write!(f, "level {level}/{PERCENTAGE_MAX}"),
            Self::PowerWatts(watts) => write!(f, "power {watts}W"),
            Self::SimulationGrade(grade) => write!(f, "simulation {grade}%"),
        }
    }
}

/// One entry of an automated command sequence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    /// Command written when the step fires
    pub command: ControlCommand,
    /// Seconds until the next step fires; must not be negative
    pub delay_secs: i64,
    /// Optional actuator speed in km/h forwarded through the actuator guard
    pub actuator_speed_kmh: Option<f64>,
}

impl SequenceStep {
    /// Create a new step
    #[must_use]
    pub fn new(command: ControlCommand, delay_secs: u32, actuator_speed_kmh: Option<f64>) -> Self {
        Self {
            command,
            delay_secs: i64::from(delay_secs),
            actuator_speed_kmh,
        }
    }

    /// Time until the next step
    ///
    /// # Errors
    ///
    /// Returns [`RigError::InvalidStep`] if the delay is negative or longer
    /// than [`MAX_STEP_DELAY_SECS`].
    pub fn delay(&self) -> Result<Duration> {
        if self.delay_secs > MAX_STEP_DELAY_SECS {
            return Err(RigError::InvalidStep(format!(
                "delay {}s exceeds {MAX_STEP_DELAY_SECS}s",
                self.delay_secs
            )));
        }
        u64::try_from(self.delay_secs)
            .map(Duration::from_secs)
            .map_err(|_| RigError::InvalidStep(format!("negative delay {}s", self.delay_secs)))
    }
}

/// How the last sequence run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceOutcome {
    /// Every step fired and the final delay elapsed
    Completed,
    /// `stop()` was called
    Stopped,
    /// The run was aborted
    Failed(String),
}
