use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::{Result, RigError},
    types::{ACTUATOR_MAX_KMH, ACTUATOR_MIN_KMH},
};

/// Device session timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Control point write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Extra time a scan may take beyond its requested window
    pub scan_overrun_grace_ms: u64,
    /// Disconnect timeout in milliseconds
    pub disconnect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            write_timeout_ms: 3_000,
            scan_overrun_grace_ms: 2_000,
            disconnect_timeout_ms: 5_000,
        }
    }
}

/// Execution bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long shutdown waits for in-flight operations before aborting them
    pub shutdown_grace_ms: u64,
    /// Name of the worker thread
    pub thread_name: String,
}

impl BridgeConfig {
    /// Shutdown grace period as a [`Duration`]
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 2_000,
            thread_name: "rig-bridge".to_string(),
        }
    }
}

/// Actuator guard bound and scaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Lowest accepted speed in km/h
    pub min_kmh: f64,
    /// Highest accepted speed in km/h
    pub max_kmh: f64,
    /// Multiplier applied before rounding to the field-bus integer
    pub scale: f64,
    /// Field-bus write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl ActuatorConfig {
    /// Check that the bound is a finite, non-empty interval
    ///
    /// # Errors
    ///
    /// Returns [`RigError::OutOfRange`] describing the offending bound.
    pub fn validate(&self) -> Result<()> {
        if !self.min_kmh.is_finite() || !self.max_kmh.is_finite() || self.min_kmh > self.max_kmh {
            return Err(RigError::OutOfRange {
                value: self.max_kmh,
                min: self.min_kmh,
                max: self.max_kmh,
            });
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(RigError::OutOfRange {
                value: self.scale,
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
            });
        }
        Ok(())
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            min_kmh: ACTUATOR_MIN_KMH,
            max_kmh: ACTUATOR_MAX_KMH,
            scale: 100.0,
            write_timeout_ms: 2_000,
        }
    }
}

/// Address of the field-bus motor controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldBusEndpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Default for FieldBusEndpoint {
    fn default() -> Self {
        Self {
            host: "192.168.0.10".to_string(),
            port: 502,
        }
    }
}

/// Serial torque sensor access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Serial port the sensor is attached to
    pub port: String,
    /// Upper bound for one open, close or read call in milliseconds
    pub io_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            io_timeout_ms: 1_000,
        }
    }
}

/// Complete rig configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Device session timing
    pub session: SessionConfig,
    /// Execution bridge settings
    pub bridge: BridgeConfig,
    /// Actuator guard bound and scaling
    pub actuator: ActuatorConfig,
    /// Field-bus motor controller address
    pub field_bus: FieldBusEndpoint,
    /// Serial torque sensor access
    pub sensor: SensorConfig,
}
