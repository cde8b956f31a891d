#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bikerig
//!
//! Device-control core for an exercise-bike test rig.
//!
//! A single UI thread drives a smart trainer over Bluetooth Low Energy
//! (Fitness Machine Service), a field-bus motor actuator and an optional
//! serial torque sensor. None of those calls may freeze the UI, so every
//! operation is handed to an execution bridge that runs it on a background
//! runtime and returns an [`OpHandle`] immediately.
//!
//! The pieces:
//!
//! - [`bridge`]: the background worker and the handles it returns
//! - [`session`]: connection lifecycle, control writes and telemetry for one
//!   fitness machine
//! - [`fanout`]: delivery of decoded telemetry to independent consumers
//! - [`sequencer`]: timed replay of command programs, cancellable at any time
//! - [`actuator`]: range-checked speed commands for the field-bus motor
//! - [`rig`]: the owning facade tying them together
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library moves physical equipment. The actuator guard
//! rejects speeds outside the configured bound, but a hardware emergency stop
//! must still be within reach of whoever is on the bike.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bikerig::{ble::BtleplugTransport, ControlCommand, Rig, RigConfig};
//! use std::{sync::Arc, time::Duration};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // the adapter's background tasks live on this runtime; keep it alive
//!     let radio_runtime = tokio::runtime::Runtime::new()?;
//!     let radio = radio_runtime.block_on(BtleplugTransport::new())?;
//!     let rig = Rig::builder(RigConfig::default(), Arc::new(radio)).start()?;
//!
//!     let found = rig.scan(Duration::from_secs(5)).await_result(None)?;
//!     if let Some(address) = found.keys().next() {
//!         rig.connect(address.clone()).await_result(None)?;
//!         rig.write(ControlCommand::PowerWatts(150)).await_result(None)?;
//!     }
//!
//!     rig.shutdown();
//!     Ok(())
//! }
//! ```

/// Field-bus actuator guard
pub mod actuator;
/// Bluetooth Low Energy transport on btleplug
pub mod ble;
pub mod bridge;
/// Rig configuration
pub mod config;
/// Error types and handling
pub mod error;
/// Telemetry fan-out to independent consumers
pub mod fanout;
pub mod program;
/// FTMS wire encoding and decoding
pub mod protocol;
/// Telemetry log files
pub mod recorder;
pub mod rig;
/// Serial torque sensor polling
pub mod sensor;
/// Timed replay of command programs
pub mod sequencer;
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use bridge::{Bridge, BridgeHandle, OpHandle};
pub use config::{ActuatorConfig, BridgeConfig, FieldBusEndpoint, RigConfig, SensorConfig, SessionConfig};
pub use error::{Result, RigError};
pub use fanout::{ConsumerId, TelemetryConsumer};
pub use rig::{Rig, RigBuilder};
pub use session::{BleTransport, DeviceSession};
pub use types::{
    ControlCommand, DeviceHandle, SequenceOutcome, SequenceStep, SessionState, TelemetryField,
    TelemetrySample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service UUID (0x1826)
///
/// Scans are filtered on this service; peripherals that do not advertise it
/// are never offered for connection.
pub const FTMS_SERVICE_UUID: &str = "00001826-0000-1000-8000-00805f9b34fb";

/// Indoor Bike Data characteristic UUID (0x2AD2)
///
/// Notifies speed, cadence, power, distance, resistance and elapsed time.
pub const INDOOR_BIKE_DATA_UUID: &str = "00002ad2-0000-1000-8000-00805f9b34fb";

/// Fitness Machine Control Point characteristic UUID (0x2AD9)
///
/// Written with response; the machine answers each write with an indication
/// carrying a result code.
pub const CONTROL_POINT_UUID: &str = "00002ad9-0000-1000-8000-00805f9b34fb";

/// Fitness Machine Status characteristic UUID (0x2ADA)
pub const MACHINE_STATUS_UUID: &str = "00002ada-0000-1000-8000-00805f9b34fb";
