use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    bridge::{millis, run_blocking, BridgeHandle, OpHandle},
    config::SensorConfig,
    error::{Result, RigError},
};

/// Blocking reader for the serial torque sensor
pub trait SerialSensor: Send + Sync {
    /// Open the serial port; `false` if it could not be opened
    fn open_connection(&self, port: &str) -> bool;

    /// Close the serial port; `false` if it was not closed cleanly
    fn close_connection(&self) -> bool;

    /// Whether the port is open
    fn is_connected(&self) -> bool;

    /// Read the latest values, keyed by channel name
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_data(&self) -> Result<BTreeMap<String, f64>>;
}

/// Runs sensor calls on helper threads with a time bound
pub struct SensorPoller {
    bridge: BridgeHandle,
    sensor: Arc<dyn SerialSensor>,
    config: SensorConfig,
}

impl SensorPoller {
    /// Create a poller for `sensor`
    #[must_use]
    pub fn new(bridge: BridgeHandle, sensor: Arc<dyn SerialSensor>, config: SensorConfig) -> Self {
        Self {
            bridge,
            sensor,
            config,
        }
    }

    /// Open the configured port
    pub fn open(&self) -> OpHandle<()> {
        let port = self.config.port.clone();
        self.bounded(move |sensor| {
            if sensor.open_connection(&port) {
                info!(%port, "Sensor port opened");
                Ok(())
            } else {
                Err(RigError::ConnectError(format!("cannot open {port}")))
            }
        })
    }

    /// Close the port; succeeds if it was not open
    pub fn close(&self) -> OpHandle<()> {
        self.bounded(|sensor| {
            if !sensor.is_connected() || sensor.close_connection() {
                Ok(())
            } else {
                Err(RigError::ConnectError("sensor port did not close".to_string()))
            }
        })
    }

    /// Read one set of values
    pub fn read(&self) -> OpHandle<BTreeMap<String, f64>> {
        self.bounded(|sensor| {
            if !sensor.is_connected() {
                return Err(RigError::NotConnected);
            }
            sensor.get_data()
        })
    }

    /// Whether the sensor reports an open port
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.sensor.is_connected()
    }

    fn bounded<F, T>(&self, op: F) -> OpHandle<T>
    where
        F: FnOnce(&dyn SerialSensor) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sensor = Arc::clone(&self.sensor);
        let limit = Duration::from_millis(self.config.io_timeout_ms);
        self.bridge.submit(move || async move {
            let result = match timeout(limit, run_blocking(move || op(sensor.as_ref()))).await {
                Ok(result) => result,
                Err(_) => Err(RigError::Timeout {
                    timeout_ms: millis(limit),
                }),
            };
            result.inspect_err(|e| warn!(kind = e.kind(), "Sensor call failed: {e}"))
        })
    }
}
