use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    bridge::{millis, run_blocking, BridgeHandle, OpHandle},
    config::{ActuatorConfig, FieldBusEndpoint},
    error::{Result, RigError},
};

/// Blocking client for the motor controller on the field bus.
///
/// Industrial clients are synchronous; the guard only ever calls them from
/// helper threads.
pub trait FieldBusClient: Send + Sync {
    /// Whether the controller link is up
    fn is_connected(&self) -> bool;

    /// Open the controller link
    ///
    /// # Errors
    ///
    /// Returns [`RigError::ConnectError`] or [`RigError::Io`] if the
    /// controller cannot be reached.
    fn connect(&self, host: &str, port: u16) -> Result<()>;

    /// Close the controller link
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not close cleanly.
    fn disconnect(&self) -> Result<()>;

    /// Write the scaled motor speed register
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_motor_speed(&self, value: i32) -> Result<()>;
}

/// Validates actuator speeds before they reach the field bus.
///
/// Values outside the configured bound are rejected, never clamped.
pub struct ActuatorGuard {
    bridge: BridgeHandle,
    client: Arc<dyn FieldBusClient>,
    config: ActuatorConfig,
}

impl ActuatorGuard {
    /// Create a guard for `client`
    ///
    /// # Errors
    ///
    /// Returns [`RigError::OutOfRange`] if the configured bound or scale is
    /// unusable.
    pub fn new(
        bridge: BridgeHandle,
        client: Arc<dyn FieldBusClient>,
        config: ActuatorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bridge,
            client,
            config,
        })
    }

    /// Accepted speed interval in km/h, inclusive
    #[must_use]
    pub const fn bound(&self) -> (f64, f64) {
        (self.config.min_kmh, self.config.max_kmh)
    }

    /// Check `kmh` against the bound and scale it to the register value.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::OutOfRange`] for values outside the bound and NaN.
    pub fn scaled(&self, kmh: f64) -> Result<i32> {
        let (min, max) = self.bound();
        if !(min..=max).contains(&kmh) {
            return Err(RigError::OutOfRange {
                value: kmh,
                min,
                max,
            });
        }

        let scaled = (kmh * self.config.scale).round();
        if scaled < f64::from(i32::MIN) || scaled > f64::from(i32::MAX) {
            return Err(RigError::OutOfRange {
                value: kmh,
                min,
                max,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let register = scaled as i32;
        Ok(register)
    }

    /// Send a speed to the motor controller through the bridge.
    ///
    /// Rejected values resolve the handle immediately and the client is not
    /// called.
    pub fn set_speed(&self, kmh: f64) -> OpHandle<()> {
        let scaled = match self.scaled(kmh) {
            Ok(scaled) => scaled,
            Err(e) => {
                warn!(kind = e.kind(), kmh, "Actuator speed rejected: {e}");
                return OpHandle::ready(Err(e));
            }
        };

        let client = Arc::clone(&self.client);
        let limit = self.write_timeout();
        self.bridge
            .submit(move || write_speed(client, kmh, scaled, limit))
    }

    /// Send a speed from code already running on the bridge
    ///
    /// # Errors
    ///
    /// Returns [`RigError::OutOfRange`], [`RigError::NotConnected`],
    /// [`RigError::Timeout`] or the client's error.
    pub async fn apply_speed(&self, kmh: f64) -> Result<()> {
        let scaled = self.scaled(kmh).inspect_err(|e| {
            warn!(kind = e.kind(), kmh, "Actuator speed rejected: {e}");
        })?;
        write_speed(Arc::clone(&self.client), kmh, scaled, self.write_timeout()).await
    }

    /// Open the field-bus link through the bridge
    pub fn connect(&self, endpoint: &FieldBusEndpoint) -> OpHandle<()> {
        let client = Arc::clone(&self.client);
        let FieldBusEndpoint { host, port } = endpoint.clone();
        self.bridge.submit_blocking(move || {
            info!(%host, port, "Connecting to motor controller");
            client.connect(&host, port).inspect_err(|e| {
                warn!(kind = e.kind(), %host, port, "Motor controller connect failed: {e}");
            })
        })
    }

    /// Close the field-bus link through the bridge
    pub fn disconnect(&self) -> OpHandle<()> {
        let client = Arc::clone(&self.client);
        self.bridge.submit_blocking(move || {
            if !client.is_connected() {
                return Ok(());
            }
            info!("Disconnecting from motor controller");
            client.disconnect()
        })
    }

    /// Whether the field-bus link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.config.write_timeout_ms)
    }
}

async fn write_speed(
    client: Arc<dyn FieldBusClient>,
    kmh: f64,
    scaled: i32,
    limit: Duration,
) -> Result<()> {
    let write = run_blocking(move || {
        if !client.is_connected() {
            return Err(RigError::NotConnected);
        }
        client.set_motor_speed(scaled)
    });

    let result = match timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(RigError::Timeout {
            timeout_ms: millis(limit),
        }),
    };

    match &result {
        Ok(()) => debug!(kmh, scaled, "Actuator speed set"),
        Err(e) => warn!(kind = e.kind(), kmh, "Actuator write failed: {e}"),
    }
    result
}
