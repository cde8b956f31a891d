//! The explicitly constructed, explicitly shut down rig instance.
//!
//! [`Rig`] owns the execution bridge and wires the device session, actuator
//! guard, sensor poller and command sequencer to it. Every device call made
//! through the rig returns an [`OpHandle`] at once; the UI polls or awaits it.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    actuator::{ActuatorGuard, FieldBusClient},
    bridge::{Bridge, OpHandle},
    config::RigConfig,
    error::{Result, RigError},
    fanout::{ConsumerId, TelemetryConsumer},
    protocol::ControlCodec,
    recorder::CsvTelemetryRecorder,
    sensor::{SensorPoller, SerialSensor},
    sequencer::CommandSequencer,
    session::{BleTransport, DeviceSession},
    types::{ControlCommand, DeviceHandle, SequenceOutcome, SequenceStep, SessionState},
};

/// Collects the rig's collaborators before the bridge starts
pub struct RigBuilder {
    config: RigConfig,
    transport: Arc<dyn BleTransport>,
    codec: Option<Arc<dyn ControlCodec>>,
    field_bus: Option<Arc<dyn FieldBusClient>>,
    sensor: Option<Arc<dyn SerialSensor>>,
}

impl RigBuilder {
    /// Use a codec other than FTMS
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn ControlCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Drive an actuator through `client`
    #[must_use]
    pub fn field_bus(mut self, client: Arc<dyn FieldBusClient>) -> Self {
        self.field_bus = Some(client);
        self
    }

    /// Poll a serial torque sensor
    #[must_use]
    pub fn sensor(mut self, sensor: Arc<dyn SerialSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    /// Start the bridge and assemble the rig
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Io`] if the bridge cannot start, or
    /// [`RigError::OutOfRange`] for an unusable actuator configuration.
    pub fn start(self) -> Result<Rig> {
        let Self {
            config,
            transport,
            codec,
            field_bus,
            sensor,
        } = self;

        let bridge = Bridge::start(&config.bridge)?;
        let handle = bridge.handle();

        let session = Arc::new(match codec {
            Some(codec) => DeviceSession::with_codec(transport, codec, config.session.clone()),
            None => DeviceSession::new(transport, config.session.clone()),
        });

        let actuator = match field_bus {
            Some(client) => Some(Arc::new(ActuatorGuard::new(
                handle.clone(),
                client,
                config.actuator.clone(),
            )?)),
            None => None,
        };

        let sensor = sensor.map(|sensor| SensorPoller::new(handle.clone(), sensor, config.sensor.clone()));
        let sequencer = CommandSequencer::new(handle, Arc::clone(&session), actuator.clone());

        info!(
            actuator = actuator.is_some(),
            sensor = sensor.is_some(),
            "Rig started"
        );

        Ok(Rig {
            bridge,
            session,
            actuator,
            sensor,
            sequencer,
            config,
        })
    }
}

/// The running rig
pub struct Rig {
    bridge: Bridge,
    session: Arc<DeviceSession>,
    actuator: Option<Arc<ActuatorGuard>>,
    sensor: Option<SensorPoller>,
    sequencer: CommandSequencer,
    config: RigConfig,
}

impl Rig {
    /// Start configuring a rig around `transport`
    #[must_use]
    pub fn builder(config: RigConfig, transport: Arc<dyn BleTransport>) -> RigBuilder {
        RigBuilder {
            config,
            transport,
            codec: None,
            field_bus: None,
            sensor: None,
        }
    }

    /// Whether the fitness machine is linked; cheap enough to poll every second
    #[must_use]
    pub fn connection_status(&self) -> bool {
        self.session.connection_status()
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The device session, for async callers already on the bridge
    #[must_use]
    pub const fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Scan for fitness machines during `window`
    pub fn scan(&self, window: Duration) -> OpHandle<BTreeMap<String, DeviceHandle>> {
        let session = Arc::clone(&self.session);
        self.bridge
            .submit(move || async move { session.scan(window).await })
    }

    /// Link to the machine at `address`
    pub fn connect(&self, address: impl Into<String>) -> OpHandle<()> {
        let session = Arc::clone(&self.session);
        let address = address.into();
        self.bridge
            .submit(move || async move { session.connect(&address).await })
    }

    /// Drop the link to the machine
    pub fn disconnect(&self) -> OpHandle<()> {
        let session = Arc::clone(&self.session);
        self.bridge
            .submit(move || async move { session.disconnect().await })
    }

    /// Send a control command
    pub fn write(&self, command: ControlCommand) -> OpHandle<()> {
        let session = Arc::clone(&self.session);
        self.bridge
            .submit(move || async move { session.write(command).await })
    }

    /// Register a telemetry consumer
    pub fn subscribe_telemetry<C: TelemetryConsumer>(&self, consumer: C) -> OpHandle<ConsumerId> {
        let session = Arc::clone(&self.session);
        self.bridge
            .submit(move || async move { session.subscribe_telemetry(consumer).await })
    }

    /// Remove all telemetry consumers
    pub fn unsubscribe(&self) -> OpHandle<()> {
        let session = Arc::clone(&self.session);
        self.bridge
            .submit(move || async move { session.unsubscribe().await })
    }

    /// Log telemetry to a new file in `dir`
    pub fn record_telemetry(&self, dir: impl Into<PathBuf>) -> OpHandle<ConsumerId> {
        let session = Arc::clone(&self.session);
        let dir = dir.into();
        self.bridge.submit(move || async move {
            if !session.connection_status() {
                return Err(RigError::NotConnected);
            }
            let recorder = CsvTelemetryRecorder::create_in(&dir)?;
            session.subscribe_telemetry(recorder).await
        })
    }

    /// Open the field-bus link configured in [`RigConfig::field_bus`]
    pub fn connect_actuator(&self) -> OpHandle<()> {
        match &self.actuator {
            Some(actuator) => actuator.connect(&self.config.field_bus),
            None => OpHandle::ready(Err(RigError::NotConnected)),
        }
    }

    /// Send an actuator speed in km/h
    pub fn set_actuator_speed(&self, kmh: f64) -> OpHandle<()> {
        match &self.actuator {
            Some(actuator) => actuator.set_speed(kmh),
            None => OpHandle::ready(Err(RigError::NotConnected)),
        }
    }

    /// The actuator guard, if a field-bus client was configured
    #[must_use]
    pub const fn actuator(&self) -> Option<&Arc<ActuatorGuard>> {
        self.actuator.as_ref()
    }

    /// The sensor poller, if a sensor was configured
    #[must_use]
    pub const fn sensor(&self) -> Option<&SensorPoller> {
        self.sensor.as_ref()
    }

    /// Start replaying `steps`
    ///
    /// # Errors
    ///
    /// See [`CommandSequencer::start`].
    pub fn start_sequence(&self, steps: Vec<SequenceStep>) -> Result<OpHandle<SequenceOutcome>> {
        self.sequencer.start(steps)
    }

    /// Stop the running sequence; no-op if none is running
    pub fn stop_sequence(&self) -> bool {
        self.sequencer.stop()
    }

    /// The command sequencer
    #[must_use]
    pub const fn sequencer(&self) -> &CommandSequencer {
        &self.sequencer
    }

    /// Stop the sequence, release the machine and stop the bridge.
    ///
    /// Waits at most one shutdown grace period for the disconnect and one for
    /// in-flight operations. Returns `false` if the worker had to be detached.
    pub fn shutdown(self) -> bool {
        info!("Shutting down rig");
        self.sequencer.stop();

        let grace = self.config.bridge.shutdown_grace();
        if self.session.connection_status() {
            if let Err(e) = self.disconnect().await_result(Some(grace)) {
                warn!(kind = e.kind(), "Disconnect during shutdown failed: {e}");
            }
        }

        self.bridge.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DiscoveredPeripheral, NotificationStream};
    use async_trait::async_trait;

    struct IdleRadio;

    #[async_trait]
    impl BleTransport for IdleRadio {
        async fn scan_peripherals(&self, _window: Duration) -> Result<Vec<DiscoveredPeripheral>> {
            Ok(Vec::new())
        }
        async fn connect(&self, _address: &str) -> Result<bool> {
            Ok(true)
        }
        async fn disconnect(&self) -> Result<bool> {
            Ok(true)
        }
        async fn write_control_point(&self, _data: &[u8]) -> Result<bool> {
            Ok(true)
        }
        async fn subscribe_notifications(&self) -> Result<NotificationStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
        async fn unsubscribe_notifications(&self) -> Result<()> {
            Ok(())
        }
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(2));

    #[test]
    fn test_lifecycle_through_handles() {
        let rig = Rig::builder(RigConfig::default(), Arc::new(IdleRadio))
            .start()
            .unwrap();
        assert!(!rig.connection_status());

        let found = rig.scan(Duration::from_millis(10)).await_result(WAIT).unwrap();
        assert!(found.is_empty());

        rig.connect("AA").await_result(WAIT).unwrap();
        assert!(rig.connection_status());
        rig.write(ControlCommand::Percentage(40)).await_result(WAIT).unwrap();

        assert!(rig.shutdown());
    }

    #[test]
    fn test_missing_actuator_reports_not_connected() {
        let rig = Rig::builder(RigConfig::default(), Arc::new(IdleRadio))
            .start()
            .unwrap();
        assert!(rig.actuator().is_none());
        assert!(matches!(
            rig.set_actuator_speed(10.0).await_result(WAIT),
            Err(RigError::NotConnected)
        ));
        assert!(rig.sensor().is_none());
        assert!(rig.shutdown());
    }
}
