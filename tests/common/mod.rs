#![allow(dead_code)]

use async_trait::async_trait;
use bikerig::{
    actuator::FieldBusClient,
    session::{DiscoveredPeripheral, NotificationStream},
    BleTransport, BridgeConfig, Result, Rig, RigConfig, RigError,
};
use futures::StreamExt;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

pub const BIKE: &str = "F0:F5:BD:31:FE:C6";
pub const WAIT: Option<Duration> = Some(Duration::from_secs(5));

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fitness machine that records every control point write
#[derive(Default)]
pub struct ScriptedRadio {
    pub connect_delay: Duration,
    pub unreachable: bool,
    pub writes: Mutex<Vec<(Instant, Vec<u8>)>>,
    pub notifications: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ScriptedRadio {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.timed_writes().into_iter().map(|(_, data)| data).collect()
    }

    pub fn timed_writes(&self) -> Vec<(Instant, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    /// Deliver one Indoor Bike Data notification
    pub fn notify(&self, data: Vec<u8>) -> bool {
        self.notifications
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(data).is_ok())
    }

    /// Simulate the peripheral going out of range
    pub fn drop_link(&self) {
        self.notifications.lock().unwrap().take();
    }
}

#[async_trait]
impl BleTransport for ScriptedRadio {
    async fn scan_peripherals(&self, window: Duration) -> Result<Vec<DiscoveredPeripheral>> {
        tokio::time::sleep(window).await;
        Ok(vec![DiscoveredPeripheral {
            address: BIKE.to_string(),
            name: Some("KICKR CORE".to_string()),
            rssi: Some(-62),
        }])
    }

    async fn connect(&self, _address: &str) -> Result<bool> {
        tokio::time::sleep(self.connect_delay).await;
        Ok(!self.unreachable)
    }

    async fn disconnect(&self) -> Result<bool> {
        self.notifications.lock().unwrap().take();
        Ok(true)
    }

    async fn write_control_point(&self, data: &[u8]) -> Result<bool> {
        self.writes.lock().unwrap().push((Instant::now(), data.to_vec()));
        Ok(true)
    }

    async fn subscribe_notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notifications.lock().unwrap() = Some(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|data| (data, rx))
        })
        .boxed())
    }

    async fn unsubscribe_notifications(&self) -> Result<()> {
        Ok(())
    }
}

/// Motor controller that records scaled speed writes
#[derive(Default)]
pub struct RecordingBus {
    connected: AtomicBool,
    speeds: Mutex<Vec<(Instant, i32)>>,
}

impl RecordingBus {
    pub fn speeds(&self) -> Vec<i32> {
        self.timed_speeds().into_iter().map(|(_, value)| value).collect()
    }

    pub fn timed_speeds(&self) -> Vec<(Instant, i32)> {
        self.speeds.lock().unwrap().clone()
    }
}

impl FieldBusClient for RecordingBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&self, host: &str, _port: u16) -> Result<()> {
        if host.is_empty() {
            return Err(RigError::ConnectError("no host".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_motor_speed(&self, value: i32) -> Result<()> {
        self.speeds.lock().unwrap().push((Instant::now(), value));
        Ok(())
    }
}

pub fn rig(radio: &Arc<ScriptedRadio>, bus: Option<&Arc<RecordingBus>>) -> Rig {
    init_logging();
    let config = RigConfig {
        bridge: BridgeConfig {
            shutdown_grace_ms: 500,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut builder = Rig::builder(config, radio.clone());
    if let Some(bus) = bus {
        builder = builder.field_bus(bus.clone());
    }
    builder.start().unwrap()
}

/// Rig linked to the scripted bike, with the motor controller connected if given
pub fn connected_rig(radio: &Arc<ScriptedRadio>, bus: Option<&Arc<RecordingBus>>) -> Rig {
    let rig = rig(radio, bus);
    rig.connect(BIKE).await_result(WAIT).unwrap();
    if bus.is_some() {
        rig.connect_actuator().await_result(WAIT).unwrap();
    }
    rig
}

/// Indoor Bike Data payload carrying speed (km/h) and power (W)
pub fn bike_data(speed_kmh: f64, watts: i16) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let speed = (speed_kmh * 100.0).round() as u16;
    let mut data = vec![0x40, 0x00];
    data.extend_from_slice(&speed.to_le_bytes());
    data.extend_from_slice(&watts.to_le_bytes());
    data
}
