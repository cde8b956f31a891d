use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, RigError},
    protocol::parse_control_response,
    session::{BleTransport, DiscoveredPeripheral, NotificationStream},
    CONTROL_POINT_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID, MACHINE_STATUS_UUID,
};

/// How long a control point write waits for the machine's response indication
const CONTROL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

type TelemetrySlot = Arc<StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>;

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| RigError::Protocol(format!("Invalid {what} UUID: {e}")))
}

/// Characteristic UUIDs of the fitness machine service
struct FtmsUuids {
    service: Uuid,
    control_point: Uuid,
    bike_data: Uuid,
    machine_status: Uuid,
}

impl FtmsUuids {
    fn parse() -> Result<Self> {
        Ok(Self {
            service: parse_uuid(FTMS_SERVICE_UUID, "service")?,
            control_point: parse_uuid(CONTROL_POINT_UUID, "control point")?,
            bike_data: parse_uuid(INDOOR_BIKE_DATA_UUID, "indoor bike data")?,
            machine_status: parse_uuid(MACHINE_STATUS_UUID, "machine status")?,
        })
    }
}

struct Link {
    peripheral: Peripheral,
    control_point: Characteristic,
    bike_data: Characteristic,
    responses: mpsc::UnboundedReceiver<Vec<u8>>,
    telemetry: TelemetrySlot,
    router: JoinHandle<()>,
}

/// [`BleTransport`] on the host's first Bluetooth adapter
pub struct BtleplugTransport {
    manager: Manager,
    uuids: FtmsUuids,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    link: Mutex<Option<Link>>,
}

impl BtleplugTransport {
    /// Create a transport
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            uuids: FtmsUuids::parse()?,
            peripherals: Mutex::new(HashMap::new()),
            link: Mutex::new(None),
        })
    }

    async fn open_link(&self, peripheral: Peripheral) -> Result<Link> {
        peripheral.discover_services().await?;

        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == self.uuids.service)
            .ok_or_else(|| RigError::Protocol("Fitness machine service not found".to_string()))?;

        let find = |uuid: Uuid| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
        };
        let control_point = find(self.uuids.control_point)
            .ok_or_else(|| RigError::Protocol("Control point not found".to_string()))?;
        let bike_data = find(self.uuids.bike_data)
            .ok_or_else(|| RigError::Protocol("Indoor bike data not found".to_string()))?;

        // control point responses arrive as indications
        peripheral.subscribe(&control_point).await?;
        if let Some(status) = find(self.uuids.machine_status) {
            peripheral.subscribe(&status).await?;
        }

        let (responses_tx, responses) = mpsc::unbounded_channel();
        let telemetry: TelemetrySlot = Arc::new(StdMutex::new(None));
        let mut notifications = peripheral.notifications().await?;

        let uuids = (
            self.uuids.control_point,
            self.uuids.bike_data,
            self.uuids.machine_status,
        );
        let slot = Arc::clone(&telemetry);
        let router = tokio::spawn(async move {
            let (control_uuid, bike_data_uuid, status_uuid) = uuids;
            while let Some(notification) = notifications.next().await {
                if notification.uuid == control_uuid {
                    let _ = responses_tx.send(notification.value);
                } else if notification.uuid == bike_data_uuid {
                    let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(sender) = slot.as_ref() {
                        let _ = sender.send(notification.value);
                    }
                } else if notification.uuid == status_uuid {
                    debug!("Fitness machine status: {:02X?}", notification.value);
                }
            }
            // ending the telemetry stream tells the session the link is gone
            slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            debug!("Notification router stopped");
        });

        Ok(Link {
            peripheral,
            control_point,
            bike_data,
            responses,
            telemetry,
            router,
        })
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn scan_peripherals(&self, window: Duration) -> Result<Vec<DiscoveredPeripheral>> {
        let adapters = self.manager.adapters().await?;
        let Some(central) = adapters.first() else {
            return Err(RigError::ConnectError("no Bluetooth adapter".to_string()));
        };

        let scan_filter = ScanFilter {
            services: vec![self.uuids.service],
        };
        central.start_scan(scan_filter).await?;
        tokio::time::sleep(window).await;
        central.stop_scan().await?;

        let mut found = Vec::new();
        let mut cache = self.peripherals.lock().await;
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !properties.services.contains(&self.uuids.service) {
                continue;
            }

            let address = peripheral.address().to_string();
            found.push(DiscoveredPeripheral {
                address: address.clone(),
                name: properties.local_name,
                rssi: properties.rssi,
            });
            cache.insert(address, peripheral);
        }

        Ok(found)
    }

    async fn connect(&self, address: &str) -> Result<bool> {
        let Some(peripheral) = self.peripherals.lock().await.get(address).cloned() else {
            warn!(%address, "Device not found in last scan");
            return Ok(false);
        };

        if let Err(e) = peripheral.connect().await {
            warn!(kind = "ble", %address, "Link could not be opened: {e}");
            return Ok(false);
        }

        match self.open_link(peripheral.clone()).await {
            Ok(link) => {
                *self.link.lock().await = Some(link);
                info!(%address, "Fitness machine link ready");
                Ok(true)
            }
            Err(e) => {
                let _ = peripheral.disconnect().await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<bool> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(true);
        };
        link.router.abort();
        link.peripheral.disconnect().await?;
        Ok(true)
    }

    async fn write_control_point(&self, data: &[u8]) -> Result<bool> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(RigError::NotConnected)?;

        // discard responses to earlier writes that arrived late
        while link.responses.try_recv().is_ok() {}

        debug!("Writing control point: {:02X?}", data);
        link.peripheral
            .write(&link.control_point, data, WriteType::WithResponse)
            .await?;

        match timeout(CONTROL_RESPONSE_TIMEOUT, link.responses.recv()).await {
            Ok(Some(response)) => match parse_control_response(&response) {
                Ok(_) => Ok(true),
                Err(RigError::DeviceRejected { reason }) => {
                    warn!(kind = "device_rejected", "Control point refused: {reason}");
                    Ok(false)
                }
                Err(e) => {
                    warn!(kind = e.kind(), "Unexpected control point response: {e}");
                    Ok(true)
                }
            },
            Ok(None) => Err(RigError::NotConnected),
            Err(_) => {
                debug!("No control point response, assuming accepted");
                Ok(true)
            }
        }
    }

    async fn subscribe_notifications(&self) -> Result<NotificationStream> {
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(RigError::NotConnected)?;

        let (tx, rx) = mpsc::unbounded_channel();
        *link.telemetry.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        link.peripheral.subscribe(&link.bike_data).await?;

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|data| (data, rx))
        })
        .boxed())
    }

    async fn unsubscribe_notifications(&self) -> Result<()> {
        let guard = self.link.lock().await;
        let Some(link) = guard.as_ref() else {
            return Ok(());
        };
        link.telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        link.peripheral.unsubscribe(&link.bike_data).await?;
        Ok(())
    }
}
