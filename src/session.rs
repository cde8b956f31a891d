//! BLE device session.
//!
//! The session owns the link lifecycle of one fitness-machine peripheral.
//! State lives in a `watch` channel: every transition is a compare-and-set
//! on it, so a second scan or connect is rejected instead of interleaved,
//! and [`DeviceSession::connection_status`] is a lock-free snapshot read.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bridge::millis,
    config::SessionConfig,
    error::{Result, RigError},
    fanout::{ConsumerId, TelemetryConsumer, TelemetryFanout},
    protocol::{ControlCodec, FtmsCodec},
    types::{ControlCommand, DeviceHandle, SessionState},
};

/// Raw notification payloads from the telemetry characteristic.
///
/// The stream ending without an unsubscribe means the link dropped.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// A peripheral reported by [`BleTransport::scan_peripherals`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    /// Platform address
    pub address: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Signal strength in dBm, if reported
    pub rssi: Option<i16>,
}

/// Radio-level access to the fitness machine
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Scan for peripherals advertising the fitness-machine service.
    ///
    /// Returns whatever was seen when `window` elapses.
    async fn scan_peripherals(&self, window: Duration) -> Result<Vec<DiscoveredPeripheral>>;

    /// Open the link; `Ok(false)` means the peripheral could not be reached
    async fn connect(&self, address: &str) -> Result<bool>;

    /// Close the link
    async fn disconnect(&self) -> Result<bool>;

    /// Write to the control point; `Ok(false)` means the peripheral refused it
    async fn write_control_point(&self, data: &[u8]) -> Result<bool>;

    /// Enable telemetry notifications
    async fn subscribe_notifications(&self) -> Result<NotificationStream>;

    /// Disable telemetry notifications
    async fn unsubscribe_notifications(&self) -> Result<()>;
}

struct Shared {
    state: watch::Sender<SessionState>,
    address: Mutex<Option<String>>,
    last_failure: Mutex<Option<String>>,
    fanout: TelemetryFanout,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            debug!(from = %previous, to = %next, "Session state changed");
        }
    }

    /// Move to `next` if `allowed` accepts the current state; otherwise hand
    /// the current state back unchanged.
    fn transition(
        &self,
        allowed: impl FnOnce(&SessionState) -> bool,
        next: SessionState,
    ) -> std::result::Result<SessionState, SessionState> {
        let mut outcome = None;
        self.state.send_if_modified(|state| {
            if allowed(state) {
                outcome = Some(Ok(std::mem::replace(state, next)));
                true
            } else {
                outcome = Some(Err(state.clone()));
                false
            }
        });
        outcome.unwrap_or_else(|| Err(self.state()))
    }

    fn address(&self) -> Option<String> {
        self.address.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_address(&self, address: Option<String>) {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }

    /// Publish `Failed(reason)` and settle in `Disconnected`
    fn fail(&self, reason: String) {
        self.set_address(None);
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        self.set_state(SessionState::Failed(reason));
        self.set_state(SessionState::Disconnected);
    }
}

/// The one session with the fitness-machine peripheral
pub struct DeviceSession {
    transport: Arc<dyn BleTransport>,
    codec: Arc<dyn ControlCodec>,
    config: SessionConfig,
    shared: Arc<Shared>,
    write_gate: tokio::sync::Mutex<()>,
    subscription: tokio::sync::Mutex<Option<CancellationToken>>,
    last_scan: Mutex<BTreeMap<String, DeviceHandle>>,
}

impl DeviceSession {
    /// Create a session speaking FTMS over `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn BleTransport>, config: SessionConfig) -> Self {
        Self::with_codec(transport, Arc::new(FtmsCodec), config)
    }

    /// Create a session with a custom wire codec
    #[must_use]
    pub fn with_codec(
        transport: Arc<dyn BleTransport>,
        codec: Arc<dyn ControlCodec>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            transport,
            codec,
            config,
            shared: Arc::new(Shared {
                state,
                address: Mutex::new(None),
                last_failure: Mutex::new(None),
                fanout: TelemetryFanout::new(),
            }),
            write_gate: tokio::sync::Mutex::new(()),
            subscription: tokio::sync::Mutex::new(None),
            last_scan: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether a link is up (`Connected` or `Streaming`).
    ///
    /// Never waits on in-flight I/O; safe to poll from the UI thread.
    #[must_use]
    pub fn connection_status(&self) -> bool {
        self.shared.state.borrow().is_linked()
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Address of the linked peripheral
    #[must_use]
    pub fn connected_address(&self) -> Option<String> {
        self.shared.address()
    }

    /// Reason of the most recent connect failure or link loss
    #[must_use]
    pub fn last_failure(&self) -> Option<String> {
        self.shared
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Results of the most recent scan, keyed by address
    #[must_use]
    pub fn last_scan(&self) -> BTreeMap<String, DeviceHandle> {
        self.last_scan.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Scan for peripherals during `window`.
    ///
    /// Returns the peripherals seen before the window closed; finding none is
    /// not an error. The session is back in `Disconnected` afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Busy`] unless the session is idle,
    /// [`RigError::Timeout`] if the transport overruns the window by more than
    /// the configured grace, or the transport's error.
    pub async fn scan(&self, window: Duration) -> Result<BTreeMap<String, DeviceHandle>> {
        self.shared
            .transition(SessionState::is_idle, SessionState::Scanning)
            .map_err(|state| RigError::Busy {
                operation: "scan",
                state,
            })?;

        info!(window_ms = millis(window), "Scanning for fitness machines");
        let limit = window + Duration::from_millis(self.config.scan_overrun_grace_ms);
        let outcome = match timeout(limit, self.transport.scan_peripherals(window)).await {
            Ok(result) => result,
            Err(_) => Err(RigError::Timeout {
                timeout_ms: millis(limit),
            }),
        };
        self.shared.set_state(SessionState::Disconnected);

        let peripherals = outcome.inspect_err(|e| {
            warn!(kind = e.kind(), "Scan failed: {e}");
        })?;

        let found: BTreeMap<String, DeviceHandle> = peripherals
            .into_iter()
            .map(|peripheral| {
                let name = peripheral.name.unwrap_or_else(|| "Unknown".to_string());
                let handle = DeviceHandle::new(peripheral.address.clone(), name, peripheral.rssi);
                (peripheral.address, handle)
            })
            .collect();

        info!("Scan completed. Found {} device(s)", found.len());
        *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) = found.clone();
        Ok(found)
    }

    /// Link to the peripheral at `address`.
    ///
    /// Connecting to the address that is already linked succeeds without
    /// touching the radio.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::ConnectError`] if a connect, scan or disconnect is in
    /// flight, if another peripheral is linked, or if the peripheral is
    /// unreachable; [`RigError::Timeout`] if the link is not up in time.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let current_address = self.shared.address();
        let mut already_linked = false;
        self.shared
            .transition(
                |state| {
                    already_linked =
                        state.is_linked() && current_address.as_deref() == Some(address);
                    state.is_idle()
                },
                SessionState::Connecting,
            )
            .or_else(|state| {
                if already_linked {
                    return Ok(state);
                }
                let reason = match state {
                    SessionState::Connecting => "connect already in flight".to_string(),
                    SessionState::Scanning => "scan in progress".to_string(),
                    SessionState::Disconnecting => "disconnect in progress".to_string(),
                    _ => format!(
                        "already connected to {}",
                        current_address.as_deref().unwrap_or("another device")
                    ),
                };
                warn!(kind = "connect_error", %address, "Connect rejected: {reason}");
                Err(RigError::ConnectError(reason))
            })?;

        if already_linked {
            debug!(%address, "Already connected");
            return Ok(());
        }

        info!(%address, "Connecting to device");
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let failure = match timeout(limit, self.transport.connect(address)).await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(RigError::ConnectError(format!("{address} unreachable"))),
            Ok(Err(e)) => Some(e),
            Err(_) => {
                // drop whatever half-open link the transport may hold
                let _ = self.transport.disconnect().await;
                Some(RigError::Timeout {
                    timeout_ms: self.config.connect_timeout_ms,
                })
            }
        };

        if let Some(error) = failure {
            warn!(kind = error.kind(), %address, "Connect failed: {error}");
            self.shared.fail(error.to_string());
            return Err(error);
        }

        self.shared.set_address(Some(address.to_string()));
        self.shared.set_state(SessionState::Connected);
        info!(%address, "Successfully connected");

        self.request_control().await;
        Ok(())
    }

    async fn request_control(&self) {
        let Some(preamble) = self.codec.control_preamble() else {
            return;
        };
        let _gate = self.write_gate.lock().await;
        match self.write_bytes(&preamble, "request control").await {
            Ok(()) => debug!("Control granted"),
            Err(e) => warn!(kind = e.kind(), "Control request not accepted: {e}"),
        }
    }

    /// Tear down subscriptions, then the link.
    ///
    /// Succeeds immediately if nothing is linked.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Busy`] while a scan or connect is in flight, or the
    /// transport's error. The session ends up `Disconnected` either way.
    pub async fn disconnect(&self) -> Result<()> {
        match self
            .shared
            .transition(SessionState::is_linked, SessionState::Disconnecting)
        {
            Ok(_) => {}
            Err(state) if state.is_idle() => return Ok(()),
            Err(state) => {
                return Err(RigError::Busy {
                    operation: "disconnect",
                    state,
                })
            }
        }

        info!("Disconnecting from device");
        let teardown = self.stop_notifications().await;

        let limit = Duration::from_millis(self.config.disconnect_timeout_ms);
        let link = match timeout(limit, self.transport.disconnect()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                warn!("Transport reported an unclean disconnect");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RigError::Timeout {
                timeout_ms: self.config.disconnect_timeout_ms,
            }),
        };

        self.shared.set_address(None);
        self.shared.set_state(SessionState::Disconnected);

        teardown.and(link).inspect_err(|e| {
            warn!(kind = e.kind(), "Disconnect was not clean: {e}");
        })
    }

    /// Send one control command.
    ///
    /// Writes are issued one at a time in the order they reach the session.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::NotConnected`] without a link,
    /// [`RigError::OutOfRange`] if the command cannot be encoded,
    /// [`RigError::DeviceRejected`] if the peripheral refuses it, or
    /// [`RigError::Timeout`].
    pub async fn write(&self, command: ControlCommand) -> Result<()> {
        if !self.connection_status() {
            return Err(RigError::NotConnected);
        }
        let payload = self.codec.encode(&command)?;

        let _gate = self.write_gate.lock().await;
        // the link may have gone while queued
        if !self.connection_status() {
            return Err(RigError::NotConnected);
        }
        debug!(%command, "Writing control command");
        self.write_bytes(&payload, &command.to_string()).await
    }

    /// Caller must hold the write gate
    async fn write_bytes(&self, payload: &[u8], what: &str) -> Result<()> {
        let limit = Duration::from_millis(self.config.write_timeout_ms);
        match timeout(limit, self.transport.write_control_point(payload)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(RigError::DeviceRejected {
                reason: format!("{what} refused by peripheral"),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RigError::Timeout {
                timeout_ms: self.config.write_timeout_ms,
            }),
        }
    }

    /// Register a telemetry consumer and make sure notifications flow.
    ///
    /// The first subscription moves the session to `Streaming`.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::NotConnected`] without a link, or the transport's
    /// error when enabling notifications.
    pub async fn subscribe_telemetry<C: TelemetryConsumer>(&self, consumer: C) -> Result<ConsumerId> {
        if !self.connection_status() {
            return Err(RigError::NotConnected);
        }

        let mut subscription = self.subscription.lock().await;
        // a disconnect may have torn the link down while we waited
        if !self.connection_status() {
            return Err(RigError::NotConnected);
        }
        let id = self.shared.fanout.register(consumer)?;

        let running = subscription
            .as_ref()
            .is_some_and(|token| !token.is_cancelled());
        if !running {
            match self.transport.subscribe_notifications().await {
                Ok(stream) => {
                    let token = CancellationToken::new();
                    tokio::spawn(pump(
                        stream,
                        Arc::clone(&self.codec),
                        Arc::clone(&self.shared),
                        token.clone(),
                    ));
                    *subscription = Some(token);
                    info!("Telemetry notifications enabled");
                }
                Err(e) => {
                    self.shared.fanout.remove(id);
                    warn!(kind = e.kind(), "Enabling notifications failed: {e}");
                    return Err(e);
                }
            }
        }

        let _ = self
            .shared
            .transition(|state| *state == SessionState::Connected, SessionState::Streaming);
        Ok(id)
    }

    /// Remove every telemetry consumer and stop notifications.
    ///
    /// The session goes back from `Streaming` to `Connected`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when disabling notifications; the local
    /// subscription is removed regardless.
    pub async fn unsubscribe(&self) -> Result<()> {
        let result = self.stop_notifications().await;
        let _ = self
            .shared
            .transition(|state| *state == SessionState::Streaming, SessionState::Connected);
        result
    }

    /// Number of registered telemetry consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.shared.fanout.len()
    }

    async fn stop_notifications(&self) -> Result<()> {
        let token = self.subscription.lock().await.take();
        self.shared.fanout.clear();

        match token {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                info!("Telemetry notifications disabled");
                self.transport.unsubscribe_notifications().await
            }
            _ => Ok(()),
        }
    }
}

async fn pump(
    mut notifications: NotificationStream,
    codec: Arc<dyn ControlCodec>,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = notifications.next() => match next {
                Some(data) => match codec.decode(&data) {
                    Ok(sample) => shared.fanout.publish(sample),
                    Err(e) => debug!(kind = e.kind(), "Dropping undecodable notification: {e}"),
                },
                None => {
                    token.cancel();
                    if shared.state().is_linked() {
                        warn!(kind = "connect_error", "Notification stream closed, link lost");
                        shared.fanout.clear();
                        shared.fail("link lost".to_string());
                    }
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TelemetryField, TelemetrySample};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct FakeRadio {
        reachable: bool,
        connect_delay_ms: u64,
        writes: Mutex<Vec<Vec<u8>>>,
        refuse_writes: bool,
        notifications: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl BleTransport for FakeRadio {
        async fn scan_peripherals(&self, window: Duration) -> Result<Vec<DiscoveredPeripheral>> {
            tokio::time::sleep(window).await;
            Ok(vec![DiscoveredPeripheral {
                address: "F0:F5:BD:31:FE:C6".to_string(),
                name: Some("KICKR".to_string()),
                rssi: Some(-48),
            }])
        }

        async fn connect(&self, _address: &str) -> Result<bool> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.connect_delay_ms)).await;
            Ok(self.reachable)
        }

        async fn disconnect(&self) -> Result<bool> {
            Ok(true)
        }

        async fn write_control_point(&self, data: &[u8]) -> Result<bool> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(!self.refuse_writes)
        }

        async fn subscribe_notifications(&self) -> Result<NotificationStream> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.notifications.lock().unwrap() = Some(tx);
            Ok(stream_from(rx))
        }

        async fn unsubscribe_notifications(&self) -> Result<()> {
            self.notifications.lock().unwrap().take();
            Ok(())
        }
    }

    fn stream_from(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> NotificationStream {
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|data| (data, rx)) })
            .boxed()
    }

    fn session(radio: FakeRadio) -> (Arc<FakeRadio>, DeviceSession) {
        let radio = Arc::new(radio);
        let session = DeviceSession::new(radio.clone(), SessionConfig::default());
        (radio, session)
    }

    fn reachable() -> FakeRadio {
        FakeRadio {
            reachable: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scan_returns_to_disconnected() {
        let (_, session) = session(reachable());
        let found = assert_ok!(session.scan(Duration::from_millis(10)).await);

        assert_eq!(found.len(), 1);
        assert!(found["F0:F5:BD:31:FE:C6"].has_strong_signal());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.last_scan(), found);
    }

    #[tokio::test]
    async fn test_connect_requests_control() {
        let (radio, session) = session(reachable());
        assert_ok!(session.connect("AA").await);

        assert!(session.connection_status());
        assert_eq!(session.connected_address().as_deref(), Some("AA"));
        assert_eq!(radio.writes.lock().unwrap()[0], vec![0x00]);
    }

    #[tokio::test]
    async fn test_connect_same_address_is_noop() {
        let (radio, session) = session(reachable());
        assert_ok!(session.connect("AA").await);
        assert_ok!(session.connect("AA").await);
        assert_eq!(radio.connects.load(Ordering::SeqCst), 1);

        let other = session.connect("BB").await;
        assert!(matches!(other, Err(RigError::ConnectError(_))));
    }

    #[tokio::test]
    async fn test_failed_connect_settles_disconnected() {
        let (_, session) = session(FakeRadio::default());
        let mut changes = session.state_changes();

        let result = session.connect("AA").await;
        assert!(matches!(result, Err(RigError::ConnectError(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.last_failure().unwrap().contains("unreachable"));
        assert!(assert_ok!(changes.has_changed()));
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_connecting() {
        let (_, session) = session(FakeRadio {
            reachable: true,
            connect_delay_ms: 100,
            ..Default::default()
        });
        let session = Arc::new(session);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.connect("AA").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.state(), SessionState::Connecting);

        let second = session.connect("AA").await;
        assert!(matches!(second, Err(RigError::ConnectError(_))));
        let scan = session.scan(Duration::from_millis(1)).await;
        assert!(matches!(scan, Err(RigError::Busy { operation: "scan", .. })));

        assert_ok!(first.await.unwrap());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_write_requires_link() {
        let (_, session) = session(reachable());
        let result = session.write(ControlCommand::Percentage(10)).await;
        assert!(matches!(result, Err(RigError::NotConnected)));
    }

    #[tokio::test]
    async fn test_refused_write_is_device_rejected() {
        let (_, session) = session(FakeRadio {
            reachable: true,
            refuse_writes: true,
            ..Default::default()
        });
        assert_ok!(session.connect("AA").await);

        let result = session.write(ControlCommand::PowerWatts(150)).await;
        assert!(matches!(result, Err(RigError::DeviceRejected { .. })));
    }

    #[tokio::test]
    async fn test_writes_are_serialized_in_order() {
        let (radio, session) = session(reachable());
        assert_ok!(session.connect("AA").await);

        let writes = (1..=5).map(|level| session.write(ControlCommand::Percentage(level)));
        for result in futures::future::join_all(writes).await {
            assert_ok!(result);
        }

        let written = radio.writes.lock().unwrap();
        let levels: Vec<u8> = written[1..].iter().map(|bytes| bytes[1]).collect();
        assert_eq!(levels, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_lifecycle() {
        let (radio, session) = session(reachable());
        let consumer = |_: &TelemetrySample| -> Result<()> { Ok(()) };
        assert!(matches!(
            session.subscribe_telemetry(consumer).await,
            Err(RigError::NotConnected)
        ));

        assert_ok!(session.connect("AA").await);
        let (tx, rx) = std::sync::mpsc::channel();
        assert_ok!(
            session
                .subscribe_telemetry(move |sample: &TelemetrySample| -> Result<()> {
                    let _ = tx.send(sample.get(TelemetryField::Power));
                    Ok(())
                })
                .await
        );
        assert_eq!(session.state(), SessionState::Streaming);

        let sender = radio.notifications.lock().unwrap().clone().unwrap();
        sender.send(vec![0x41, 0x00, 0x96, 0x00]).unwrap();
        let power = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(power, Some(150.0));

        assert_ok!(session.unsubscribe().await);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.consumer_count(), 0);

        assert_ok!(session.disconnect().await);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_ok!(session.disconnect().await);
    }

    #[tokio::test]
    async fn test_link_loss_settles_disconnected() {
        let (radio, session) = session(reachable());
        assert_ok!(session.connect("AA").await);
        assert_ok!(
            session
                .subscribe_telemetry(|_: &TelemetrySample| -> Result<()> { Ok(()) })
                .await
        );

        radio.notifications.lock().unwrap().take();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!session.connection_status());
        assert_eq!(session.last_failure().as_deref(), Some("link lost"));
        assert_err!(session.write(ControlCommand::Percentage(1)).await);
    }

    #[derive(Default)]
    struct GatedRadio {
        entered: tokio::sync::Notify,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl BleTransport for GatedRadio {
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
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(futures::stream::pending().boxed())
        }
        async fn unsubscribe_notifications(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_subscribe_queued_behind_disconnect_is_refused() {
        let radio = Arc::new(GatedRadio::default());
        let session = Arc::new(DeviceSession::new(radio.clone(), SessionConfig::default()));
        assert_ok!(session.connect("AA").await);

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.subscribe_telemetry(|_: &TelemetrySample| -> Result<()> { Ok(()) }).await }
        });
        radio.entered.notified().await;

        let second = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.subscribe_telemetry(|_: &TelemetrySample| -> Result<()> { Ok(()) }).await }
        });
        tokio::task::yield_now().await;

        let disconnect = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.disconnect().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(session.state(), SessionState::Disconnecting);

        radio.gate.notify_one();
        assert_ok!(first.await.unwrap());
        assert!(matches!(second.await.unwrap(), Err(RigError::NotConnected)));
        assert_ok!(disconnect.await.unwrap());

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.consumer_count(), 0);
    }
}
