use bikerig::{
    ble::BtleplugTransport, ControlCommand, Result, Rig, RigConfig, TelemetryField,
    TelemetrySample,
};
use std::{sync::Arc, thread, time::Duration};
use tracing::{error, info, warn};

const WAIT: Option<Duration> = Some(Duration::from_secs(20));

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚲 bikerig manual control example");

    // the adapter's background tasks live on this runtime
    let radio_runtime = tokio::runtime::Runtime::new()?;
    let radio = radio_runtime.block_on(BtleplugTransport::new())?;
    let rig = Rig::builder(RigConfig::default(), Arc::new(radio)).start()?;

    info!("Scanning for fitness machines...");
    let found = rig.scan(Duration::from_secs(5)).await_result(WAIT)?;
    let Some(device) = found
        .values()
        .max_by_key(|device| device.rssi.unwrap_or(i16::MIN))
        .cloned()
    else {
        warn!("No fitness machine found");
        rig.shutdown();
        return Ok(());
    };
    info!(
        "Found {} at {} (strong signal: {})",
        device.name,
        device.address,
        device.has_strong_signal()
    );

    if let Err(e) = rig.connect(device.address.clone()).await_result(WAIT) {
        error!("❌ Failed to connect: {e}");
        rig.shutdown();
        return Err(e);
    }

    rig.subscribe_telemetry(|sample: &TelemetrySample| -> Result<()> {
        let value = |field| sample.get(field).unwrap_or_default();
        info!(
            "📊 {:.1} km/h, {:.0} rpm, {:.0} W",
            value(TelemetryField::Speed),
            value(TelemetryField::Cadence),
            value(TelemetryField::Power)
        );
        Ok(())
    })
    .await_result(WAIT)?;

    for command in [
        ControlCommand::Percentage(40),
        ControlCommand::PowerWatts(150),
        ControlCommand::SimulationGrade(3),
        ControlCommand::Percentage(0),
    ] {
        // a UI would poll the handle from its timer instead of blocking
        let mut handle = rig.write(command);
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(50));
        }
        match handle.try_result() {
            Some(Ok(())) => info!("✅ {command} accepted"),
            Some(Err(e)) => warn!("⚠️ {command} failed: {e}"),
            None => {}
        }
        thread::sleep(Duration::from_secs(5));
        info!("Connected: {}", rig.connection_status());
    }

    rig.unsubscribe().await_result(WAIT)?;
    if rig.shutdown() {
        info!("👋 Rig stopped cleanly");
    } else {
        warn!("Rig worker had to be detached");
    }
    Ok(())
}
