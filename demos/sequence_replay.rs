use bikerig::{
    ble::BtleplugTransport, program, Result, Rig, RigConfig, SequenceOutcome,
};
use std::{env, sync::Arc, thread, time::Duration};
use tracing::{error, info, warn};

const WAIT: Option<Duration> = Some(Duration::from_secs(20));

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // sequence_replay [program.csv] [log dir]
    let mut args = env::args().skip(1);
    let steps = match args.next() {
        Some(path) => program::load_steps(path)?,
        None => {
            info!("No program given, replaying the brake ramp");
            program::brake_ramp()
        }
    };
    let log_dir = args.next();

    let radio_runtime = tokio::runtime::Runtime::new()?;
    let radio = radio_runtime.block_on(BtleplugTransport::new())?;
    let rig = Rig::builder(RigConfig::default(), Arc::new(radio)).start()?;

    let found = rig.scan(Duration::from_secs(5)).await_result(WAIT)?;
    let Some(address) = found.keys().next().cloned() else {
        warn!("No fitness machine found");
        rig.shutdown();
        return Ok(());
    };
    rig.connect(address).await_result(WAIT)?;

    if let Some(dir) = log_dir {
        match rig.record_telemetry(dir).await_result(WAIT) {
            Ok(_) => info!("Recording telemetry"),
            Err(e) => warn!("Telemetry log not started: {e}"),
        }
    }

    let total = steps.len();
    let mut run = rig.start_sequence(steps)?;

    // poll once a second like the UI's status timer
    let outcome = loop {
        if let Some(result) = run.try_result() {
            break result;
        }
        if !rig.connection_status() {
            warn!("Link lost, stopping sequence");
            rig.stop_sequence();
        }
        if let Some(step) = rig.sequencer().current_step() {
            info!("▶️ step {}/{total}", step + 1);
        }
        thread::sleep(Duration::from_secs(1));
    };

    match outcome {
        Ok(SequenceOutcome::Completed) => info!("✅ Sequence completed"),
        Ok(other) => warn!("Sequence ended: {other:?}"),
        Err(e) => error!("❌ Sequence failed: {e}"),
    }

    rig.shutdown();
    Ok(())
}
