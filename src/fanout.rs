//! Telemetry fan-out.
//!
//! Every consumer owns a queue and a delivery thread, so a slow or failing
//! consumer only ever delays itself. Publishing is a non-blocking enqueue.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{bridge::panic_message, error::Result, types::TelemetrySample};

/// Receiver of decoded telemetry samples.
///
/// Runs on its own thread; blocking inside `on_sample` is allowed and only
/// delays this consumer.
pub trait TelemetryConsumer: Send + 'static {
    /// Handle one sample
    ///
    /// # Errors
    ///
    /// An error is logged and the sample skipped; the consumer stays
    /// registered and keeps receiving later samples.
    fn on_sample(&mut self, sample: &TelemetrySample) -> Result<()>;
}

impl<F> TelemetryConsumer for F
where
    F: FnMut(&TelemetrySample) -> Result<()> + Send + 'static,
{
    fn on_sample(&mut self, sample: &TelemetrySample) -> Result<()> {
        self(sample)
    }
}

/// Identifies a registered consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

struct Lane {
    id: ConsumerId,
    queue: mpsc::UnboundedSender<Arc<TelemetrySample>>,
}

/// Delivers samples to registered consumers in registration order
#[derive(Default)]
pub struct TelemetryFanout {
    lanes: Mutex<Vec<Lane>>,
    next_id: AtomicU64,
}

impl TelemetryFanout {
    /// Create an empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer and start its delivery thread
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Io`](crate::RigError::Io) if the thread cannot be spawned.
    pub fn register<C: TelemetryConsumer>(&self, consumer: C) -> Result<ConsumerId> {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, samples) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name(format!("rig-telemetry-{}", id.0))
            .spawn(move || deliver(id, consumer, samples))?;

        self.lanes().push(Lane { id, queue });
        debug!(consumer = id.0, "Telemetry consumer registered");
        Ok(id)
    }

    /// Remove one consumer; its thread exits after draining queued samples.
    ///
    /// Returns `false` if the id was not registered.
    pub fn remove(&self, id: ConsumerId) -> bool {
        let mut lanes = self.lanes();
        let before = lanes.len();
        lanes.retain(|lane| lane.id != id);
        before != lanes.len()
    }

    /// Remove every consumer
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.lanes()).len();
        if removed > 0 {
            debug!(removed, "Telemetry consumers cleared");
        }
    }

    /// Number of registered consumers
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes().len()
    }

    /// Whether no consumer is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes().is_empty()
    }

    /// Queue a sample for every consumer; never blocks on a consumer
    pub fn publish(&self, sample: TelemetrySample) {
        let sample = Arc::new(sample);
        for lane in self.lanes().iter() {
            if lane.queue.send(Arc::clone(&sample)).is_err() {
                debug!(consumer = lane.id.0, "Delivery thread gone, sample dropped");
            }
        }
    }

    fn lanes(&self) -> std::sync::MutexGuard<'_, Vec<Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver<C: TelemetryConsumer>(
    id: ConsumerId,
    mut consumer: C,
    mut samples: mpsc::UnboundedReceiver<Arc<TelemetrySample>>,
) {
    while let Some(sample) = samples.blocking_recv() {
        match panic::catch_unwind(AssertUnwindSafe(|| consumer.on_sample(&sample))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    kind = "consumer",
                    consumer = id.0,
                    source = e.kind(),
                    "Telemetry consumer failed, sample skipped: {e}"
                );
            }
            Err(panic) => {
                error!(
                    kind = "consumer",
                    consumer = id.0,
                    message = %panic_message(panic.as_ref()),
                    "Telemetry consumer panicked, sample skipped"
                );
            }
        }
    }
    debug!(consumer = id.0, "Telemetry consumer detached");
}
