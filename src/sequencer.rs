//! Timed replay of control-command sequences.
//!
//! A run is driven by one task on the bridge. Step deadlines are absolute,
//! so write latency never shifts later steps. Each step's device write and
//! actuator command are handed to the bridge without waiting for them.
//!
//! `stop()` and the "fire step i" check share one lock, so once `stop()`
//! returns no further step of that run is issued.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    actuator::ActuatorGuard,
    bridge::{BridgeHandle, OpHandle},
    error::{Result, RigError},
    session::DeviceSession,
    types::{SequenceOutcome, SequenceStep},
};

struct ActiveRun {
    generation: u64,
    token: CancellationToken,
    cursor: usize,
}

#[derive(Default)]
struct RunState {
    active: Option<ActiveRun>,
    generation: u64,
    last_outcome: Option<SequenceOutcome>,
}

struct Inner {
    bridge: BridgeHandle,
    session: Arc<DeviceSession>,
    actuator: Option<Arc<ActuatorGuard>>,
    state: Mutex<RunState>,
    running: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End the run `generation` if it is still the active one.
    ///
    /// Returns `false` when the run was already stopped or replaced.
    fn finish(&self, generation: u64, outcome: SequenceOutcome) -> bool {
        let mut state = self.state();
        if !state
            .active
            .as_ref()
            .is_some_and(|run| run.generation == generation)
        {
            return false;
        }
        state.active = None;
        state.last_outcome = Some(outcome);
        self.running.store(false, Ordering::Release);
        true
    }

    /// Issue step `index` unless the run was stopped; caller holds no lock.
    fn fire(&self, generation: u64, index: usize, step: &SequenceStep) -> bool {
        let mut state = self.state();
        match state.active.as_mut() {
            Some(run) if run.generation == generation && !run.token.is_cancelled() => {
                run.cursor = index;
            }
            _ => return false,
        }

        info!(step = index, command = %step.command, "Issuing sequence step");

        let session = Arc::clone(&self.session);
        let command = step.command;
        let _ = self.bridge.submit(move || async move {
            session.write(command).await.inspect_err(|e| {
                warn!(kind = e.kind(), step = index, %command, "Sequence step write failed: {e}");
            })
        });

        if let Some(kmh) = step.actuator_speed_kmh {
            match &self.actuator {
                // rejections and write failures are logged by the guard
                Some(actuator) => {
                    let _ = actuator.set_speed(kmh);
                }
                None => warn!(
                    kind = "not_connected",
                    step = index,
                    kmh,
                    "No actuator configured, speed ignored"
                ),
            }
        }

        drop(state);
        true
    }
}

/// Clears the active run when the driver exits without finishing it,
/// including when it panics or the bridge aborts it
struct RunGuard {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self
            .inner
            .finish(self.generation, SequenceOutcome::Failed("run aborted".to_string()))
        {
            warn!(kind = "cancelled", generation = self.generation, "Command sequence aborted");
        }
    }
}

/// Replays [`SequenceStep`]s through the device session and actuator guard
pub struct CommandSequencer {
    inner: Arc<Inner>,
}

impl CommandSequencer {
    /// Create a sequencer; without an actuator guard, step speeds are
    /// logged and ignored
    #[must_use]
    pub fn new(
        bridge: BridgeHandle,
        session: Arc<DeviceSession>,
        actuator: Option<Arc<ActuatorGuard>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridge,
                session,
                actuator,
                state: Mutex::new(RunState::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Start replaying `steps`.
    ///
    /// Step 0 is issued immediately; step `i + 1` fires when step `i`'s delay
    /// has elapsed. The returned handle resolves when the run ends.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::AlreadyRunning`] while a run is active or for an
    /// empty list, or [`RigError::Cancelled`] if the bridge is shutting down.
    pub fn start(&self, steps: Vec<SequenceStep>) -> Result<OpHandle<SequenceOutcome>> {
        if steps.is_empty() {
            warn!(kind = "already_running", "Refusing to start an empty sequence");
            return Err(RigError::AlreadyRunning);
        }
        if self.inner.bridge.is_stopping() {
            return Err(RigError::Cancelled);
        }

        let mut state = self.inner.state();
        if state.active.is_some() {
            return Err(RigError::AlreadyRunning);
        }

        state.generation += 1;
        let generation = state.generation;
        let token = CancellationToken::new();
        state.active = Some(ActiveRun {
            generation,
            token: token.clone(),
            cursor: 0,
        });
        state.last_outcome = None;
        self.inner.running.store(true, Ordering::Release);
        drop(state);

        info!(steps = steps.len(), generation, "Command sequence started");
        let inner = Arc::clone(&self.inner);
        Ok(self
            .inner
            .bridge
            .submit(move || drive(inner, steps, generation, token)))
    }

    /// Stop the active run.
    ///
    /// Idempotent: returns `false` and does nothing if no run is active. The
    /// cursor is discarded; a later `start` begins at step 0.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state();
        self.inner.running.store(false, Ordering::Release);
        let Some(run) = state.active.take() else {
            return false;
        };
        run.token.cancel();
        state.last_outcome = Some(SequenceOutcome::Stopped);
        drop(state);

        info!(step = run.cursor, "Command sequence stopped");
        true
    }

    /// Whether a run is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Index of the last issued step of the active run
    #[must_use]
    pub fn current_step(&self) -> Option<usize> {
        self.inner.state().active.as_ref().map(|run| run.cursor)
    }

    /// How the most recent run ended; `None` while running or before the first run
    #[must_use]
    pub fn last_outcome(&self) -> Option<SequenceOutcome> {
        self.inner.state().last_outcome.clone()
    }
}

async fn wait_until(token: &CancellationToken, deadline: Instant) -> bool {
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = sleep_until(deadline) => true,
    }
}

async fn drive(
    inner: Arc<Inner>,
    steps: Vec<SequenceStep>,
    generation: u64,
    token: CancellationToken,
) -> Result<SequenceOutcome> {
    let _guard = RunGuard {
        inner: Arc::clone(&inner),
        generation,
    };
    let mut deadline = Instant::now();

    for (index, step) in steps.iter().enumerate() {
        if !wait_until(&token, deadline).await {
            return Ok(SequenceOutcome::Stopped);
        }

        let next = step.delay().and_then(|delay| {
            deadline.checked_add(delay).ok_or_else(|| {
                RigError::InvalidStep(format!("delay {}s is out of range", step.delay_secs))
            })
        });
        let next = match next {
            Ok(next) => next,
            Err(e) => {
                error!(kind = e.kind(), step = index, "Aborting command sequence: {e}");
                inner.finish(generation, SequenceOutcome::Failed(e.to_string()));
                return Err(e);
            }
        };

        if !inner.fire(generation, index, step) {
            return Ok(SequenceOutcome::Stopped);
        }
        deadline = next;
    }

    if !wait_until(&token, deadline).await
        || !inner.finish(generation, SequenceOutcome::Completed)
    {
        return Ok(SequenceOutcome::Stopped);
    }
    info!(steps = steps.len(), "Command sequence completed");

    match &inner.actuator {
        Some(actuator) => {
            if let Err(e) = actuator.apply_speed(0.0).await {
                warn!(kind = e.kind(), "Stopping actuator after sequence failed: {e}");
            }
        }
        None => debug!("No actuator configured, nothing to stop"),
    }

    Ok(SequenceOutcome::Completed)
}
