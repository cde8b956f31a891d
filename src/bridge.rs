//! Execution bridge between a single-threaded UI and device I/O.
//!
//! One OS thread owns a current-thread tokio runtime. Every submitted
//! operation becomes a task on that runtime, so operations start in
//! submission order and only interleave at their await points. Callers get an
//! [`OpHandle`] back immediately and may poll it, block on it with a timeout,
//! or `.await` it from async code.

use futures::{future::BoxFuture, FutureExt};
use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc,
    },
    task::{Context, Poll},
    thread,
    time::Duration,
};
use tokio::{
    runtime,
    sync::{
        mpsc,
        oneshot::{self, error::TryRecvError},
    },
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::BridgeConfig,
    error::{Result, RigError},
};

/// Extra time `shutdown` waits for the worker thread after the grace period
const JOIN_MARGIN: Duration = Duration::from_millis(250);

/// Type-erased unit of work queued for the worker
trait Job: Send {
    fn start(self: Box<Self>) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, error: RigError);
}

/// Sending half of an [`OpHandle`].
///
/// Dropped without a reply it resolves the handle to `Cancelled` while the
/// bridge is shutting down and to `WorkerDied` otherwise.
struct Reply<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
    stopping: Arc<AtomicBool>,
}

impl<T> Reply<T> {
    fn send(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for Reply<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let error = if self.stopping.load(Ordering::Acquire) {
                RigError::Cancelled
            } else {
                RigError::WorkerDied
            };
            let _ = tx.send(Err(error));
        }
    }
}

struct Submission<F, T> {
    op: F,
    reply: Reply<T>,
}

impl<F, Fut, T> Job for Submission<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn start(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Self { op, reply } = *self;
        async move {
            let outcome = AssertUnwindSafe(async move { op().await })
                .catch_unwind()
                .await;
            let result = outcome.unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(kind = "panicked", %message, "Submitted operation panicked");
                Err(RigError::Panicked(message))
            });
            reply.send(result);
        }
        .boxed()
    }

    fn reject(self: Box<Self>, error: RigError) {
        self.reply.send(Err(error));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Run a blocking closure on a helper thread and await its result.
///
/// Must be called from within the bridge runtime (or any tokio runtime).
pub(crate) async fn run_blocking<F, T>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => Err(RigError::Panicked(panic_message(
            join_error.into_panic().as_ref(),
        ))),
        Err(_) => Err(RigError::Cancelled),
    }
}

/// Handle to the result of one submitted operation
#[must_use = "dropping an OpHandle abandons the operation's result"]
pub struct OpHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    settled: Option<Result<T>>,
}

// never pin-projected
impl<T> Unpin for OpHandle<T> {}

impl<T> OpHandle<T> {
    fn pending(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { rx, settled: None }
    }

    /// A handle that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        let (_, rx) = oneshot::channel();
        Self {
            rx,
            settled: Some(result),
        }
    }

    /// Whether the result is available; does not consume it
    pub fn is_finished(&mut self) -> bool {
        if self.settled.is_none() {
            self.settled = self.poll_channel();
        }
        self.settled.is_some()
    }

    /// Take the result if the operation has finished.
    ///
    /// Returns `None` while the operation is pending. The result is handed
    /// out once; polling again afterwards yields `WorkerDied`.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        self.settled.take().or_else(|| self.poll_channel())
    }

    fn poll_channel(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(RigError::WorkerDied)),
        }
    }

    /// Block the calling thread until the operation finishes.
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Timeout`] if `timeout` elapses first, or the
    /// operation's own error.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime; `.await` the handle
    /// there instead.
    pub fn await_result(self, timeout: Option<Duration>) -> Result<T> {
        let waiter = runtime::Builder::new_current_thread().enable_time().build()?;
        waiter.block_on(async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, self).await {
                    Ok(result) => result,
                    Err(_) => Err(RigError::Timeout {
                        timeout_ms: millis(limit),
                    }),
                },
                None => self.await,
            }
        })
    }
}

impl<T> Future for OpHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.settled.take() {
            return Poll::Ready(result);
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(RigError::WorkerDied)))
    }
}

/// Cloneable submission side of the bridge
#[derive(Clone)]
pub struct BridgeHandle {
    jobs: mpsc::UnboundedSender<Box<dyn Job>>,
    stopping: Arc<AtomicBool>,
}

impl BridgeHandle {
    /// Queue an operation on the worker; never blocks.
    pub fn submit<F, Fut, T>(&self, op: F) -> OpHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let reply = Reply {
            tx: Some(tx),
            stopping: self.stopping.clone(),
        };

        if let Err(mpsc::error::SendError(job)) = self.jobs.send(Box::new(Submission { op, reply }))
        {
            let error = if self.stopping.load(Ordering::Acquire) {
                RigError::Cancelled
            } else {
                RigError::WorkerDied
            };
            debug!(kind = error.kind(), "Submission rejected, worker not running");
            job.reject(error);
        }

        OpHandle::pending(rx)
    }

    /// Queue a blocking closure; it runs on a short-lived helper thread so it
    /// cannot stall other operations on the worker.
    pub fn submit_blocking<F, T>(&self, op: F) -> OpHandle<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(move || run_blocking(op))
    }

    /// Whether shutdown has been requested
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Owner of the background execution context
pub struct Bridge {
    handle: BridgeHandle,
    shutdown: CancellationToken,
    worker: Option<thread::JoinHandle<()>>,
    exited: std_mpsc::Receiver<()>,
    grace: Duration,
}

impl Bridge {
    /// Spawn the worker thread and its runtime
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Io`] if the runtime or the thread cannot be created.
    pub fn start(config: &BridgeConfig) -> Result<Self> {
        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = std_mpsc::channel();
        let shutdown = CancellationToken::new();
        let grace = config.shutdown_grace();

        let token = shutdown.clone();
        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                runtime.block_on(run_worker(jobs_rx, token, grace));
                runtime.shutdown_background();
                let _ = exit_tx.send(());
            })?;

        info!(thread = %config.thread_name, "Execution bridge started");

        Ok(Self {
            handle: BridgeHandle {
                jobs: jobs_tx,
                stopping: Arc::new(AtomicBool::new(false)),
            },
            shutdown,
            worker: Some(worker),
            exited: exit_rx,
            grace,
        })
    }

    /// Cloneable submission handle for components that issue work
    #[must_use]
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// See [`BridgeHandle::submit`]
    pub fn submit<F, Fut, T>(&self, op: F) -> OpHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.submit(op)
    }

    /// See [`BridgeHandle::submit_blocking`]
    pub fn submit_blocking<F, T>(&self, op: F) -> OpHandle<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.submit_blocking(op)
    }

    /// Whether the worker thread is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// Stop the worker.
    ///
    /// Queued operations resolve to `Cancelled`; in-flight ones get the grace
    /// period to finish and are aborted afterwards. Returns `false` if the
    /// worker did not exit within the bound and was detached.
    pub fn shutdown(mut self) -> bool {
        self.request_stop();

        match self.exited.recv_timeout(self.grace + JOIN_MARGIN) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.take() {
                    if worker.join().is_err() {
                        error!(kind = "worker_died", "Bridge worker panicked");
                    }
                }
                info!("Execution bridge stopped");
                true
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    grace_ms = millis(self.grace),
                    "Bridge worker did not exit in time, detaching"
                );
                self.worker.take();
                false
            }
        }
    }

    fn request_stop(&self) {
        self.handle.stopping.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.request_stop();
    }
}

async fn run_worker(
    mut jobs: mpsc::UnboundedReceiver<Box<dyn Job>>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => {
                    tasks.spawn(job.start());
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(join_error) = joined {
                    warn!(kind = "panicked", "Bridge task ended abnormally: {join_error}");
                }
            }
        }
    }

    jobs.close();
    let mut rejected = 0_usize;
    while let Ok(job) = jobs.try_recv() {
        job.reject(RigError::Cancelled);
        rejected += 1;
    }
    if rejected > 0 {
        debug!(rejected, "Cancelled queued operations");
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(
            remaining = tasks.len(),
            grace_ms = millis(grace),
            "In-flight operations exceeded shutdown grace, aborting"
        );
        tasks.shutdown().await;
    }
}
